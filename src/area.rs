use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default padding (degrees) added around a reference grid.
pub const DEFAULT_BUFFER: f64 = 0.25;

/// Spatial extent of a reference grid, e.g. a DEM in WGS84.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl Extent {
    /// Extent covered by a set of cell-centre coordinates.
    pub fn from_coords(lats: &[f64], lons: &[f64]) -> Result<Self> {
        let (south, north) = min_max(lats)
            .ok_or_else(|| Error::Configuration("reference grid has no latitudes".into()))?;
        let (west, east) = min_max(lons)
            .ok_or_else(|| Error::Configuration("reference grid has no longitudes".into()))?;
        Ok(Self {
            north,
            south,
            east,
            west,
        })
    }
}

fn min_max(xs: &[f64]) -> Option<(f64, f64)> {
    xs.iter()
        .copied()
        .filter(|x| x.is_finite())
        .fold(None, |acc, x| match acc {
            None => Some((x, x)),
            Some((lo, hi)) => Some((lo.min(x), hi.max(x))),
        })
}

/// Area in the archive's `[north, west, south, east]` order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    north: f64,
    west: f64,
    south: f64,
    east: f64,
}

impl BoundingBox {
    pub fn new(north: f64, west: f64, south: f64, east: f64) -> Result<Self> {
        if !(north > south) || !(east > west) {
            return Err(Error::Configuration(format!(
                "degenerate bounding box [N {north}, W {west}, S {south}, E {east}]"
            )));
        }
        Ok(Self {
            north,
            west,
            south,
            east,
        })
    }

    /// Pad `extent` by `buffer` degrees on every side.
    pub fn around(extent: &Extent, buffer: f64) -> Result<Self> {
        if !(extent.north > extent.south) || !(extent.east > extent.west) {
            return Err(Error::Configuration(
                "reference grid has zero spatial extent".into(),
            ));
        }
        if !(buffer >= 0.0) {
            return Err(Error::Configuration(format!(
                "area buffer must be >= 0, got {buffer}"
            )));
        }
        Self::new(
            extent.north + buffer,
            extent.west - buffer,
            extent.south - buffer,
            extent.east + buffer,
        )
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.north, self.west, self.south, self.east]
    }

    pub fn north(&self) -> f64 {
        self.north
    }

    pub fn west(&self) -> f64 {
        self.west
    }

    pub fn south(&self) -> f64 {
        self.south
    }

    pub fn east(&self) -> f64 {
        self.east
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_every_side() {
        let extent = Extent {
            north: 40.0,
            south: 38.0,
            east: 101.0,
            west: 99.5,
        };
        let area = BoundingBox::around(&extent, DEFAULT_BUFFER).unwrap();
        assert_eq!(area.to_array(), [40.25, 99.25, 37.75, 101.25]);
    }

    #[test]
    fn rejects_zero_extent() {
        let point = Extent {
            north: 40.0,
            south: 40.0,
            east: 100.0,
            west: 99.0,
        };
        assert!(matches!(
            BoundingBox::around(&point, 0.25),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn extent_from_coords_ignores_nan() {
        let e = Extent::from_coords(&[10.0, f64::NAN, 5.0], &[1.0, 3.0]).unwrap();
        assert_eq!((e.south, e.north, e.west, e.east), (5.0, 10.0, 1.0, 3.0));
        assert!(Extent::from_coords(&[], &[1.0]).is_err());
    }

    #[test]
    fn new_enforces_orientation() {
        assert!(BoundingBox::new(10.0, 0.0, 20.0, 5.0).is_err());
        assert!(BoundingBox::new(10.0, 5.0, 0.0, 5.0).is_err());
    }
}
