use std::collections::BTreeMap;

use tracing::debug;

use crate::archive::{RENAME_V1, RenameTable};
use crate::dataset::{Coordinate, Dataset, TIME, TimeEncoding};
use crate::error::{Error, Result};

pub const LATITUDE: &str = "lat";

/// Renames archive fields to the canonical schema, orders latitude ascending
/// and pins the time encoding to epoch seconds. Applying it twice is the same
/// as applying it once.
#[derive(Debug, Clone)]
pub struct Normalizer {
    table: &'static RenameTable,
    required: Vec<String>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(&RENAME_V1)
    }
}

impl Normalizer {
    pub fn new(table: &'static RenameTable) -> Self {
        Self {
            table,
            required: Vec::new(),
        }
    }

    /// Canonical fields that must be present after renaming.
    pub fn require<S: AsRef<str>>(mut self, fields: &[S]) -> Self {
        self.required
            .extend(fields.iter().map(|f| f.as_ref().to_string()));
        self
    }

    pub fn table_version(&self) -> &'static str {
        self.table.version
    }

    pub fn normalize(&self, mut ds: Dataset) -> Result<Dataset> {
        ds.validate()
            .map_err(|e| Error::Normalization(format!("inconsistent dataset: {e}")))?;
        self.rename(&mut ds)?;
        sort_latitude(&mut ds)?;

        if let Some(Coordinate::Time { encoding, .. }) = ds.coords.get_mut(TIME) {
            *encoding = TimeEncoding::epoch_seconds();
        }

        for field in &self.required {
            if !ds.contains(field) {
                return Err(Error::Normalization(format!(
                    "required field {field} is missing"
                )));
            }
        }
        Ok(ds)
    }

    fn canonical(&self, name: &str) -> String {
        self.table
            .canonical_name(name)
            .map(str::to_string)
            .unwrap_or_else(|| name.to_string())
    }

    fn rename(&self, ds: &mut Dataset) -> Result<()> {
        let mut coords = BTreeMap::new();
        for (name, coord) in std::mem::take(&mut ds.coords) {
            let to = self.canonical(&name);
            if coords.insert(to.clone(), coord).is_some() {
                return Err(Error::Normalization(format!(
                    "renaming {name} collides with existing coordinate {to}"
                )));
            }
        }

        let mut variables = BTreeMap::new();
        for (name, mut var) in std::mem::take(&mut ds.variables) {
            for d in var.dims.iter_mut() {
                *d = self.canonical(d);
            }
            let to = self.canonical(&name);
            if coords.contains_key(&to) || variables.insert(to.clone(), var).is_some() {
                return Err(Error::Normalization(format!(
                    "renaming {name} collides with existing field {to}"
                )));
            }
        }

        ds.coords = coords;
        ds.variables = variables;
        Ok(())
    }
}

fn sort_latitude(ds: &mut Dataset) -> Result<()> {
    let Some(Coordinate::Values(lat)) = ds.coords.get(LATITUDE) else {
        return Ok(());
    };
    if lat.windows(2).all(|w| w[0] < w[1]) {
        return Ok(());
    }

    let mut perm: Vec<usize> = (0..lat.len()).collect();
    perm.sort_by(|&a, &b| lat[a].total_cmp(&lat[b]));
    let sorted: Vec<f64> = perm.iter().map(|&i| lat[i]).collect();
    if !sorted.windows(2).all(|w| w[0] < w[1]) {
        return Err(Error::Normalization(
            "latitude cannot be made strictly ascending".into(),
        ));
    }
    debug!(n = sorted.len(), "reordering latitude ascending");

    let shapes: Vec<(String, Vec<usize>)> = ds
        .variables
        .iter()
        .filter(|(_, v)| v.dims.iter().any(|d| d == LATITUDE))
        .map(|(name, v)| -> Result<(String, Vec<usize>)> { Ok((name.clone(), ds.shape(v)?)) })
        .collect::<Result<_>>()?;

    for (name, shape) in shapes {
        if let Some(var) = ds.variables.get_mut(&name) {
            let axis = var
                .dims
                .iter()
                .position(|d| d == LATITUDE)
                .ok_or_else(|| Error::Normalization(format!("{name} lost its latitude")))?;
            var.data = permute_axis(&var.data, &shape, axis, &perm);
        }
    }
    ds.coords
        .insert(LATITUDE.to_string(), Coordinate::Values(sorted));
    Ok(())
}

/// Reorder a row-major array along `axis` so that output index `i` holds input
/// index `perm[i]`.
pub(crate) fn permute_axis(data: &[f64], shape: &[usize], axis: usize, perm: &[usize]) -> Vec<f64> {
    let outer: usize = shape[..axis].iter().product();
    let inner: usize = shape[axis + 1..].iter().product();
    let n = shape[axis];

    let mut out = Vec::with_capacity(data.len());
    for o in 0..outer {
        for &src in perm {
            let start = (o * n + src) * inner;
            out.extend_from_slice(&data[start..start + inner]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::dataset::{TimeUnit, Variable};

    fn era5_like() -> Dataset {
        let mut ds = Dataset::new();
        let epoch = NaiveDate::from_ymd_opt(1900, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        ds.coords.insert(
            "time".into(),
            Coordinate::Time {
                values: vec![epoch + chrono::Duration::hours(1_051_896)],
                encoding: TimeEncoding {
                    unit: TimeUnit::Hours,
                    epoch,
                    calendar: "gregorian".into(),
                },
            },
        );
        ds.coords
            .insert("latitude".into(), Coordinate::Values(vec![10.0, 5.0, 0.0]));
        ds.coords
            .insert("longitude".into(), Coordinate::Values(vec![100.0, 101.0]));
        ds.variables.insert(
            "t2m".into(),
            Variable::new(
                &["time", "latitude", "longitude"],
                vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            ),
        );
        ds.variables
            .insert("mask".into(), Variable::new(&["longitude"], vec![1.0, 0.0]));
        ds
    }

    #[test]
    fn renames_and_sorts_latitude() {
        let ds = Normalizer::default().normalize(era5_like()).unwrap();

        assert!(ds.coords.contains_key("lat"));
        assert!(ds.coords.contains_key("lon"));
        assert!(!ds.coords.contains_key("latitude"));
        assert_eq!(ds.coords["lat"], Coordinate::Values(vec![0.0, 5.0, 10.0]));

        let t = &ds.variables["2 metre temperature"];
        assert_eq!(t.dims, vec!["time", "lat", "lon"]);
        assert_eq!(t.data, vec![5.0, 6.0, 3.0, 4.0, 1.0, 2.0]);
        // Unknown fields pass through.
        assert_eq!(ds.variables["mask"].data, vec![1.0, 0.0]);

        let Some(Coordinate::Time { encoding, values }) = ds.coords.get("time") else {
            panic!("time coordinate missing");
        };
        assert_eq!(*encoding, TimeEncoding::epoch_seconds());
        assert_eq!(values[0].to_string(), "2020-01-01 00:00:00");
    }

    #[test]
    fn normalizing_twice_is_a_no_op() {
        let n = Normalizer::default();
        let once = n.normalize(era5_like()).unwrap();
        let twice = n.normalize(once.clone()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn missing_required_field_fails() {
        let n = Normalizer::default().require(&["lat", "Temperature"]);
        let err = n.normalize(era5_like()).unwrap_err();
        assert!(matches!(err, Error::Normalization(m) if m.contains("Temperature")));
    }

    #[test]
    fn rename_collisions_are_reported() {
        let mut ds = era5_like();
        ds.coords.insert("lat".into(), Coordinate::Values(vec![1.0]));
        assert!(matches!(
            Normalizer::default().normalize(ds),
            Err(Error::Normalization(_))
        ));
    }

    #[test]
    fn duplicate_latitudes_are_rejected() {
        let mut ds = Dataset::new();
        ds.coords
            .insert("lat".into(), Coordinate::Values(vec![5.0, 5.0, 0.0]));
        assert!(Normalizer::default().normalize(ds).is_err());
    }

    #[test]
    fn inconsistent_shapes_are_rejected_before_sorting() {
        let mut ds = Dataset::new();
        ds.coords
            .insert("lat".into(), Coordinate::Values(vec![10.0, 5.0, 0.0]));
        ds.variables
            .insert("t".into(), Variable::new(&["lat"], vec![1.0, 2.0]));
        let err = Normalizer::default().normalize(ds).unwrap_err();
        assert!(matches!(err, Error::Normalization(m) if m.contains("inconsistent")));
    }

    #[test]
    fn permutes_middle_axis() {
        // shape [2, 3, 1], reverse axis 1
        let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert_eq!(
            permute_axis(&data, &[2, 3, 1], 1, &[2, 1, 0]),
            vec![3.0, 2.0, 1.0, 6.0, 5.0, 4.0]
        );
    }
}
