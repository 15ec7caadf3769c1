//! Static facts about the ERA5 archive on the Copernicus Climate Data Store.
//!
//! Everything here is archive-specific: product names, the per-request item
//! quota, the pressure level catalogue and the versioned rename tables that map
//! archive-native field names to the canonical schema.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Maximum number of items (variable x level x time x day) per CDS request.
pub const DEFAULT_QUOTA: usize = 120_000;

pub const DEFAULT_API_URL: &str = "https://cds.climate.copernicus.eu/api/v2";

/// File stem of the one-off surface geopotential field.
pub const SURFACE_GEOPOTENTIAL_STEM: &str = "surface_geopotential";

/// Every pressure level (hPa) ERA5 publishes.
pub const PRESSURE_LEVELS: [&str; 37] = [
    "1", "2", "3", "5", "7", "10", "20", "30", "50", "70", "100", "125", "150", "175", "200",
    "225", "250", "300", "350", "400", "450", "500", "550", "600", "650", "700", "750", "775",
    "800", "825", "850", "875", "900", "925", "950", "975", "1000",
];

/// Pressure levels inside the closed interval `[min, max]`, in catalogue order.
pub fn pressure_levels_between(min: u32, max: u32) -> Vec<String> {
    PRESSURE_LEVELS
        .iter()
        .filter(|l| l.parse::<u32>().is_ok_and(|p| min <= p && p <= max))
        .map(|l| l.to_string())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Product {
    PressureLevels,
    SingleLevels,
}

impl Product {
    pub fn dataset_name(self) -> &'static str {
        match self {
            Product::PressureLevels => "reanalysis-era5-pressure-levels",
            Product::SingleLevels => "reanalysis-era5-single-levels",
        }
    }

    /// Canonical fields a merged dataset of this product must carry.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            Product::PressureLevels => &["time", "lat", "lon", "Temperature", "Geopotential"],
            Product::SingleLevels => &["time", "lat", "lon", "2 metre temperature"],
        }
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dataset_name())
    }
}

/// Accepts the short selectors `pl`/`sl` as well as full dataset names.
impl FromStr for Product {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "pl" | "reanalysis-era5-pressure-levels" => Ok(Product::PressureLevels),
            "sl" | "reanalysis-era5-single-levels" => Ok(Product::SingleLevels),
            other => Err(Error::Configuration(format!("unknown product: {other}"))),
        }
    }
}

/// A versioned mapping from archive-native names to canonical names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenameTable {
    pub version: &'static str,
    pub entries: &'static [(&'static str, &'static str)],
}

impl RenameTable {
    pub fn canonical_name(&self, native: &str) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|(from, _)| *from == native)
            .map(|(_, to)| *to)
    }
}

pub const RENAME_V1: RenameTable = RenameTable {
    version: "v1",
    entries: &[
        ("latitude", "lat"),
        ("longitude", "lon"),
        ("t", "Temperature"),
        ("z", "Geopotential"),
        ("t2m", "2 metre temperature"),
    ],
};

pub const RENAME_TABLES: &[RenameTable] = &[RENAME_V1];

pub fn rename_table(version: &str) -> Result<&'static RenameTable> {
    RENAME_TABLES
        .iter()
        .find(|t| t.version == version)
        .ok_or_else(|| Error::Configuration(format!("unknown rename table version: {version}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pressure_levels_filtered_by_interval() {
        assert_eq!(
            pressure_levels_between(500, 650),
            vec!["500", "550", "600", "650"]
        );
        assert_eq!(pressure_levels_between(500, 1000).len(), 16);
        assert!(pressure_levels_between(1001, 2000).is_empty());
    }

    #[test]
    fn product_selectors() {
        assert_eq!("pl".parse::<Product>().unwrap(), Product::PressureLevels);
        assert_eq!(
            "reanalysis-era5-single-levels".parse::<Product>().unwrap(),
            Product::SingleLevels
        );
        assert!("xx".parse::<Product>().is_err());
    }

    #[test]
    fn rename_table_lookup() {
        let t = rename_table("v1").unwrap();
        assert_eq!(t.canonical_name("latitude"), Some("lat"));
        assert_eq!(t.canonical_name("unknown"), None);
        assert!(rename_table("v0").is_err());
    }
}
