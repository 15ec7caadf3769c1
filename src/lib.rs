#![forbid(unsafe_code)]

//! Quota-aware acquisition of ERA5 reanalysis fields.
//!
//! A date range is expanded into year/month/day/time tokens, split into
//! sub-requests that each stay under the archive's per-request item quota,
//! and fetched one window at a time. Every window lands in its own fragment
//! file; a fragment that already exists is never fetched again, so an
//! interrupted run resumes where it stopped. Fragments are then merged along
//! time (optionally as daily means) and normalized to canonical field names.
//!
//! **Quick start**
//! ```no_run
//! use era5_harvest::{
//!     CalendarGrid, CdsClient, ClientOptions, DateSpec, Extent, HarvestOptions, Harvester,
//!     Product,
//! };
//!
//! // Credentials come from ~/.cdsapirc or CDSAPI_URL / CDSAPI_KEY.
//! let client = CdsClient::new(ClientOptions::default())?;
//! let harvester = Harvester::new(
//!     HarvestOptions {
//!         folder: "era5".into(),
//!         ..HarvestOptions::default()
//!     },
//!     client,
//! )?;
//!
//! let spec = DateSpec::new().start("2020-01-01").end("2020-12-31").freq("D");
//! let grid = CalendarGrid::generate(&spec, None)?;
//! let area = harvester.area_around(&Extent {
//!     north: 47.0,
//!     south: 45.5,
//!     east: 11.0,
//!     west: 9.5,
//! })?;
//!
//! harvester.retrieve_single_levels(&grid, &area)?;
//! let summary = harvester.merge(Product::SingleLevels, None, true, true)?;
//! println!("{} days in {}", summary.timesteps, summary.output.display());
//! # Ok::<(), era5_harvest::Error>(())
//! ```
//!
//! **Pressure levels**
//! ```no_run
//! use era5_harvest::{
//!     BoundingBox, CalendarGrid, CdsClient, ClientOptions, DateSpec, HarvestOptions, Harvester,
//!     pressure_levels_between,
//! };
//!
//! let harvester = Harvester::new(HarvestOptions::default(), CdsClient::new(ClientOptions::default())?)?;
//! let spec = DateSpec::new().start("2017").end("2023-12-31").freq("6H");
//! let grid = CalendarGrid::generate(&spec, Some(&["00:00", "06:00", "12:00", "18:00"][..]))?;
//! let area = BoundingBox::new(47.25, 9.25, 45.25, 11.25)?;
//! let report = harvester.retrieve_pressure_levels(&pressure_levels_between(300, 1000), &grid, &area)?;
//! println!("{} fetched, {} already present", report.fetched.len(), report.skipped.len());
//! # Ok::<(), era5_harvest::Error>(())
//! ```
//!
//! Notes:
//! - Retrieval is synchronous and sequential; there is no retry policy.
//! - Fragments and outputs are written atomically through an [`ArtifactStore`].
//! - The default container is netCDF ([`NetcdfFormat`]), which needs libnetcdf
//!   at build time. The container also picks the `format` keyword sent to the
//!   archive.

mod archive;
mod area;
mod cache;
mod client;
mod dataset;
mod date;
mod error;
mod harvest;
mod merge;
mod netcdf_format;
mod normalize;
mod partition;
mod request;
mod store;

pub use crate::archive::{
    DEFAULT_API_URL, DEFAULT_QUOTA, PRESSURE_LEVELS, Product, RENAME_TABLES,
    RENAME_V1, RenameTable, SURFACE_GEOPOTENTIAL_STEM, pressure_levels_between, rename_table,
};
pub use crate::area::{BoundingBox, DEFAULT_BUFFER, Extent};
pub use crate::cache::{Fragment, Outcome, RetrievalCache, RunReport};
pub use crate::client::{
    CdsClient, ClientOptions, Credentials, RetrievalService, TaskState, task_state,
};
pub use crate::dataset::{
    Coordinate, Dataset, DatasetFormat, JsonFormat, STANDARD_CALENDAR, TIME, TimeEncoding,
    TimeUnit, Variable,
};
pub use crate::date::{
    CalendarGrid, DateRange, DateSpec, Frequency, all_hours, days_in_month, parse_date_like,
};
pub use crate::error::{Error, Result};
pub use crate::harvest::{HarvestOptions, Harvester};
pub use crate::merge::{MergeSummary, Merger};
pub use crate::netcdf_format::NetcdfFormat;
pub use crate::normalize::{LATITUDE, Normalizer};
pub use crate::partition::{Partitioner, RequestWindow};
pub use crate::request::{Request, RequestValue};
pub use crate::store::{ArtifactStore, FsStore, MemoryStore};
