use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::archive::{DEFAULT_QUOTA, Product, SURFACE_GEOPOTENTIAL_STEM, rename_table};
use crate::area::{BoundingBox, DEFAULT_BUFFER, Extent};
use crate::cache::{Outcome, RetrievalCache, RunReport};
use crate::client::RetrievalService;
use crate::dataset::DatasetFormat;
use crate::date::CalendarGrid;
use crate::error::{Error, Result};
use crate::merge::{MergeSummary, Merger};
use crate::netcdf_format::NetcdfFormat;
use crate::normalize::Normalizer;
use crate::partition::Partitioner;
use crate::request::Request;
use crate::store::{ArtifactStore, FsStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestOptions {
    /// Where fragment files are downloaded to.
    pub folder: PathBuf,
    /// Merged and formatted outputs; relative paths live under `folder`.
    pub result_dir: PathBuf,
    pub quota: usize,
    pub product_type: String,
    pub area_buffer: f64,
    pub rename_table: String,
}

impl Default for HarvestOptions {
    fn default() -> Self {
        Self {
            folder: PathBuf::from("."),
            result_dir: PathBuf::from("result"),
            quota: DEFAULT_QUOTA,
            product_type: "reanalysis".to_string(),
            area_buffer: DEFAULT_BUFFER,
            rename_table: "v1".to_string(),
        }
    }
}

impl HarvestOptions {
    /// Load options from a JSON file; missing keys take their defaults.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read options {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn resolved_result_dir(&self) -> PathBuf {
        if self.result_dir.is_absolute() {
            self.result_dir.clone()
        } else {
            self.folder.join(&self.result_dir)
        }
    }
}

/// Drives acquisition and assembly of ERA5 fields for one data folder.
///
/// The container `F` decides the `format` keyword sent to the archive, the
/// fragment extension and how fragments are decoded.
pub struct Harvester<S, A = FsStore, F = NetcdfFormat> {
    opts: HarvestOptions,
    service: S,
    store: A,
    format: F,
    normalizer: Normalizer,
}

impl<S: RetrievalService> Harvester<S> {
    pub fn new(opts: HarvestOptions, service: S) -> Result<Self> {
        Self::with_store(opts, service, FsStore, NetcdfFormat)
    }
}

impl<S, A, F> Harvester<S, A, F>
where
    S: RetrievalService,
    A: ArtifactStore,
    F: DatasetFormat,
{
    pub fn with_store(opts: HarvestOptions, service: S, store: A, format: F) -> Result<Self> {
        Partitioner::new(opts.quota)?;
        let normalizer = Normalizer::new(rename_table(&opts.rename_table)?);
        Ok(Self {
            opts,
            service,
            store,
            format,
            normalizer,
        })
    }

    pub fn options(&self) -> &HarvestOptions {
        &self.opts
    }

    pub fn store(&self) -> &A {
        &self.store
    }

    pub fn folder(&self) -> &Path {
        &self.opts.folder
    }

    pub fn result_dir(&self) -> PathBuf {
        self.opts.resolved_result_dir()
    }

    /// Archive area covering `extent` plus the configured buffer.
    pub fn area_around(&self, extent: &Extent) -> Result<BoundingBox> {
        BoundingBox::around(extent, self.opts.area_buffer)
    }

    fn cache(&self) -> RetrievalCache<'_> {
        RetrievalCache::new(
            &self.service,
            &self.store,
            &self.opts.folder,
            self.format.extension(),
        )
    }

    fn merger(&self) -> Merger<'_> {
        Merger::new(&self.store, &self.format, &self.opts.folder, self.result_dir())
    }

    fn base_request(&self, area: &BoundingBox) -> Request {
        Request::new()
            .product_type(self.opts.product_type.as_str())
            .format(self.format.wire_format())
            .area(area.to_array())
    }

    /// Geopotential and temperature on `levels` for every date of `grid`.
    pub fn retrieve_pressure_levels(
        &self,
        levels: &[String],
        grid: &CalendarGrid,
        area: &BoundingBox,
    ) -> Result<RunReport> {
        if levels.is_empty() {
            return Err(Error::Configuration("no pressure levels requested".into()));
        }
        let product = Product::PressureLevels;
        let base = self
            .base_request(area)
            .variable(["geopotential", "temperature"])
            .pressure_level(levels);
        let windows = Partitioner::new(self.opts.quota)?.split(grid, levels.len() * 2)?;
        info!(%product, windows = windows.len(), "retrieving pressure levels");
        self.cache()
            .retrieve_all(product.dataset_name(), &windows, &base)
    }

    /// Surface geopotential (once) and 2 m temperature for every date of `grid`.
    pub fn retrieve_single_levels(&self, grid: &CalendarGrid, area: &BoundingBox) -> Result<RunReport> {
        let product = Product::SingleLevels;
        let cache = self.cache();

        let geopotential = self
            .base_request(area)
            .variable("geopotential")
            .year(vec!["1979"])
            .month(vec!["01"])
            .day(vec!["01"])
            .time(vec!["12:00"]);
        let outcome = cache.ensure(product.dataset_name(), &geopotential, &self.geopotential_path())?;

        let base = self.base_request(area).variable("2m_temperature");
        let windows = Partitioner::new(self.opts.quota)?.split(grid, 1)?;
        info!(%product, windows = windows.len(), "retrieving single levels");
        let mut report = cache.retrieve_all(product.dataset_name(), &windows, &base)?;

        match outcome {
            Outcome::Skipped(p) => report.skipped.insert(0, p),
            Outcome::Fetched { path, .. } => report.fetched.insert(0, path),
        }
        Ok(report)
    }

    /// Downloaded surface geopotential field.
    pub fn geopotential_path(&self) -> PathBuf {
        self.opts.folder.join(format!(
            "{SURFACE_GEOPOTENTIAL_STEM}.{}",
            self.format.extension()
        ))
    }

    /// Merge all fragments of `product`, optionally reducing to daily means and
    /// normalizing to the canonical schema.
    pub fn merge(
        &self,
        product: Product,
        merged_file: Option<&Path>,
        daily: bool,
        normalize: bool,
    ) -> Result<MergeSummary> {
        let normalizer = self.normalizer.clone().require(product.required_fields());
        self.merger().merge_to(
            product.dataset_name(),
            merged_file,
            daily,
            normalize.then_some(&normalizer),
        )
    }

    /// Normalize one file; the output defaults to the same name in the result
    /// directory.
    pub fn format_file(&self, input: &Path, output: Option<&Path>) -> Result<PathBuf> {
        let output = match output {
            Some(p) => p.to_path_buf(),
            None => {
                let name = input.file_name().ok_or_else(|| {
                    Error::Configuration(format!("{} has no file name", input.display()))
                })?;
                self.result_dir().join(name)
            }
        };

        let ds = self.format.decode(&self.store.read(input)?)?;
        let ds = self.normalizer.normalize(ds)?;
        self.store.write_with(&output, &mut |w: &mut dyn Write| -> Result<()> {
            self.format.encode(&ds, w)
        })?;
        info!(input = %input.display(), output = %output.display(), "formatted");
        Ok(output)
    }

    /// Merged pressure-level output: `name` in the result directory, or the
    /// first merged file found there.
    pub fn pressure_level_output(&self, name: Option<&str>) -> Result<PathBuf> {
        self.output_for(Product::PressureLevels, name)
    }

    pub fn single_level_output(&self, name: Option<&str>) -> Result<PathBuf> {
        self.output_for(Product::SingleLevels, name)
    }

    pub fn geopotential_output(&self, name: Option<&str>) -> PathBuf {
        match name {
            Some(n) => self.result_dir().join(n),
            None => self.result_dir().join(format!(
                "{SURFACE_GEOPOTENTIAL_STEM}.{}",
                self.format.extension()
            )),
        }
    }

    fn output_for(&self, product: Product, name: Option<&str>) -> Result<PathBuf> {
        let dir = self.result_dir();
        if let Some(n) = name {
            return Ok(dir.join(n));
        }
        let suffix = format!(".{}", self.format.extension());
        self.store
            .list(&dir)?
            .into_iter()
            .find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(product.dataset_name()) && n.ends_with(&suffix))
            })
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "no merged {product} file in {}",
                    dir.display()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use chrono::{NaiveDate, NaiveTime};

    use super::*;
    use crate::archive::pressure_levels_between;
    use crate::dataset::{Coordinate, Dataset, JsonFormat, TIME, TimeEncoding, Variable};
    use crate::date::DateSpec;
    use crate::store::MemoryStore;

    /// Answers every request with a synthetic ERA5-shaped dataset in the
    /// container named by the `format` keyword.
    #[derive(Default)]
    struct FakeCds {
        requests: RefCell<Vec<(String, Request)>>,
        closed: bool,
    }

    impl FakeCds {
        fn answer(request: &Request) -> Dataset {
            let tokens = |k: &str| request.get(k).map(|v| v.as_strings()).unwrap_or_default();
            let mut times = Vec::new();
            for y in tokens("year") {
                for m in tokens("month") {
                    for d in tokens("day") {
                        let date = NaiveDate::from_ymd_opt(
                            y.parse().unwrap(),
                            m.parse().unwrap(),
                            d.parse().unwrap(),
                        );
                        let Some(date) = date else { continue };
                        for t in tokens("time") {
                            let t = NaiveTime::parse_from_str(&t, "%H:%M").unwrap();
                            times.push(date.and_time(t));
                        }
                    }
                }
            }
            times.sort();

            let mut ds = Dataset::new();
            ds.coords.insert(
                TIME.into(),
                Coordinate::Time {
                    values: times.clone(),
                    encoding: TimeEncoding::parse("hours since 1900-01-01", None).unwrap(),
                },
            );
            ds.coords
                .insert("latitude".into(), Coordinate::Values(vec![40.0, 39.75]));
            ds.coords
                .insert("longitude".into(), Coordinate::Values(vec![100.0]));

            let levels = tokens("pressure_level");
            let per_time = 2 * levels.len().max(1);
            let data: Vec<f64> = (0..times.len() * per_time).map(|i| i as f64).collect();
            let variables = tokens("variable");
            if levels.is_empty() {
                let name = if variables == ["2m_temperature"] { "t2m" } else { "z" };
                ds.variables.insert(
                    name.into(),
                    Variable::new(&["time", "latitude", "longitude"], data),
                );
            } else {
                let lv: Vec<f64> = levels.iter().map(|l| l.parse().unwrap()).collect();
                ds.coords.insert("level".into(), Coordinate::Values(lv));
                for name in ["t", "z"] {
                    ds.variables.insert(
                        name.into(),
                        Variable::new(&["time", "level", "latitude", "longitude"], data.clone()),
                    );
                }
            }
            ds
        }
    }

    impl RetrievalService for FakeCds {
        fn fetch(&self, dataset: &str, request: &Request, sink: &mut dyn Write) -> Result<u64> {
            self.requests
                .borrow_mut()
                .push((dataset.to_string(), request.clone()));
            if self.closed {
                return Err(Error::Archive("queue closed".into()));
            }
            let format = request.get("format").map(|v| v.as_strings()).unwrap_or_default();
            let mut buf = Vec::new();
            match format.first().map(String::as_str) {
                Some("json") => JsonFormat.encode(&Self::answer(request), &mut buf)?,
                Some("netcdf") => NetcdfFormat.encode(&Self::answer(request), &mut buf)?,
                other => return Err(Error::Archive(format!("unsupported format {other:?}"))),
            }
            sink.write_all(&buf)?;
            Ok(buf.len() as u64)
        }
    }

    fn with_format<F: DatasetFormat>(quota: usize, format: F) -> Harvester<FakeCds, MemoryStore, F> {
        let opts = HarvestOptions {
            folder: PathBuf::from("data"),
            quota,
            ..HarvestOptions::default()
        };
        Harvester::with_store(opts, FakeCds::default(), MemoryStore::new(), format).unwrap()
    }

    fn harvester(quota: usize) -> Harvester<FakeCds, MemoryStore, JsonFormat> {
        with_format(quota, JsonFormat)
    }

    fn area<F: DatasetFormat>(h: &Harvester<FakeCds, MemoryStore, F>) -> BoundingBox {
        h.area_around(&Extent {
            north: 40.0,
            south: 39.75,
            east: 100.25,
            west: 100.0,
        })
        .unwrap()
    }

    #[test]
    fn single_levels_end_to_end() {
        let h = harvester(10);
        let spec = DateSpec::new().start("2020-01-30").end("2020-02-02").freq("D");
        let grid = CalendarGrid::generate(&spec, Some(&["00:00", "12:00"][..])).unwrap();

        let report = h.retrieve_single_levels(&grid, &area(&h)).unwrap();
        // geopotential + Jan + Feb
        assert_eq!(report.fetched.len(), 3);
        assert_eq!(report.fetched[0], PathBuf::from("data/surface_geopotential.json"));

        let requests = h.service.requests.borrow();
        let (name, first) = &requests[0];
        assert_eq!(name, "reanalysis-era5-single-levels");
        assert_eq!(first.get("year").unwrap().as_strings(), vec!["1979"]);
        let (_, jan) = &requests[1];
        assert_eq!(jan.get("area").unwrap().as_strings(), vec!["40.25", "99.75", "39.5", "100.5"]);
        assert_eq!(jan.get("format").unwrap().as_strings(), vec!["json"]);
        drop(requests);

        let summary = h.merge(Product::SingleLevels, None, true, true).unwrap();
        assert_eq!(
            summary.output,
            PathBuf::from("data/result/reanalysis-era5-single-levels_20200101-20200202_daily.json")
        );
        // The day tokens {01, 02, 30, 31} touch Jan 1, 2, 30, 31 and Feb 1, 2.
        assert_eq!(summary.timesteps, 6);
        assert_eq!(
            h.single_level_output(None).unwrap(),
            summary.output
        );

        let geo = h.format_file(&h.geopotential_path(), None).unwrap();
        assert_eq!(geo, h.geopotential_output(None));
        let ds = JsonFormat.decode(&h.store().read(&geo).unwrap()).unwrap();
        assert!(ds.variables.contains_key("Geopotential"));
        assert_eq!(ds.coords["lat"], Coordinate::Values(vec![39.75, 40.0]));
    }

    #[test]
    fn netcdf_archive_output_merges() {
        let h = with_format(120_000, NetcdfFormat);
        let spec = DateSpec::new().start("2020-01-01").end("2020-01-02").freq("D");
        let grid = CalendarGrid::generate(&spec, Some(&["00:00", "12:00"][..])).unwrap();

        let report = h.retrieve_single_levels(&grid, &area(&h)).unwrap();
        assert_eq!(
            report.fetched,
            vec![
                PathBuf::from("data/surface_geopotential.nc"),
                PathBuf::from("data/reanalysis-era5-single-levels_20200101-20200102.nc"),
            ]
        );
        for (_, request) in h.service.requests.borrow().iter() {
            assert_eq!(request.get("format").unwrap().as_strings(), vec!["netcdf"]);
        }

        let summary = h.merge(Product::SingleLevels, None, true, true).unwrap();
        assert_eq!(
            summary.output,
            PathBuf::from("data/result/reanalysis-era5-single-levels_20200101-20200102_daily.nc")
        );
        assert_eq!(summary.timesteps, 2);

        let ds = NetcdfFormat.decode(&h.store().read(&summary.output).unwrap()).unwrap();
        assert!(ds.variables.contains_key("2 metre temperature"));
        assert_eq!(ds.coords["lat"], Coordinate::Values(vec![39.75, 40.0]));
        let Some(Coordinate::Time { encoding, .. }) = ds.coords.get(TIME) else {
            panic!("time coordinate missing");
        };
        assert_eq!(*encoding, TimeEncoding::epoch_seconds());
    }

    #[test]
    fn failed_geopotential_fetch_is_a_retrieval_error() {
        let opts = HarvestOptions {
            folder: PathBuf::from("data"),
            ..HarvestOptions::default()
        };
        let service = FakeCds {
            closed: true,
            ..FakeCds::default()
        };
        let h = Harvester::with_store(opts, service, MemoryStore::new(), JsonFormat).unwrap();
        let spec = DateSpec::new().start("2020-01-01").periods(1).freq("D");
        let grid = CalendarGrid::generate(&spec, None).unwrap();

        let err = h.retrieve_single_levels(&grid, &area(&h)).unwrap_err();
        match err {
            Error::Retrieval {
                window,
                last_completed,
                ..
            } => {
                assert_eq!(window, "surface_geopotential");
                assert!(last_completed.is_none());
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(h.store().is_empty());
    }

    #[test]
    fn rerun_skips_everything() {
        let h = harvester(120_000);
        let spec = DateSpec::new().start("2021-01-01").periods(3).freq("D");
        let grid = CalendarGrid::generate(&spec, None).unwrap();
        let levels = pressure_levels_between(850, 1000);

        let first = h.retrieve_pressure_levels(&levels, &grid, &area(&h)).unwrap();
        assert_eq!(first.fetched.len(), 1);
        let second = h.retrieve_pressure_levels(&levels, &grid, &area(&h)).unwrap();
        assert!(second.fetched.is_empty());
        assert_eq!(h.service.requests.borrow().len(), 1);

        let summary = h.merge(Product::PressureLevels, Some(Path::new("pl.json")), false, true).unwrap();
        assert_eq!(summary.output, PathBuf::from("data/pl.json"));
        assert_eq!(summary.timesteps, 72);
    }

    #[test]
    fn merge_without_normalizing_keeps_native_names() {
        let h = harvester(120_000);
        let spec = DateSpec::new().start("2021-01-01").periods(1).freq("D");
        let grid = CalendarGrid::generate(&spec, Some(&["06:00"][..])).unwrap();
        h.retrieve_single_levels(&grid, &area(&h)).unwrap();

        let summary = h.merge(Product::SingleLevels, None, false, false).unwrap();
        let ds = JsonFormat.decode(&h.store().read(&summary.output).unwrap()).unwrap();
        assert!(ds.variables.contains_key("t2m"));
        assert!(summary.output.to_string_lossy().ends_with("_raw.json"));
    }

    #[test]
    fn empty_level_list_is_rejected() {
        let h = harvester(120_000);
        let spec = DateSpec::new().start("2021-01-01").periods(1).freq("D");
        let grid = CalendarGrid::generate(&spec, None).unwrap();
        assert!(matches!(
            h.retrieve_pressure_levels(&[], &grid, &area(&h)),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn missing_merged_output_is_reported() {
        let h = harvester(120_000);
        assert!(h.pressure_level_output(None).is_err());
        assert_eq!(
            h.pressure_level_output(Some("pl.json")).unwrap(),
            PathBuf::from("data/result/pl.json")
        );
    }

    #[test]
    fn options_load_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvest.json");
        fs::write(&path, r#"{"folder": "/srv/era5", "quota": 60000}"#).unwrap();
        let opts = HarvestOptions::from_path(&path).unwrap();
        assert_eq!(opts.quota, 60_000);
        assert_eq!(opts.area_buffer, DEFAULT_BUFFER);
        assert_eq!(opts.resolved_result_dir(), PathBuf::from("/srv/era5/result"));

        fs::write(&path, r#"{"quota": "lots"}"#).unwrap();
        assert!(HarvestOptions::from_path(&path).is_err());
    }

    #[test]
    fn invalid_options_are_rejected() {
        let zero = HarvestOptions {
            quota: 0,
            ..HarvestOptions::default()
        };
        assert!(Harvester::with_store(zero, FakeCds::default(), MemoryStore::new(), JsonFormat).is_err());

        let unknown = HarvestOptions {
            rename_table: "v9".into(),
            ..HarvestOptions::default()
        };
        assert!(Harvester::with_store(unknown, FakeCds::default(), MemoryStore::new(), JsonFormat).is_err());
    }
}
