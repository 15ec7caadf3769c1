//! Concatenating fragment files along time.
//!
//! Fragments are decoded one at a time in lexicographic path order, which for
//! `<dataset>_<start>-<end>` names is chronological. When two fragments carry
//! the same timestamp the first one read wins and later copies are dropped, so
//! the result does not depend on the order files were discovered in.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::Fragment;
use crate::dataset::{Coordinate, Dataset, DatasetFormat, TIME, TimeEncoding, Variable};
use crate::error::{Error, Result};
use crate::normalize::Normalizer;
use crate::store::ArtifactStore;

/// Layout every fragment of one merge must share.
struct Schema {
    coords: BTreeMap<String, Coordinate>,
    variables: BTreeMap<String, Variable>,
    attrs: BTreeMap<String, Value>,
    encoding: TimeEncoding,
}

impl Schema {
    /// Take the layout from the first fragment; static variables keep their data.
    fn from_first(ds: &Dataset, encoding: TimeEncoding) -> Self {
        let coords = ds
            .coords
            .iter()
            .filter(|(name, _)| name.as_str() != TIME)
            .map(|(n, c)| (n.clone(), c.clone()))
            .collect();
        let variables = ds
            .variables
            .iter()
            .map(|(name, v)| {
                let mut v = v.clone();
                if is_time_dependent(&v) {
                    v.data = Vec::new();
                }
                (name.clone(), v)
            })
            .collect();
        Self {
            coords,
            variables,
            attrs: ds.attrs.clone(),
            encoding,
        }
    }

    fn check(&self, ds: &Dataset, path: &Path) -> Result<()> {
        let incompatible = |what: String| {
            Error::Merge(format!("{} is incompatible: {what}", path.display()))
        };

        let names: BTreeSet<&String> = ds.variables.keys().collect();
        let expected: BTreeSet<&String> = self.variables.keys().collect();
        if names != expected {
            return Err(incompatible(format!(
                "variables {names:?}, expected {expected:?}"
            )));
        }
        for (name, v) in &ds.variables {
            if self.variables[name].dims != v.dims {
                return Err(incompatible(format!("dimensions of {name} differ")));
            }
        }

        for (name, c) in &self.coords {
            if ds.coords.get(name) != Some(c) {
                return Err(incompatible(format!("coordinate {name} differs")));
            }
        }
        if ds.coords.len() != self.coords.len() + 1 {
            return Err(incompatible("coordinate set differs".into()));
        }
        Ok(())
    }

    fn time_variables(&self) -> impl Iterator<Item = &String> {
        self.variables
            .iter()
            .filter(|(_, v)| is_time_dependent(v))
            .map(|(name, _)| name)
    }
}

fn is_time_dependent(v: &Variable) -> bool {
    v.dims.iter().any(|d| d == TIME)
}

/// Running per-day sums for daily means; NaN values are skipped.
struct DayAccumulator {
    sums: Vec<Vec<f64>>,
    counts: Vec<Vec<u32>>,
}

impl DayAccumulator {
    fn new(sizes: &[usize]) -> Self {
        Self {
            sums: sizes.iter().map(|n| vec![0.0; *n]).collect(),
            counts: sizes.iter().map(|n| vec![0; *n]).collect(),
        }
    }

    fn add(&mut self, slabs: &[&[f64]]) {
        for (k, slab) in slabs.iter().enumerate() {
            for (j, x) in slab.iter().enumerate() {
                if !x.is_nan() {
                    self.sums[k][j] += x;
                    self.counts[k][j] += 1;
                }
            }
        }
    }

    fn means(&self) -> Vec<Vec<f64>> {
        self.sums
            .iter()
            .zip(&self.counts)
            .map(|(s, c)| {
                s.iter()
                    .zip(c)
                    .map(|(s, c)| if *c == 0 { f64::NAN } else { s / *c as f64 })
                    .collect()
            })
            .collect()
    }
}

enum Rows {
    Samples(BTreeMap<NaiveDateTime, Vec<Vec<f64>>>),
    Daily(BTreeMap<NaiveDate, DayAccumulator>),
}

/// Where a merge's output went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    pub output: PathBuf,
    pub fragments: usize,
    pub timesteps: usize,
}

pub struct Merger<'a> {
    store: &'a dyn ArtifactStore,
    format: &'a dyn DatasetFormat,
    folder: PathBuf,
    result_dir: PathBuf,
}

impl<'a> Merger<'a> {
    pub fn new(
        store: &'a dyn ArtifactStore,
        format: &'a dyn DatasetFormat,
        folder: impl Into<PathBuf>,
        result_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            format,
            folder: folder.into(),
            result_dir: result_dir.into(),
        }
    }

    /// Fragments of `dataset` in the data folder, sorted by path.
    pub fn fragments(&self, dataset: &str) -> Result<Vec<Fragment>> {
        let mut out: Vec<Fragment> = self
            .store
            .list(&self.folder)?
            .iter()
            .filter_map(|p| Fragment::parse(p, dataset, self.format.extension()))
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    /// Concatenate `fragments` along time, optionally reducing to daily means.
    pub fn merge_fragments(&self, fragments: &[Fragment], daily: bool) -> Result<Dataset> {
        let mut ordered: Vec<&Fragment> = fragments.iter().collect();
        ordered.sort_by(|a, b| a.path.cmp(&b.path));

        let mut schema: Option<Schema> = None;
        let mut rows = if daily {
            Rows::Daily(BTreeMap::new())
        } else {
            Rows::Samples(BTreeMap::new())
        };
        let mut seen: BTreeSet<NaiveDateTime> = BTreeSet::new();
        let mut dropped = 0usize;

        for fragment in ordered {
            debug!(path = %fragment.path.display(), "reading fragment");
            let ds = self.format.decode(&self.store.read(&fragment.path)?)?;
            let Some(Coordinate::Time { values: times, encoding }) = ds.coords.get(TIME) else {
                return Err(Error::Merge(format!(
                    "{} has no time coordinate",
                    fragment.path.display()
                )));
            };

            if let Some(s) = &schema {
                s.check(&ds, &fragment.path)?;
            }
            let schema = &*schema.get_or_insert_with(|| Schema::from_first(&ds, encoding.clone()));

            let mut slab_sizes = Vec::new();
            for name in schema.time_variables() {
                let v = &ds.variables[name];
                if v.dims.first().map(String::as_str) != Some(TIME) {
                    return Err(Error::Merge(format!(
                        "variable {name} must have time as its leading dimension"
                    )));
                }
                slab_sizes.push(v.data.len() / times.len().max(1));
            }

            for (i, t) in times.iter().enumerate() {
                if !seen.insert(*t) {
                    dropped += 1;
                    continue;
                }
                let slabs: Vec<&[f64]> = schema
                    .time_variables()
                    .zip(&slab_sizes)
                    .map(|(name, n)| &ds.variables[name].data[i * n..(i + 1) * n])
                    .collect();
                match &mut rows {
                    Rows::Samples(m) => {
                        m.insert(*t, slabs.iter().map(|s| s.to_vec()).collect());
                    }
                    Rows::Daily(m) => m
                        .entry(t.date())
                        .or_insert_with(|| DayAccumulator::new(&slab_sizes))
                        .add(&slabs),
                }
            }
        }

        let Some(schema) = schema else {
            return Err(Error::Merge("no fragments to merge".into()));
        };
        if dropped > 0 {
            warn!(dropped, "dropped duplicate timestamps, keeping the first occurrence");
        }

        let (times, columns): (Vec<NaiveDateTime>, Vec<Vec<Vec<f64>>>) = match rows {
            Rows::Samples(m) => m.into_iter().unzip(),
            Rows::Daily(m) => m
                .into_iter()
                .map(|(d, acc)| (d.and_time(NaiveTime::MIN), acc.means()))
                .unzip(),
        };

        let mut ds = Dataset {
            coords: schema.coords.clone(),
            variables: schema.variables.clone(),
            attrs: schema.attrs.clone(),
        };
        for (k, name) in schema.time_variables().enumerate() {
            if let Some(v) = ds.variables.get_mut(name) {
                v.data = columns.iter().flat_map(|row| row[k].iter().copied()).collect();
            }
        }
        ds.coords.insert(
            TIME.to_string(),
            Coordinate::Time {
                values: times,
                encoding: schema.encoding.clone(),
            },
        );
        ds.validate()?;
        Ok(ds)
    }

    /// Default output: `<result_dir>/<dataset>_<start>-<end>_<daily|raw>.<ext>`.
    pub fn default_output(&self, dataset: &str, fragments: &[Fragment], daily: bool) -> Result<PathBuf> {
        let (Some(first), Some(last)) = (fragments.first(), fragments.last()) else {
            return Err(Error::Merge(format!("no fragments found for {dataset}")));
        };
        let tag = if daily { "daily" } else { "raw" };
        Ok(self.result_dir.join(format!(
            "{dataset}_{}-{}_{tag}.{}",
            first.start,
            last.end,
            self.format.extension()
        )))
    }

    /// Merge every fragment of `dataset` and write the result.
    ///
    /// A relative `output` is resolved against the data folder.
    pub fn merge_to(
        &self,
        dataset: &str,
        output: Option<&Path>,
        daily: bool,
        normalizer: Option<&Normalizer>,
    ) -> Result<MergeSummary> {
        let fragments = self.fragments(dataset)?;
        if fragments.is_empty() {
            return Err(Error::Merge(format!(
                "no fragments of {dataset} in {}",
                self.folder.display()
            )));
        }

        let output = match output {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => self.folder.join(p),
            None => self.default_output(dataset, &fragments, daily)?,
        };

        let mut ds = self.merge_fragments(&fragments, daily)?;
        if let Some(n) = normalizer {
            ds = n.normalize(ds)?;
        }
        let timesteps = ds.times().map_or(0, <[_]>::len);

        self.store.write_with(&output, &mut |w: &mut dyn Write| -> Result<()> {
            self.format.encode(&ds, w)
        })?;
        info!(output = %output.display(), fragments = fragments.len(), timesteps, "merged");

        Ok(MergeSummary {
            output,
            fragments: fragments.len(),
            timesteps,
        })
    }
}
