//! Idempotent execution of request windows.
//!
//! A window's fragment file is the only record that it completed: if the file
//! exists the window is skipped, otherwise it is fetched and written
//! atomically. Re-running an interrupted acquisition therefore only performs
//! the missing work.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::client::RetrievalService;
use crate::error::{Error, Result};
use crate::partition::RequestWindow;
use crate::request::Request;
use crate::store::ArtifactStore;

/// On-disk output of one window: `<dataset>_<YYYYMMDD>-<YYYYMMDD>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub path: PathBuf,
    pub start: String,
    pub end: String,
}

impl Fragment {
    pub fn file_name(dataset: &str, start: &str, end: &str, extension: &str) -> String {
        format!("{dataset}_{start}-{end}.{extension}")
    }

    /// Recognise a fragment of `dataset` by its file name.
    pub fn parse(path: &Path, dataset: &str, extension: &str) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let stem = name
            .strip_prefix(dataset)?
            .strip_prefix('_')?
            .strip_suffix(extension)?
            .strip_suffix('.')?;
        let (start, end) = stem.split_once('-')?;
        let is_date = |s: &str| s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit());
        if !is_date(start) || !is_date(end) {
            return None;
        }
        Some(Self {
            path: path.to_path_buf(),
            start: start.to_string(),
            end: end.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Skipped(PathBuf),
    Fetched { path: PathBuf, bytes: u64 },
}

impl Outcome {
    pub fn path(&self) -> &Path {
        match self {
            Outcome::Skipped(p) => p,
            Outcome::Fetched { path, .. } => path,
        }
    }
}

/// What a run over a list of windows did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub fetched: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

pub struct RetrievalCache<'a> {
    service: &'a dyn RetrievalService,
    store: &'a dyn ArtifactStore,
    folder: PathBuf,
    extension: String,
}

impl<'a> RetrievalCache<'a> {
    pub fn new(
        service: &'a dyn RetrievalService,
        store: &'a dyn ArtifactStore,
        folder: impl Into<PathBuf>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            service,
            store,
            folder: folder.into(),
            extension: extension.into(),
        }
    }

    pub fn fragment_path(&self, dataset: &str, window: &RequestWindow) -> PathBuf {
        self.folder.join(Fragment::file_name(
            dataset,
            &window.first_token(),
            &window.last_token(),
            &self.extension,
        ))
    }

    /// Fetch `request` into `target` unless `target` already exists.
    ///
    /// A failure is reported as a retrieval of the target's file stem.
    pub fn ensure(&self, dataset: &str, request: &Request, target: &Path) -> Result<Outcome> {
        self.materialize(dataset, request, target)
            .map_err(|e| retrieval_error(stem(target), None, e))
    }

    pub fn retrieve(&self, dataset: &str, window: &RequestWindow, base: &Request) -> Result<Outcome> {
        self.retrieve_after(dataset, window, base, None)
    }

    /// Run every window in order, stopping at the first failure.
    ///
    /// The error names the failed window and the last one that completed, so
    /// a re-run picks up exactly there.
    pub fn retrieve_all(
        &self,
        dataset: &str,
        windows: &[RequestWindow],
        base: &Request,
    ) -> Result<RunReport> {
        let mut report = RunReport::default();
        let mut last_completed: Option<String> = None;

        for window in windows {
            match self.retrieve_after(dataset, window, base, last_completed.take())? {
                Outcome::Skipped(p) => report.skipped.push(p),
                Outcome::Fetched { path, .. } => report.fetched.push(path),
            }
            last_completed = Some(window.label());
        }

        info!(
            %dataset,
            fetched = report.fetched.len(),
            skipped = report.skipped.len(),
            "all windows present"
        );
        Ok(report)
    }

    fn retrieve_after(
        &self,
        dataset: &str,
        window: &RequestWindow,
        base: &Request,
        last_completed: Option<String>,
    ) -> Result<Outcome> {
        let target = self.fragment_path(dataset, window);
        self.materialize(dataset, &window.to_request(base), &target)
            .map_err(|e| retrieval_error(window.label(), last_completed, e))
    }

    fn materialize(&self, dataset: &str, request: &Request, target: &Path) -> Result<Outcome> {
        if self.store.exists(target) {
            info!(target = %target.display(), "already downloaded, skipping");
            return Ok(Outcome::Skipped(target.to_path_buf()));
        }

        info!(%dataset, target = %target.display(), "retrieving");
        let mut bytes = 0;
        self.store.write_with(target, &mut |w: &mut dyn Write| -> Result<()> {
            bytes = self.service.fetch(dataset, request, w)?;
            Ok(())
        })?;
        Ok(Outcome::Fetched {
            path: target.to_path_buf(),
            bytes,
        })
    }
}

fn retrieval_error(window: String, last_completed: Option<String>, source: Error) -> Error {
    Error::Retrieval {
        window,
        last_completed,
        source: Box::new(source),
    }
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
