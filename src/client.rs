use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client as HttpClient;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::archive::DEFAULT_API_URL;
use crate::error::{Error, Result};
use crate::request::Request;

/// Anything that can execute one archive request and stream the result.
///
/// Implementations block until the product is fully written to `sink` or the
/// request has failed. They do not retry.
pub trait RetrievalService {
    fn fetch(&self, dataset: &str, request: &Request, sink: &mut dyn Write) -> Result<u64>;
}

impl<T: RetrievalService + ?Sized> RetrievalService for &T {
    fn fetch(&self, dataset: &str, request: &Request, sink: &mut dyn Write) -> Result<u64> {
        (**self).fetch(dataset, request, sink)
    }
}

/// API endpoint and key, as stored in `~/.cdsapirc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub url: String,
    pub key: String,
}

impl Credentials {
    /// Parse the two-line `url: ...` / `key: ...` format.
    pub fn parse(text: &str) -> Result<Self> {
        let mut url = None;
        let mut key = None;
        for line in text.lines() {
            let Some((k, v)) = line.split_once(':') else {
                continue;
            };
            match k.trim() {
                "url" => url = Some(v.trim().to_string()),
                "key" => key = Some(v.trim().to_string()),
                _ => {}
            }
        }
        match (url, key) {
            (Some(url), Some(key)) if !url.is_empty() && !key.is_empty() => Ok(Self { url, key }),
            _ => Err(Error::Configuration(
                "credentials need both a url and a key".into(),
            )),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read credentials {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    /// `$CDSAPI_RC`, else `$HOME/.cdsapirc`.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(p) = std::env::var_os("CDSAPI_RC") {
            return Some(PathBuf::from(p));
        }
        std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cdsapirc"))
    }

    /// `CDSAPI_URL`/`CDSAPI_KEY` when both are set, else the default file.
    pub fn discover() -> Result<Self> {
        if let (Ok(url), Ok(key)) = (std::env::var("CDSAPI_URL"), std::env::var("CDSAPI_KEY")) {
            return Ok(Self { url, key });
        }
        let path = Self::default_path()
            .ok_or_else(|| Error::Configuration("cannot locate a credentials file".into()))?;
        Self::from_path(path)
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Explicit credentials; discovered from the environment when `None`.
    pub credentials: Option<Credentials>,
    /// Delay between task status polls.
    pub poll_interval: Duration,
    pub verify_tls: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            credentials: None,
            poll_interval: Duration::from_secs(5),
            verify_tls: true,
        }
    }
}

/// Task states reported by the CDS web API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending { request_id: String },
    Completed { location: String },
}

/// Interpret a task reply, turning `failed` into an error.
pub fn task_state(reply: &Value) -> Result<TaskState> {
    let state = reply
        .get("state")
        .and_then(|s| s.as_str())
        .ok_or_else(|| Error::Archive(format!("reply without state: {reply}")))?;
    match state {
        "queued" | "running" | "accepted" => {
            let request_id = reply
                .get("request_id")
                .and_then(|s| s.as_str())
                .ok_or_else(|| Error::Archive("pending reply without request_id".into()))?;
            Ok(TaskState::Pending {
                request_id: request_id.to_string(),
            })
        }
        "completed" => {
            let location = reply
                .get("location")
                .and_then(|s| s.as_str())
                .ok_or_else(|| Error::Archive("completed reply without location".into()))?;
            Ok(TaskState::Completed {
                location: location.to_string(),
            })
        }
        "failed" => {
            let err = reply.get("error");
            let message = err
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("request failed");
            let reason = err
                .and_then(|e| e.get("reason"))
                .and_then(|m| m.as_str())
                .unwrap_or("");
            Err(Error::Archive(format!("{message} {reason}").trim().to_string()))
        }
        other => Err(Error::Archive(format!("unexpected task state: {other}"))),
    }
}

/// Blocking client for the Copernicus Climate Data Store web API.
#[derive(Debug, Clone)]
pub struct CdsClient {
    opts: ClientOptions,
    base_url: Url,
    key: String,
    http: HttpClient,
}

impl CdsClient {
    pub fn new(opts: ClientOptions) -> Result<Self> {
        let creds = match &opts.credentials {
            Some(c) => c.clone(),
            None => Credentials::discover()?,
        };
        let base = if creds.url.is_empty() {
            DEFAULT_API_URL
        } else {
            creds.url.as_str()
        };
        let base_url = Url::parse(&format!("{}/", base.trim_end_matches('/')))?;

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("era5-harvest/0.1"));

        let mut builder = HttpClient::builder().default_headers(headers);
        if !opts.verify_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build()?;

        Ok(Self {
            opts,
            base_url,
            key: creds.key,
            http,
        })
    }

    pub fn resource_url(&self, dataset: &str) -> Result<Url> {
        Ok(self.base_url.join(&format!("resources/{dataset}"))?)
    }

    pub fn task_url(&self, request_id: &str) -> Result<Url> {
        Ok(self.base_url.join(&format!("tasks/{request_id}"))?)
    }

    fn auth(&self, req: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match self.key.split_once(':') {
            Some((user, secret)) => req.basic_auth(user, Some(secret)),
            None => req.header("PRIVATE-TOKEN", &self.key),
        }
    }

    fn submit(&self, dataset: &str, request: &Request) -> Result<TaskState> {
        let url = self.resource_url(dataset)?;
        debug!(%url, "submitting request");
        let reply: Value = self
            .auth(self.http.post(url))
            .json(request)
            .send()?
            .error_for_status()?
            .json()?;
        task_state(&reply)
    }

    fn poll(&self, request_id: &str) -> Result<TaskState> {
        let reply: Value = self
            .auth(self.http.get(self.task_url(request_id)?))
            .send()?
            .error_for_status()?
            .json()?;
        task_state(&reply)
    }
}

impl RetrievalService for CdsClient {
    fn fetch(&self, dataset: &str, request: &Request, sink: &mut dyn Write) -> Result<u64> {
        let mut state = self.submit(dataset, request)?;
        let location = loop {
            match state {
                TaskState::Completed { location } => break location,
                TaskState::Pending { request_id } => {
                    debug!(%request_id, "request pending");
                    thread::sleep(self.opts.poll_interval);
                    state = self.poll(&request_id)?;
                }
            }
        };

        let url = self.base_url.join(&location)?;
        info!(%url, "downloading result");
        let mut resp = self.auth(self.http.get(url)).send()?.error_for_status()?;
        let bytes = resp.copy_to(sink)?;
        Ok(bytes)
    }
}
