use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("retrieval of window {window} failed (last completed: {}): {source}", .last_completed.as_deref().unwrap_or("none"))]
    Retrieval {
        window: String,
        last_completed: Option<String>,
        #[source]
        source: Box<Error>,
    },

    #[error("merge error: {0}")]
    Merge(String),

    #[error("normalization error: {0}")]
    Normalization(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("dataset format error: {0}")]
    Format(String),

    #[error("netcdf error: {0}")]
    Netcdf(#[from] netcdf::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}
