use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database stayed busy after {attempts} attempts: {message}")]
    StoreBusy { attempts: usize, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("invalid url: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("request failed for {url}: {message}")]
    Transport { url: String, message: String },

    #[error("http {status} for {url}")]
    HttpStatus {
        url: String,
        status: u16,
        /// Leading part of the response body, kept for diagnostics.
        body_excerpt: String,
    },

    #[error("anti-bot challenge persisted after session refresh: {url}")]
    AntiBotChallenge { url: String },

    #[error("no resolver registered for host link {link}")]
    UnsupportedHost { link: String },

    #[error("resolver found no image on {url}")]
    ImageNotFound { url: String },

    #[error("downloaded file is empty: {url}")]
    EmptyDownload { url: String },

    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {id} is {status}; only pending jobs can be removed")]
    JobNotPending { id: String, status: String },

    #[error("invalid config at {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("{} of {attempted} repairs failed:\n{}", failures.len(), failures.join("\n"))]
    RepairIncomplete {
        attempted: usize,
        failures: Vec<String>,
    },
}

impl EngineError {
    /// Connection-level failures worth another attempt within one fetch call.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transport { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
