use std::path::PathBuf;
use thiserror::Error;

/// Failure talking to the document, save or unlock endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{method} {url} returned status {status}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },

    #[error("http transport error for {method} {url}: {message}")]
    Transport {
        method: &'static str,
        url: String,
        message: String,
    },

    #[error("invalid response body from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("background request task failed: {0}")]
    Join(String),
}

/// Failure of the live template channel.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("websocket transport error: {0}")]
    Transport(String),

    #[error("unexpected channel message: {0}")]
    Protocol(String),

    #[error("connection closed")]
    Closed,

    #[error("no transport available")]
    Unavailable,

    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value `{value}` for {key}")]
    Env { key: &'static str, value: String },
}
