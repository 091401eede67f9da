use crate::types::TrialKind;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpeedTestError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("Invalid host: {0}")]
    InvalidHost(String),

    #[error("{url} responded with {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("No servers available")]
    NoServers,

    #[error("All {0} tests failed")]
    AllTrialsFailed(TrialKind),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SpeedTestError>;
