//! Error types for patcher-backend

use thiserror::Error;

/// Errors raised while configuring a backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Neither `PATCHER_API_KEY` nor `OPENAI_API_KEY` is set
    #[error("no API key configured (set PATCHER_API_KEY or OPENAI_API_KEY)")]
    MissingApiKey,

    /// An environment variable could not be parsed
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    /// The base URL is not http(s)
    #[error("base URL must start with http:// or https://: {0}")]
    InvalidBaseUrl(String),

    /// The HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for ConfigError {
    fn from(err: reqwest::Error) -> Self {
        ConfigError::Http(err.to_string())
    }
}
