//! Error types for the carbon-aware scheduler

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration, rejected at construction time
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A recurrence rule could not be parsed
    #[error("Invalid schedule expression '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    /// Location code is not served by the forecast feed
    #[error("Invalid location code: {0}")]
    UnknownLocation(String),

    /// No forecast data exists for the requested location or range
    #[error("{0}")]
    NoForecast(String),

    /// Forecast data exists but does not cover a whole job window
    #[error(
        "Forecast for {location} has {available} data point(s) but a \
         {job_duration_minutes}-minute job needs {required}"
    )]
    InsufficientData {
        location: String,
        job_duration_minutes: u32,
        required: usize,
        available: usize,
    },

    /// The forecast source did not answer within the caller's budget
    #[error("Forecast request timed out after {0:?}")]
    Timeout(Duration),

    /// One or more locations could not be refreshed
    #[error("Forecast refresh failed for {}", describe_failures(.0))]
    RefreshFailed(Vec<(String, String)>),

    /// Remote endpoint answered with a non-success status
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Feed payload could not be decoded
    #[error("Failed to parse forecast feed: {0}")]
    ParseError(String),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid settings file: {0}")]
    SettingsError(#[from] toml::de::Error),
}

fn describe_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(location, reason)| format!("[{location}: {reason}]"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;
