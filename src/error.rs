//! Unified error types for routewarden

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for routewarden operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to parse JSON config: {0}")]
    ConfigJson(#[from] serde_json::Error),

    #[error("Unsupported config file '{0}' (expected .toml or .json)")]
    UnsupportedConfigFormat(PathBuf),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Supervisor errors
    #[error("Check '{0}' not found")]
    CheckNotFound(String),

    #[error("Check '{0}' is already running")]
    CheckAlreadyRunning(String),

    #[error("Probe setup failed for check '{check}': {message}")]
    ProbeSetup { check: String, message: String },

    #[error("A configuration reload is already in progress; retry later")]
    ReloadInProgress,

    // Control channel errors
    #[error("Control channel write failed: {0}")]
    ControlChannel(io::Error),

    #[error("Announcement queue closed")]
    SinkClosed,

    // Notification errors
    #[error("Notification delivery failed: {0}")]
    Notification(String),
}

impl Error {
    /// Whether the caller may simply try the same operation again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ReloadInProgress)
    }
}

/// Result type alias for routewarden operations
pub type Result<T> = std::result::Result<T, Error>;
