use std::path::PathBuf;

use thiserror::Error;

/// Problems with a single algorithm option.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptionError {
    #[error("Missing required option '{0}'")]
    Missing(String),
    #[error("Invalid value for option '{key}': {reason}")]
    Invalid { key: String, reason: String },
}

impl OptionError {
    pub fn invalid(key: &str, reason: impl Into<String>) -> Self {
        OptionError::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Rejected batch configuration. Raised before any image is dispatched.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown algorithm '{0}'")]
    UnknownAlgorithm(String),
    #[error("Option error: {0}")]
    Option(#[from] OptionError),
    #[error("Worker pool size must be at least 1")]
    NoWorkers,
    #[error("Minimum area {min} exceeds maximum area {max}")]
    AreaRange { min: u32, max: u32 },
    #[error("K-Means cluster count must be at least 1")]
    NoClusters,
    #[error("Unable to load histogram reference image {path:?}: {reason}")]
    HistogramReference { path: PathBuf, reason: String },
    #[error("Invalid setting '{0}': {1}")]
    Setting(String, String),
}
