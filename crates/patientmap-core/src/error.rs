use thiserror::Error;

/// Top-level error type for the PatientMap platform.
#[derive(Error, Debug)]
pub enum PatientMapError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid setting '{key}': {reason}")]
    InvalidSetting {
        key: &'static str,
        reason: &'static str,
    },
}

impl From<config::ConfigError> for PatientMapError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
