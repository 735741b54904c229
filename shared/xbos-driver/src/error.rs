//! Error types for the driver runtime

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriverError>;

#[derive(Error, Debug)]
pub enum DriverError {
    /// Bad registration arguments, a value of the wrong type, a duplicate path
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown timeseries: {0}")]
    UnknownSeries(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Network failure or a non-success response from a remote endpoint
    #[error("Transport error: {0}")]
    Transport(String),

    /// A subscription frame that could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A task could not acquire the resource it runs on (connection, socket)
    #[error("Setup error: {0}")]
    Setup(String),
}

impl DriverError {
    /// Transient errors are logged and the owning task keeps running;
    /// everything else ends the task.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Protocol(_) | Self::Serialization(_)
        )
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::UnknownSeries(_) => "UNKNOWN_SERIES",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Setup(_) => "SETUP_ERROR",
        }
    }
}

impl From<reqwest::Error> for DriverError {
    fn from(err: reqwest::Error) -> Self {
        DriverError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(err: serde_json::Error) -> Self {
        DriverError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DriverError::Transport("503".into()).is_transient());
        assert!(DriverError::Protocol("bad frame".into()).is_transient());
        assert!(!DriverError::Validation("empty unit".into()).is_transient());
        assert!(!DriverError::Setup("refused".into()).is_transient());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(DriverError::UnknownSeries("/x".into()).error_code(), "UNKNOWN_SERIES");
        assert_eq!(
            DriverError::Validation("x".into()).to_string(),
            "Validation error: x"
        );
    }
}
