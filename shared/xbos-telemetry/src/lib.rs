//! XBOS Telemetry
//!
//! Structured logging setup and lightweight in-process metrics shared by the
//! driver runtime and the drivers built on it.

mod config;
mod metrics;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use metrics::{Counter, Gauge, Histogram};
pub use tracing_setup::init_tracing;

/// Initialize logging for a driver process from the environment
pub fn init(service_name: &str) -> Result<(), TelemetryError> {
    init_tracing(&TelemetryConfig::from_env(service_name))
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Invalid log filter {0}")]
    InvalidFilter(String),

    #[error("Tracing initialization failed: {0}")]
    TracingInit(String),
}
