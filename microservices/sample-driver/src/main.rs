//! Sample Driver
//!
//! Publishes `SAMPLE_SERIES_COUNT` counters (`/sensor0`, `/sensor1`, ...)
//! that each advance by one every `SAMPLE_POLL_SECS`, and reports them to
//! the destinations in `XBOS_REPORT_DESTINATIONS`.

use anyhow::Context;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use xbos_driver::prelude::*;

const SERVICE_NAME: &str = "sample-driver";

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    xbos_telemetry::init(SERVICE_NAME).context("failed to initialize logging")?;

    let series_count: usize = env_or("SAMPLE_SERIES_COUNT", 3)?;
    let poll_secs: u64 = env_or("SAMPLE_POLL_SECS", 1)?;

    let config = DriverConfig::from_env().context("invalid driver configuration")?;
    let mut driver = Driver::new(
        config,
        Some(json!({"SourceName": "Sample Driver", "Instrument": {"Model": "Counter"}})),
    )?;

    let mut paths = Vec::with_capacity(series_count);
    for i in 0..series_count {
        let path = driver.register_timeseries(
            &format!("/sensor{}", i),
            "count",
            UnitOfTime::Milliseconds,
            StreamType::Numeric,
        )?;
        driver.attach_metadata(&path, &json!({"Location": {"Room": format!("{}", 400 + i)}}))?;
        paths.push(path);
    }

    let counter = Arc::new(AtomicU64::new(0));
    let series = driver.series();
    driver.register_poll("counters", Duration::from_secs(poll_secs), move || {
        let series = series.clone();
        let paths = paths.clone();
        let value = counter.fetch_add(1, Ordering::Relaxed) + 1;
        async move {
            for path in &paths {
                series.add_reading(path, json!(value), None)?;
            }
            Ok(())
        }
    })?;

    info!(
        series = series_count,
        poll_secs,
        instance_uuid = %driver.namespace(),
        "Sample driver configured"
    );

    tokio::select! {
        summary = driver.start() => {
            let summary = summary?;
            info!(failed = summary.failed, panicked = summary.panicked, "Driver stopped");
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        }
    }

    Ok(())
}
