//! Report batcher
//!
//! Every tick gathers the pending readings and unsent metadata of all series
//! into one JSON document, POSTs it to each configured destination at once,
//! and only drops buffered readings once the delivery policy is satisfied.

use bytes::Bytes;
use futures_util::future::join_all;
use reqwest::header::CONTENT_TYPE;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};
use xbos_telemetry::{Counter, Gauge, Histogram};

use crate::config::DeliveryPolicy;
use crate::error::{DriverError, Result};
use crate::registry::SeriesRegistry;
use crate::timeseries::{PendingReport, Report};

/// Result of one POST to one destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationResult {
    pub destination: String,
    pub status: Option<u16>,
    pub error: Option<String>,
}

impl DestinationResult {
    /// 200 is the only status that counts as delivered
    pub fn is_success(&self) -> bool {
        self.status == Some(200)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// No series had readings; nothing was sent
    Skipped,
    /// The delivery policy was met and the included readings were dropped
    Delivered {
        series: usize,
        readings: usize,
        destinations: Vec<DestinationResult>,
    },
    /// Buffers were left untouched for the next tick
    Undelivered {
        series: usize,
        readings: usize,
        destinations: Vec<DestinationResult>,
    },
}

#[derive(Clone, Debug)]
pub struct ReportMetrics {
    pub reports_sent: Counter,
    pub reports_failed: Counter,
    pub skipped_cycles: Counter,
    pub readings_delivered: Counter,
    pub pending_readings: Gauge,
    pub flush_latency_ms: Histogram,
}

impl Default for ReportMetrics {
    fn default() -> Self {
        Self {
            reports_sent: Counter::new("xbos_reports_sent"),
            reports_failed: Counter::new("xbos_reports_failed"),
            skipped_cycles: Counter::new("xbos_report_cycles_skipped"),
            readings_delivered: Counter::new("xbos_readings_delivered"),
            pending_readings: Gauge::new("xbos_pending_readings"),
            flush_latency_ms: Histogram::new("xbos_flush_latency_ms"),
        }
    }
}

pub struct ReportBatcher {
    http: reqwest::Client,
    destinations: Vec<String>,
    policy: DeliveryPolicy,
    series: SeriesRegistry,
    metrics: ReportMetrics,
}

impl ReportBatcher {
    pub fn new(
        http: reqwest::Client,
        destinations: Vec<String>,
        policy: DeliveryPolicy,
        series: SeriesRegistry,
    ) -> Self {
        Self {
            http,
            destinations,
            policy,
            series,
            metrics: ReportMetrics::default(),
        }
    }

    pub fn destinations(&self) -> &[String] {
        &self.destinations
    }

    pub fn metrics(&self) -> &ReportMetrics {
        &self.metrics
    }

    /// Run one report cycle
    pub async fn flush(&self) -> Result<FlushOutcome> {
        if !self.series.has_readings() {
            self.metrics.skipped_cycles.inc();
            debug!("No pending readings, skipping report");
            return Ok(FlushOutcome::Skipped);
        }
        if self.destinations.is_empty() {
            return Err(DriverError::Config(
                "no report destinations configured".to_string(),
            ));
        }

        let pending = self.series.pending();
        let readings: usize = pending.iter().map(PendingReport::reading_count).sum();
        log_summary(&pending);

        let payload = encode_payload(&pending)?;
        info!(
            destinations = self.destinations.len(),
            series = pending.len(),
            readings,
            bytes = payload.len(),
            "Sending report"
        );

        let started = Instant::now();
        let results = join_all(
            self.destinations
                .iter()
                .map(|destination| self.send(destination, payload.clone())),
        )
        .await;
        self.metrics
            .flush_latency_ms
            .record(started.elapsed().as_secs_f64() * 1000.0);

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        self.metrics.reports_sent.add(succeeded as u64);
        self.metrics
            .reports_failed
            .add((results.len() - succeeded) as u64);

        let acknowledged = match self.policy {
            DeliveryPolicy::Any => succeeded > 0,
            DeliveryPolicy::All => succeeded == results.len(),
        };

        let outcome = if acknowledged {
            self.series.acknowledge(&pending);
            self.metrics.readings_delivered.add(readings as u64);
            let latency = &self.metrics.flush_latency_ms;
            info!(
                succeeded,
                failed = results.len() - succeeded,
                latency_p50_ms = latency.percentile(50.0),
                latency_p99_ms = latency.percentile(99.0),
                latency_mean_ms = latency.mean(),
                "Report OK"
            );
            FlushOutcome::Delivered {
                series: pending.len(),
                readings,
                destinations: results,
            }
        } else {
            warn!(
                succeeded,
                failed = results.len() - succeeded,
                policy = ?self.policy,
                "Report not acknowledged, keeping readings for next cycle"
            );
            FlushOutcome::Undelivered {
                series: pending.len(),
                readings,
                destinations: results,
            }
        };

        let remaining: usize = self
            .series
            .series()
            .iter()
            .map(|ts| ts.pending_readings())
            .sum();
        self.metrics.pending_readings.set(remaining as u64);

        Ok(outcome)
    }

    async fn send(&self, destination: &str, payload: Bytes) -> DestinationResult {
        let sent = self
            .http
            .post(destination)
            .header(CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await;

        match sent {
            Ok(response) => {
                let status = response.status().as_u16();
                // body is left unread
                if status == 200 {
                    debug!(destination = %destination, "Destination acknowledged report");
                } else {
                    warn!(destination = %destination, status, "Report failed");
                }
                DestinationResult {
                    destination: destination.to_string(),
                    status: Some(status),
                    error: None,
                }
            }
            Err(e) => {
                warn!(destination = %destination, error = %e, "Report destination unreachable");
                DestinationResult {
                    destination: destination.to_string(),
                    status: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

/// Serialize snapshots as `{ path: report, ... }`
pub fn encode_payload(pending: &[PendingReport]) -> Result<Bytes> {
    let body: BTreeMap<&str, &Report> = pending
        .iter()
        .map(|p| (p.path.as_str(), &p.report))
        .collect();
    Ok(Bytes::from(serde_json::to_vec(&body)?))
}

fn log_summary(pending: &[PendingReport]) {
    for p in pending.iter().filter(|p| p.reading_count() > 0) {
        let numbers = p.report.readings.iter().filter_map(|r| r.value().as_f64());
        let (min, max) = numbers.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
        if min <= max {
            debug!(path = %p.path, readings = p.reading_count(), min, max, "Queued for report");
        } else {
            debug!(path = %p.path, readings = p.reading_count(), "Queued for report");
        }
    }
}
