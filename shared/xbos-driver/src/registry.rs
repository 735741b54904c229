//! Registry of every series a driver instance owns

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{DriverError, Result};
use crate::metadata;
use crate::timeseries::{PendingReport, TimeSeries};

#[derive(Default)]
struct Inner {
    order: Vec<Arc<TimeSeries>>,
    by_path: HashMap<String, usize>,
}

/// Insertion-ordered, append-only map from path to series.
///
/// Clones share the same registry, so poll jobs and subscription handlers can
/// hold one to push readings.
#[derive(Clone, Default)]
pub struct SeriesRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl SeriesRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, series: TimeSeries) -> Result<Arc<TimeSeries>> {
        let mut inner = self.inner.write();
        if inner.by_path.contains_key(series.path()) {
            return Err(DriverError::Validation(format!(
                "path {} is already registered",
                series.path()
            )));
        }

        let series = Arc::new(series);
        let index = inner.order.len();
        inner.by_path.insert(series.path().to_string(), index);
        inner.order.push(Arc::clone(&series));

        tracing::debug!(path = %series.path(), id = %series.id(), "Timeseries registered");
        Ok(series)
    }

    pub fn get(&self, path: &str) -> Option<Arc<TimeSeries>> {
        let inner = self.inner.read();
        inner.by_path.get(path).map(|&i| Arc::clone(&inner.order[i]))
    }

    fn require(&self, path: &str) -> Result<Arc<TimeSeries>> {
        self.get(path)
            .ok_or_else(|| DriverError::UnknownSeries(path.to_string()))
    }

    pub fn paths(&self) -> Vec<String> {
        self.inner
            .read()
            .order
            .iter()
            .map(|ts| ts.path().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_reading(&self, path: &str, value: Value, timestamp: Option<i64>) -> Result<()> {
        self.require(path)?.add(value, timestamp)
    }

    pub fn attach_metadata(&self, path: &str, metadata: &Value) -> Result<()> {
        let partial = metadata::as_metadata(metadata)?;
        self.require(path)?.attach_metadata(partial);
        Ok(())
    }

    pub fn has_readings(&self) -> bool {
        self.series().iter().any(|ts| ts.pending_readings() > 0)
    }

    /// Snapshots of every series with readings or unsent metadata, in
    /// registration order
    pub fn pending(&self) -> Vec<PendingReport> {
        self.series()
            .iter()
            .filter(|ts| ts.pending_readings() > 0 || ts.is_dirty())
            .map(|ts| ts.snapshot())
            .collect()
    }

    pub fn acknowledge(&self, delivered: &[PendingReport]) {
        for pending in delivered {
            if let Some(series) = self.get(&pending.path) {
                series.acknowledge(pending);
            }
        }
    }

    /// Point-in-time copy of the series list; the lock is not held afterwards
    pub fn series(&self) -> Vec<Arc<TimeSeries>> {
        self.inner.read().order.clone()
    }
}
