//! Metrics primitives
//!
//! Cheap cloneable handles; clones share the same underlying value so a
//! report loop and whoever inspects it can hold the same metric.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonic counter
#[derive(Clone, Debug, Default)]
pub struct Counter {
    value: Arc<AtomicU64>,
    name: String,
}

impl Counter {
    pub fn new(name: &str) -> Self {
        Self {
            value: Arc::new(AtomicU64::new(0)),
            name: name.to_string(),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Point-in-time value
#[derive(Clone, Debug, Default)]
pub struct Gauge {
    value: Arc<AtomicU64>,
    name: String,
}

impl Gauge {
    pub fn new(name: &str) -> Self {
        Self {
            value: Arc::new(AtomicU64::new(0)),
            name: name.to_string(),
        }
    }

    pub fn set(&self, val: u64) {
        self.value.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Sliding window of samples for mean/percentile queries
#[derive(Clone, Debug)]
pub struct Histogram {
    samples: Arc<parking_lot::Mutex<VecDeque<f64>>>,
    name: String,
    max_samples: usize,
}

impl Histogram {
    pub fn new(name: &str) -> Self {
        Self::with_capacity(name, 1024)
    }

    pub fn with_capacity(name: &str, max_samples: usize) -> Self {
        Self {
            samples: Arc::new(parking_lot::Mutex::new(VecDeque::with_capacity(max_samples))),
            name: name.to_string(),
            max_samples: max_samples.max(1),
        }
    }

    pub fn record(&self, value: f64) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.max_samples {
            samples.pop_front();
        }
        samples.push_back(value);
    }

    pub fn count(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn percentile(&self, p: f64) -> f64 {
        let mut sorted: Vec<f64> = self.samples.lock().iter().copied().collect();
        if sorted.is_empty() {
            return 0.0;
        }
        sorted.sort_by(|a, b| a.total_cmp(b));
        let idx = ((sorted.len() as f64) * p / 100.0) as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    pub fn mean(&self) -> f64 {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().sum::<f64>() / samples.len() as f64
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
