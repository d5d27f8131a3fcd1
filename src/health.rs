//! Per-service health tracking.
//!
//! Every role-task outcome feeds a [`HealthRecord`] keyed by service name.
//! Scores are exponential moving averages so one bad call nudges rather than
//! craters a service, and sustained failure decays it toward zero. Nothing
//! here is invented: records only exist for observed outcomes.

use crate::error::ErrorCategory;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// EMA smoothing: `score ← 0.9·score + 0.1·outcome`.
const EMA_KEEP: f64 = 0.9;
const EMA_GAIN: f64 = 0.1;

/// Health state of one service.
#[derive(Debug, Clone)]
pub struct HealthRecord {
    /// EMA of success outcomes, in `[0, 1]`. Starts at 1 (healthy until
    /// proven otherwise).
    pub health_score: f64,
    /// EMA of the success ratio.
    pub success_rate: f64,
    /// EMA of observed call latency.
    pub avg_latency: Duration,
    /// Message of the most recent failure, if any.
    pub last_error: Option<String>,
    /// Classification of the most recent failure; drives recovery playbooks.
    pub last_error_category: Option<ErrorCategory>,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            health_score: 1.0,
            success_rate: 1.0,
            avg_latency: Duration::ZERO,
            last_error: None,
            last_error_category: None,
            consecutive_failures: 0,
            total_successes: 0,
            total_failures: 0,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct HealthTracker {
    inner: Arc<Mutex<HashMap<String, HealthRecord>>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, service: &str, latency: Duration) {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let record = map.entry(service.to_string()).or_default();
        record.health_score = EMA_KEEP * record.health_score + EMA_GAIN;
        record.success_rate = EMA_KEEP * record.success_rate + EMA_GAIN;
        record.avg_latency = ema_latency(record.avg_latency, latency, record.total_calls());
        record.consecutive_failures = 0;
        record.total_successes += 1;
    }

    pub fn record_failure(
        &self,
        service: &str,
        category: Option<ErrorCategory>,
        error: &str,
        latency: Duration,
    ) {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let record = map.entry(service.to_string()).or_default();
        record.health_score = EMA_KEEP * record.health_score;
        record.success_rate = EMA_KEEP * record.success_rate;
        record.avg_latency = ema_latency(record.avg_latency, latency, record.total_calls());
        record.last_error = Some(error.to_string());
        record.last_error_category = category;
        record.consecutive_failures += 1;
        record.total_failures += 1;
    }

    /// Current score for a service; services never observed are healthy.
    pub fn score(&self, service: &str) -> f64 {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(service)
            .map(|r| r.health_score)
            .unwrap_or(1.0)
    }

    pub fn record(&self, service: &str) -> Option<HealthRecord> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).get(service).cloned()
    }

    /// Clone of all records, keyed by service.
    pub fn snapshot(&self) -> HashMap<String, HealthRecord> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl HealthRecord {
    fn total_calls(&self) -> u64 {
        self.total_successes + self.total_failures
    }
}

fn ema_latency(current: Duration, observed: Duration, prior_calls: u64) -> Duration {
    if prior_calls == 0 {
        return observed;
    }
    let blended =
        EMA_KEEP * current.as_millis() as f64 + EMA_GAIN * observed.as_millis() as f64;
    Duration::from_millis(blended as u64)
}
