//! Registry of named circuit breakers.
//!
//! Breakers are created on first use per service name and shared across all
//! role tasks. The registry is the read surface for health scoring,
//! degradation assessment, and recovery automation.

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::clock::Clock;
use crate::events::EventSink;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct BreakerRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry").field("config", &self.config).finish()
    }
}

impl BreakerRegistry {
    pub fn new(
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), config, clock, sink }
    }

    /// Fetch the breaker for a service, creating it on first use.
    pub fn get_or_create(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(
                    CircuitBreaker::new(service, self.config.clone())
                        .with_clock(self.clock.clone())
                        .with_sink(self.sink.clone()),
                )
            })
            .clone()
    }

    /// Breaker for a service, if one has been created.
    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).get(service).cloned()
    }

    /// Whether a service's breaker is currently open.
    pub fn is_open(&self, service: &str) -> bool {
        self.get(service).is_some_and(|b| b.current_state() == CircuitState::Open)
    }

    /// Reset a breaker by service name. Returns false if unknown.
    pub fn reset(&self, service: &str) -> bool {
        match self.get(service) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Sorted snapshot of every registered breaker.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut entries: Vec<BreakerSnapshot> = map.values().map(|b| b.snapshot()).collect();
        entries.sort_by(|a, b| a.service.cmp(&b.service));
        entries
    }

    /// Open breakers that are past their reset timeout (probe candidates).
    pub fn probe_candidates(&self) -> Vec<Arc<CircuitBreaker>> {
        let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.values().filter(|b| b.probe_due()).cloned().collect()
    }
}
