//! Structured engine events for observability.
//!
//! Components emit [`EngineEvent`]s through an [`EventSink`]. Sinks must be
//! cheap and non-blocking; anything expensive belongs behind a buffering
//! sink owned by the embedder.

use crate::error::ErrorCategory;
use crate::role::Role;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Events emitted during ensemble execution.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A cache lookup was answered from a tier.
    CacheHit { key: String },
    /// A cache lookup missed every tier.
    CacheMiss { key: String },
    /// A role task delivered a fulfilled output.
    RoleFulfilled { role: Role, latency: Duration },
    /// A role task terminated with a failure.
    RoleFailed { role: Role, category: ErrorCategory },
    /// A circuit breaker transitioned to open.
    BreakerOpened { service: String, failures: usize },
    /// A circuit breaker transitioned to half-open.
    BreakerHalfOpen { service: String },
    /// A circuit breaker transitioned back to closed.
    BreakerClosed { service: String },
    /// A fallback alternative was engaged for a domain.
    FallbackEngaged { domain: &'static str, alternative: String },
    /// Synthesis finished with the given status label.
    SynthesisCompleted { status: &'static str, fallback_used: Option<String> },
    /// The degradation level changed.
    DegradationChanged { from: &'static str, to: &'static str },
    /// A recovery playbook action was attempted.
    RecoveryAttempted { service: String, action: &'static str, success: bool },
}

/// Consumer of engine events.
pub trait EventSink: Send + Sync + std::fmt::Debug {
    fn emit(&self, event: EngineEvent);
}

/// Sink that forwards events to `tracing` at sensible levels.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: EngineEvent) {
        match &event {
            EngineEvent::BreakerOpened { service, failures } => {
                tracing::error!(service = %service, failures, "circuit breaker opened")
            }
            EngineEvent::BreakerHalfOpen { service } => {
                tracing::debug!(service = %service, "circuit breaker half-open")
            }
            EngineEvent::BreakerClosed { service } => {
                tracing::info!(service = %service, "circuit breaker closed")
            }
            EngineEvent::RoleFailed { role, category } => {
                tracing::warn!(role = %role, category = %category, "role failed")
            }
            EngineEvent::DegradationChanged { from, to } => {
                tracing::warn!(from, to, "degradation level changed")
            }
            EngineEvent::RecoveryAttempted { service, action, success } => {
                tracing::info!(service = %service, action, success, "recovery attempt")
            }
            _ => tracing::debug!(?event, "engine event"),
        }
    }
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// Bounded in-memory sink for tests and introspection. Oldest events are
/// discarded once capacity is reached.
#[derive(Debug, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<EngineEvent>>>,
    capacity: usize,
}

impl MemorySink {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { events: Arc::new(Mutex::new(Vec::new())), capacity: capacity.max(1) }
    }

    /// Snapshot of the recorded events.
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Count of events matching a predicate.
    pub fn count_where(&self, predicate: impl Fn(&EngineEvent) -> bool) -> usize {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).iter().filter(|e| predicate(e)).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: EngineEvent) {
        let mut events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        if events.len() >= self.capacity {
            events.remove(0);
        }
        events.push(event);
    }
}
