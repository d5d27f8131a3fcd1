//! Graceful degradation: a process-wide capability level derived from
//! aggregate service health.
//!
//! Levels get worse immediately (a collapsing score jumps straight to the
//! mapped level) but recover one step at a time, and only once the overall
//! score is comfortably back above 0.7. The current level lives in an
//! `ArcSwap` so hot-path readers never take a lock.

use crate::circuit_breaker::{BreakerSnapshot, CircuitState};
use crate::events::{EngineEvent, EventSink, NullSink};
use crate::health::HealthRecord;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Latency ceiling used when folding average latency into a service score.
const LATENCY_CEILING: Duration = Duration::from_secs(10);

/// Score below which a core service counts as failing outright.
const CORE_FAILING_SCORE: f64 = 0.1;

/// Overall score required before the level may step back up.
const RECOVERY_SCORE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DegradationLevel {
    Full,
    Enhanced,
    Standard,
    Basic,
    Minimal,
    Emergency,
}

impl DegradationLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationLevel::Full => "full",
            DegradationLevel::Enhanced => "enhanced",
            DegradationLevel::Standard => "standard",
            DegradationLevel::Basic => "basic",
            DegradationLevel::Minimal => "minimal",
            DegradationLevel::Emergency => "emergency",
        }
    }

    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            DegradationLevel::Full => 0,
            DegradationLevel::Enhanced => 1,
            DegradationLevel::Standard => 2,
            DegradationLevel::Basic => 3,
            DegradationLevel::Minimal => 4,
            DegradationLevel::Emergency => 5,
        }
    }

    fn from_rank(rank: u8) -> Self {
        match rank {
            0 => DegradationLevel::Full,
            1 => DegradationLevel::Enhanced,
            2 => DegradationLevel::Standard,
            3 => DegradationLevel::Basic,
            4 => DegradationLevel::Minimal,
            _ => DegradationLevel::Emergency,
        }
    }

    /// Map an overall health score to its target level.
    #[must_use]
    pub fn for_score(score: f64) -> Self {
        if score >= 0.8 {
            DegradationLevel::Full
        } else if score >= 0.6 {
            DegradationLevel::Enhanced
        } else if score >= 0.4 {
            DegradationLevel::Standard
        } else if score >= 0.2 {
            DegradationLevel::Basic
        } else if score >= 0.1 {
            DegradationLevel::Minimal
        } else {
            DegradationLevel::Emergency
        }
    }

    /// Feature restrictions active at this level. Each level restricts a
    /// superset of the level above it.
    #[must_use]
    pub fn restrictions(&self) -> &'static [&'static str] {
        match self {
            DegradationLevel::Full => &[],
            DegradationLevel::Enhanced => &["detailed_analytics", "optimization"],
            DegradationLevel::Standard => {
                &["detailed_analytics", "optimization", "enhanced_synthesis", "complex_voting"]
            }
            DegradationLevel::Basic => &[
                "detailed_analytics",
                "optimization",
                "enhanced_synthesis",
                "complex_voting",
                "memory",
                "voting",
                "caching",
            ],
            DegradationLevel::Minimal => &[
                "detailed_analytics",
                "optimization",
                "enhanced_synthesis",
                "complex_voting",
                "memory",
                "voting",
                "caching",
                "model_fallbacks",
            ],
            DegradationLevel::Emergency => &[
                "detailed_analytics",
                "optimization",
                "enhanced_synthesis",
                "complex_voting",
                "memory",
                "voting",
                "caching",
                "model_fallbacks",
                "auto_recovery",
            ],
        }
    }
}

/// How much a service's health weighs into the overall score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCriticality {
    Core,
    Important,
    Optional,
    Enhancement,
}

impl ServiceCriticality {
    fn weight(&self) -> f64 {
        match self {
            ServiceCriticality::Core => 4.0,
            ServiceCriticality::Important => 3.0,
            ServiceCriticality::Optional => 2.0,
            ServiceCriticality::Enhancement => 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DegradationState {
    pub level: DegradationLevel,
    pub overall_score: f64,
}

pub struct DegradationManager {
    enabled: bool,
    state: ArcSwap<DegradationState>,
    criticality: HashMap<String, ServiceCriticality>,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for DegradationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DegradationManager")
            .field("enabled", &self.enabled)
            .field("state", &self.snapshot())
            .finish()
    }
}

impl DegradationManager {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: ArcSwap::from_pointee(DegradationState {
                level: DegradationLevel::Full,
                overall_score: 1.0,
            }),
            criticality: HashMap::new(),
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Classify a service. Unclassified services count as `Important`.
    pub fn classify(mut self, service: impl Into<String>, criticality: ServiceCriticality) -> Self {
        self.criticality.insert(service.into(), criticality);
        self
    }

    #[must_use]
    pub fn current(&self) -> DegradationLevel {
        self.state.load().level
    }

    #[must_use]
    pub fn snapshot(&self) -> DegradationState {
        (**self.state.load()).clone()
    }

    /// Whether a feature is disabled at the current level.
    #[must_use]
    pub fn is_feature_restricted(&self, feature: &str) -> bool {
        self.enabled && self.current().restrictions().contains(&feature)
    }

    /// Fold one service's record into a `[0, 1]` score: availability (the
    /// health EMA), success rate, and latency against the 10 s ceiling. An
    /// open breaker collapses the score by 10x.
    fn service_score(record: &HealthRecord, breaker_open: bool) -> f64 {
        let latency_component = 1.0
            - (record.avg_latency.as_millis() as f64 / LATENCY_CEILING.as_millis() as f64).min(1.0);
        let score =
            0.5 * record.health_score + 0.3 * record.success_rate + 0.2 * latency_component;
        if breaker_open {
            score * 0.1
        } else {
            score
        }
    }

    /// Reassess the level from current health and breaker state. Returns
    /// the level in force after assessment.
    pub fn assess(
        &self,
        health: &HashMap<String, HealthRecord>,
        breakers: &[BreakerSnapshot],
    ) -> DegradationLevel {
        if !self.enabled {
            return DegradationLevel::Full;
        }

        let open: std::collections::HashSet<&str> = breakers
            .iter()
            .filter(|s| s.state == CircuitState::Open)
            .map(|s| s.service.as_str())
            .collect();

        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        let mut core_failing = false;

        for (service, record) in health {
            let criticality = self
                .criticality
                .get(service)
                .copied()
                .unwrap_or(ServiceCriticality::Important);
            let score = Self::service_score(record, open.contains(service.as_str()));
            weighted_sum += score * criticality.weight();
            weight_total += criticality.weight();
            if criticality == ServiceCriticality::Core && score < CORE_FAILING_SCORE {
                core_failing = true;
            }
        }

        let overall = if weight_total > 0.0 { weighted_sum / weight_total } else { 1.0 };
        let target = if core_failing {
            DegradationLevel::Emergency
        } else {
            DegradationLevel::for_score(overall)
        };

        let current = self.current();
        let next = if target.rank() > current.rank() {
            // Downgrades take effect immediately.
            target
        } else if target.rank() < current.rank() && overall > RECOVERY_SCORE {
            // Recovery is gradual: one step per assessment.
            DegradationLevel::from_rank(current.rank() - 1)
        } else {
            current
        };

        if next != current {
            self.sink.emit(EngineEvent::DegradationChanged {
                from: current.as_str(),
                to: next.as_str(),
            });
            tracing::warn!(from = current.as_str(), to = next.as_str(), overall, "degradation level changed");
        }
        self.state.store(Arc::new(DegradationState { level: next, overall_score: overall }));
        next
    }
}
