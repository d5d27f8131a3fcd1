//! Ranked fallbacks for the four failure domains: model roles, synthesis,
//! voting, and storage.
//!
//! Selection drops alternatives whose breaker is open or whose health score
//! has decayed below 0.3, then orders what is left by priority and health.
//! The caller walks the list until one works; an exhausted list means the
//! emergency path.

use crate::breaker_registry::BreakerRegistry;
use crate::clock::Clock;
use crate::error::EnsembleError;
use crate::health::HealthTracker;
use crate::role::{ProviderId, Role, RoleBinding};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Alternatives below this health score are not worth offering.
const MIN_HEALTH: f64 = 0.3;

/// One ranked alternative inside a fallback domain.
#[derive(Debug, Clone)]
pub struct Alternative<T> {
    pub value: T,
    /// Lower is preferred.
    pub priority: u8,
    /// Quality ceiling of this path, in `[0, 1]`. Caps result confidence.
    pub baseline_quality: f64,
}

impl<T> Alternative<T> {
    pub fn new(value: T, priority: u8, baseline_quality: f64) -> Self {
        Self { value, priority, baseline_quality }
    }
}

/// Anything that can be health-tracked and breaker-guarded by name.
pub trait FallbackCandidate {
    fn service_name(&self) -> String;
}

impl FallbackCandidate for RoleBinding {
    fn service_name(&self) -> String {
        RoleBinding::service_name(self)
    }
}

/// Synthesis fallback chain, best path first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisStrategy {
    BestResponseSelection,
    SimpleConcatenation,
    TemplateBased,
    CachedResponse,
}

impl SynthesisStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SynthesisStrategy::BestResponseSelection => "best_response_selection",
            SynthesisStrategy::SimpleConcatenation => "simple_concatenation",
            SynthesisStrategy::TemplateBased => "template_based",
            SynthesisStrategy::CachedResponse => "cached_response",
        }
    }

    /// Confidence ceiling for results produced by this strategy.
    #[must_use]
    pub fn baseline_quality(&self) -> f64 {
        match self {
            SynthesisStrategy::BestResponseSelection => 0.8,
            SynthesisStrategy::SimpleConcatenation => 0.6,
            SynthesisStrategy::TemplateBased => 0.4,
            SynthesisStrategy::CachedResponse => 0.3,
        }
    }
}

impl FallbackCandidate for SynthesisStrategy {
    fn service_name(&self) -> String {
        format!("synthesis:{}", self.as_str())
    }
}

/// Voting fallback chain, best path first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VotingStrategy {
    HighestConfidence,
    SimpleMajority,
    WeightedRandom,
    FirstAvailable,
}

impl VotingStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            VotingStrategy::HighestConfidence => "highest_confidence",
            VotingStrategy::SimpleMajority => "simple_majority",
            VotingStrategy::WeightedRandom => "weighted_random",
            VotingStrategy::FirstAvailable => "first_available",
        }
    }
}

impl FallbackCandidate for VotingStrategy {
    fn service_name(&self) -> String {
        format!("voting:{}", self.as_str())
    }
}

/// Storage degradation chain, least lossy first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    MemoryCache,
    LocalStorage,
    ReadOnlyMode,
    OfflineMode,
}

impl StorageMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::MemoryCache => "memory_cache",
            StorageMode::LocalStorage => "local_storage",
            StorageMode::ReadOnlyMode => "read_only_mode",
            StorageMode::OfflineMode => "offline_mode",
        }
    }

    /// Whether cached results may still be served in this mode.
    #[must_use]
    pub fn allows_reads(&self) -> bool {
        !matches!(self, StorageMode::OfflineMode)
    }

    /// Whether new results may still be written in this mode. Each rung of
    /// the chain sheds more risk: read-only stops writes, offline stops
    /// cache traffic entirely.
    #[must_use]
    pub fn allows_writes(&self) -> bool {
        matches!(self, StorageMode::MemoryCache | StorageMode::LocalStorage)
    }
}

impl FallbackCandidate for StorageMode {
    fn service_name(&self) -> String {
        format!("storage:{}", self.as_str())
    }
}

/// Per-role catalog of concrete `(provider, model)` alternatives.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    alternatives: HashMap<Role, Vec<Alternative<RoleBinding>>>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock four-role ensemble with two to three alternatives each.
    pub fn standard() -> Self {
        let mut catalog = Self::new();
        catalog.add("gpt4o", ProviderId::OpenAi, "gpt-4o", 1, 0.9);
        catalog.add("gpt4o", ProviderId::OpenAi, "gpt-4o-mini", 2, 0.75);
        catalog.add("gpt4o", ProviderId::Anthropic, "claude-3-5-haiku", 3, 0.7);

        catalog.add("claude", ProviderId::Anthropic, "claude-sonnet-4", 1, 0.9);
        catalog.add("claude", ProviderId::Anthropic, "claude-3-5-haiku", 2, 0.75);
        catalog.add("claude", ProviderId::OpenAi, "gpt-4o-mini", 3, 0.7);

        catalog.add("gemini", ProviderId::Google, "gemini-2.0-flash", 1, 0.85);
        catalog.add("gemini", ProviderId::Google, "gemini-1.5-pro", 2, 0.8);
        catalog.add("gemini", ProviderId::OpenAi, "gpt-4o-mini", 3, 0.7);

        catalog.add("xai", ProviderId::Xai, "grok-3", 1, 0.85);
        catalog.add("xai", ProviderId::Xai, "grok-3-mini", 2, 0.7);
        catalog.add("xai", ProviderId::Anthropic, "claude-3-5-haiku", 3, 0.7);
        catalog
    }

    pub fn add(
        &mut self,
        role: impl Into<Role>,
        provider: ProviderId,
        model: &str,
        priority: u8,
        baseline_quality: f64,
    ) {
        let role = role.into();
        let binding = RoleBinding::new(role.clone(), provider, model);
        self.alternatives
            .entry(role)
            .or_default()
            .push(Alternative::new(binding, priority, baseline_quality));
    }

    pub fn roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self.alternatives.keys().cloned().collect();
        roles.sort();
        roles
    }

    pub fn alternatives_for(&self, role: &Role) -> &[Alternative<RoleBinding>] {
        self.alternatives.get(role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Primary binding for a role (lowest priority number), regardless of
    /// health. Used when every alternative has been filtered away.
    pub fn primary(&self, role: &Role) -> Option<RoleBinding> {
        self.alternatives
            .get(role)?
            .iter()
            .min_by_key(|a| a.priority)
            .map(|a| a.value.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct UsageStats {
    pub attempts: u64,
    pub successes: u64,
    pub last_used_millis: u64,
}

/// Health-scored selection over the fallback domains.
pub struct FallbackManager {
    catalog: ModelCatalog,
    health: HealthTracker,
    breakers: BreakerRegistry,
    usage: Mutex<HashMap<String, UsageStats>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FallbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackManager").field("catalog", &self.catalog).finish()
    }
}

impl FallbackManager {
    pub fn new(
        catalog: ModelCatalog,
        health: HealthTracker,
        breakers: BreakerRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { catalog, health, breakers, usage: Mutex::new(HashMap::new()), clock }
    }

    #[must_use]
    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Ranked, health-filtered alternatives for a generic domain.
    pub fn select<T: FallbackCandidate + Clone>(
        &self,
        alternatives: &[Alternative<T>],
    ) -> Vec<Alternative<T>> {
        let mut viable: Vec<(&Alternative<T>, f64)> = alternatives
            .iter()
            .filter_map(|alt| {
                let service = alt.value.service_name();
                if self.breakers.is_open(&service) {
                    return None;
                }
                let score = self.health.score(&service);
                if score < MIN_HEALTH {
                    return None;
                }
                Some((alt, score))
            })
            .collect();

        viable.sort_by(|(a, sa), (b, sb)| {
            a.priority
                .cmp(&b.priority)
                .then(sb.partial_cmp(sa).unwrap_or(std::cmp::Ordering::Equal))
        });

        viable.into_iter().map(|(alt, _)| alt.clone()).collect()
    }

    /// Viable model bindings for a role, best first. Empty means every
    /// alternative is broken or unhealthy.
    pub fn model_candidates(&self, role: &Role) -> Vec<Alternative<RoleBinding>> {
        self.select(self.catalog.alternatives_for(role))
    }

    pub fn synthesis_chain(&self) -> Vec<Alternative<SynthesisStrategy>> {
        let chain = [
            SynthesisStrategy::BestResponseSelection,
            SynthesisStrategy::SimpleConcatenation,
            SynthesisStrategy::TemplateBased,
            SynthesisStrategy::CachedResponse,
        ];
        let alternatives: Vec<Alternative<SynthesisStrategy>> = chain
            .iter()
            .enumerate()
            .map(|(i, s)| Alternative::new(*s, i as u8 + 1, s.baseline_quality()))
            .collect();
        self.select(&alternatives)
    }

    pub fn voting_chain(&self) -> Vec<Alternative<VotingStrategy>> {
        let chain = [
            VotingStrategy::HighestConfidence,
            VotingStrategy::SimpleMajority,
            VotingStrategy::WeightedRandom,
            VotingStrategy::FirstAvailable,
        ];
        let alternatives: Vec<Alternative<VotingStrategy>> = chain
            .iter()
            .enumerate()
            .map(|(i, s)| Alternative::new(*s, i as u8 + 1, 0.5))
            .collect();
        self.select(&alternatives)
    }

    pub fn storage_chain(&self) -> Vec<Alternative<StorageMode>> {
        let chain = [
            StorageMode::MemoryCache,
            StorageMode::LocalStorage,
            StorageMode::ReadOnlyMode,
            StorageMode::OfflineMode,
        ];
        let alternatives: Vec<Alternative<StorageMode>> = chain
            .iter()
            .enumerate()
            .map(|(i, s)| Alternative::new(*s, i as u8 + 1, 0.5))
            .collect();
        self.select(&alternatives)
    }

    /// Mode the dispatcher should use for cache traffic right now: the
    /// healthiest rung of the storage chain, or offline when every rung has
    /// decayed away.
    pub fn active_storage_mode(&self) -> StorageMode {
        self.storage_chain().first().map(|a| a.value).unwrap_or(StorageMode::OfflineMode)
    }

    /// Record an execution outcome against an alternative's service name,
    /// updating both the health EMA and the usage history.
    pub fn record_outcome(
        &self,
        service: &str,
        success: bool,
        latency: Duration,
        error: Option<&EnsembleError>,
    ) {
        if success {
            self.health.record_success(service, latency);
        } else {
            let category = error.map(EnsembleError::category);
            let message = error.map(|e| e.to_string());
            self.health.record_failure(
                service,
                category,
                message.as_deref().unwrap_or("unknown"),
                latency,
            );
        }

        let mut usage = self.usage.lock().unwrap_or_else(|p| p.into_inner());
        let stats = usage.entry(service.to_string()).or_default();
        stats.attempts += 1;
        if success {
            stats.successes += 1;
        }
        stats.last_used_millis = self.clock.now_millis();
    }

    pub fn usage(&self, service: &str) -> Option<UsageStats> {
        self.usage.lock().unwrap_or_else(|p| p.into_inner()).get(service).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::clock::ManualClock;
    use crate::error::{EnsembleError, ErrorCategory};
    use crate::events::NullSink;

    fn manager() -> (FallbackManager, ManualClock) {
        let clock = ManualClock::new();
        let health = HealthTracker::new();
        let breakers = BreakerRegistry::new(
            CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(60),
                monitor_window: Duration::from_secs(120),
            },
            Arc::new(clock.clone()),
            Arc::new(NullSink),
        );
        (
            FallbackManager::new(ModelCatalog::standard(), health, breakers, Arc::new(clock.clone())),
            clock,
        )
    }

    #[tokio::test]
    async fn healthy_candidates_come_back_in_priority_order() {
        let (manager, _clock) = manager();
        let candidates = manager.model_candidates(&Role::new("gpt4o"));
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].value.model, "gpt-4o");
        assert_eq!(candidates[1].value.model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn open_breaker_drops_an_alternative() {
        let (manager, _clock) = manager();
        let breaker = manager.breakers.get_or_create("openai:gpt-4o");
        let _ = breaker
            .execute(|| async {
                Err::<(), _>(EnsembleError::model_failure(
                    ProviderId::OpenAi,
                    "gpt-4o",
                    ErrorCategory::ServerError,
                    "500",
                ))
            })
            .await;

        let candidates = manager.model_candidates(&Role::new("gpt4o"));
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].value.model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn unhealthy_alternatives_are_dropped() {
        let (manager, _clock) = manager();
        // Decay openai:gpt-4o below the 0.3 floor.
        for _ in 0..15 {
            manager.record_outcome("openai:gpt-4o", false, Duration::from_millis(10), None);
        }
        let candidates = manager.model_candidates(&Role::new("gpt4o"));
        assert!(candidates.iter().all(|c| c.value.model != "gpt-4o"));
    }

    #[tokio::test]
    async fn ties_on_priority_break_by_health() {
        let (manager, _clock) = manager();
        let alternatives = vec![
            Alternative::new(RoleBinding::new("r", ProviderId::OpenAi, "a"), 1, 0.9),
            Alternative::new(RoleBinding::new("r", ProviderId::OpenAi, "b"), 1, 0.9),
        ];
        // Drag "a" down but keep it above the floor.
        for _ in 0..3 {
            manager.record_outcome("openai:a", false, Duration::ZERO, None);
        }
        let selected = manager.select(&alternatives);
        assert_eq!(selected[0].value.model, "b");
        assert_eq!(selected[1].value.model, "a");
    }

    #[tokio::test]
    async fn synthesis_chain_is_ordered_best_first() {
        let (manager, _clock) = manager();
        let chain: Vec<&'static str> =
            manager.synthesis_chain().iter().map(|a| a.value.as_str()).collect();
        assert_eq!(
            chain,
            ["best_response_selection", "simple_concatenation", "template_based", "cached_response"]
        );
    }

    #[tokio::test]
    async fn voting_chain_is_ordered_best_first() {
        let (manager, _clock) = manager();
        let chain: Vec<&'static str> =
            manager.voting_chain().iter().map(|a| a.value.as_str()).collect();
        assert_eq!(
            chain,
            ["highest_confidence", "simple_majority", "weighted_random", "first_available"]
        );
    }

    #[tokio::test]
    async fn storage_chain_is_ordered_least_lossy_first() {
        let (manager, _clock) = manager();
        let chain: Vec<&'static str> =
            manager.storage_chain().iter().map(|a| a.value.as_str()).collect();
        assert_eq!(chain, ["memory_cache", "local_storage", "read_only_mode", "offline_mode"]);
    }

    #[tokio::test]
    async fn storage_mode_walks_down_the_chain_as_rungs_decay() {
        let (manager, _clock) = manager();
        assert_eq!(manager.active_storage_mode(), StorageMode::MemoryCache);

        for _ in 0..15 {
            manager.record_outcome("storage:memory_cache", false, Duration::ZERO, None);
        }
        assert_eq!(manager.active_storage_mode(), StorageMode::LocalStorage);

        for _ in 0..15 {
            manager.record_outcome("storage:local_storage", false, Duration::ZERO, None);
        }
        assert_eq!(manager.active_storage_mode(), StorageMode::ReadOnlyMode);

        for _ in 0..15 {
            manager.record_outcome("storage:read_only_mode", false, Duration::ZERO, None);
        }
        assert_eq!(manager.active_storage_mode(), StorageMode::OfflineMode);
    }

    #[tokio::test]
    async fn storage_modes_gate_reads_and_writes() {
        assert!(StorageMode::MemoryCache.allows_reads());
        assert!(StorageMode::MemoryCache.allows_writes());
        assert!(StorageMode::LocalStorage.allows_writes());
        assert!(StorageMode::ReadOnlyMode.allows_reads());
        assert!(!StorageMode::ReadOnlyMode.allows_writes());
        assert!(!StorageMode::OfflineMode.allows_reads());
        assert!(!StorageMode::OfflineMode.allows_writes());
    }

    #[tokio::test]
    async fn usage_history_tracks_attempts_and_last_used() {
        let (manager, clock) = manager();
        clock.set(1_000);
        manager.record_outcome("openai:gpt-4o", true, Duration::from_millis(50), None);
        clock.set(2_000);
        manager.record_outcome("openai:gpt-4o", false, Duration::from_millis(80), None);

        let stats = manager.usage("openai:gpt-4o").unwrap();
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.last_used_millis, 2_000);
    }

    #[tokio::test]
    async fn primary_ignores_health_filters() {
        let (manager, _clock) = manager();
        for _ in 0..20 {
            manager.record_outcome("openai:gpt-4o", false, Duration::ZERO, None);
        }
        let primary = manager.catalog().primary(&Role::new("gpt4o")).unwrap();
        assert_eq!(primary.model, "gpt-4o");
    }
}
