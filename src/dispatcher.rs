//! Ensemble dispatcher: parallel fan-out to every enabled role, bounded by
//! deadlines, wrapped in breakers and retry, collated into one result.
//!
//! The engine is the crate's single logical entry point. One call to
//! [`EnsembleEngine::ensemble`] consults the cache, runs the role tasks on a
//! `JoinSet`, votes, synthesizes, stamps the degradation level, and caches
//! the outcome. Partial failure is normal; a request only errors for
//! invalid input, shed load, or a programmer bug.

use crate::breaker_registry::BreakerRegistry;
use crate::bulkhead::Bulkhead;
use crate::cache::{CacheStats, MultiTierCache};
use crate::cache_key::{cache_key, PREFIX_ENSEMBLE};
use crate::clock::{Clock, MonotonicClock};
use crate::config::EngineConfig;
use crate::degradation::{DegradationManager, ServiceCriticality};
use crate::envelope::ErrorEnvelope;
use crate::error::{EnsembleError, ErrorCategory};
use crate::events::{EngineEvent, EventSink, LogSink};
use crate::fallback::{Alternative, FallbackManager, ModelCatalog, StorageMode};
use crate::health::HealthTracker;
use crate::jitter::Jitter;
use crate::provider::{ModelAdapter, ModelParams, ModelProvider, ProviderRegistry};
use crate::recovery::{RecoveryAutomation, RecoveryProbe};
use crate::request::{EnsembleRequest, EnsembleResult, ValidatedRequest};
use crate::retry::{RetryPolicy, Waiter};
use crate::schedule::RetrySchedule;
use crate::role::{Role, RoleBinding, RoleOutput};
use crate::synthesis::{SynthesisEngine, SynthesisStatus, Synthesizer, SYNTHESIS_SERVICE};
use crate::voting::VotingEngine;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

use crate::request::Tier;

pub struct EnsembleEngine {
    inner: Arc<EngineInner>,
}

impl Clone for EnsembleEngine {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl std::fmt::Debug for EnsembleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnsembleEngine").field("config", &self.inner.config).finish()
    }
}

struct EngineInner {
    config: EngineConfig,
    providers: ProviderRegistry,
    params: ModelParams,
    fallbacks: Arc<FallbackManager>,
    breakers: BreakerRegistry,
    health: HealthTracker,
    cache: Arc<MultiTierCache>,
    degradation: Arc<DegradationManager>,
    voting: VotingEngine,
    synthesis: SynthesisEngine,
    retry: RetryPolicy,
    gate: Bulkhead,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    tier_roles: HashMap<Tier, Vec<Role>>,
}

impl EnsembleEngine {
    pub fn builder() -> EnsembleEngineBuilder {
        EnsembleEngineBuilder::new()
    }

    /// Run one ensemble request end to end.
    pub async fn ensemble(
        &self,
        request: EnsembleRequest,
    ) -> Result<EnsembleResult, EnsembleError> {
        let validated = request.into_validated()?;
        let inner = Arc::clone(&self.inner);
        self.inner.gate.execute(move || async move { EngineInner::run(inner, validated).await }).await
    }

    /// Like [`EnsembleEngine::ensemble`], but failures come back as the
    /// wire-format [`ErrorEnvelope`] for embedders that hand the JSON
    /// straight to a transport layer. The correlation id is stamped before
    /// anything can fail, so even validation rejections carry one.
    pub async fn ensemble_enveloped(
        &self,
        request: EnsembleRequest,
    ) -> Result<EnsembleResult, Box<ErrorEnvelope>> {
        let correlation_id = match &request.correlation_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        let request = request.with_correlation_id(correlation_id.clone());

        self.ensemble(request)
            .await
            .map_err(|e| Box::new(ErrorEnvelope::from_error(&e, "ensemble", &correlation_id)))
    }

    /// Spawn cache maintenance and (when enabled) recovery automation.
    /// Tasks abort when the returned handle is dropped.
    pub fn start_background(&self) -> BackgroundTasks {
        let mut handles = vec![self.inner.cache.spawn_maintenance()];

        if self.inner.config.auto_recovery_enabled {
            let probe: Arc<dyn RecoveryProbe> = Arc::new(ProviderProbe {
                providers: self.inner.providers.clone(),
                params: self.inner.params.clone(),
            });
            let automation = Arc::new(
                RecoveryAutomation::new(
                    self.inner.breakers.clone(),
                    self.inner.health.clone(),
                    probe,
                    Arc::clone(&self.inner.degradation),
                    self.inner.config.recovery_interval,
                    Arc::clone(&self.inner.clock),
                )
                .with_sink(Arc::clone(&self.inner.events)),
            );
            handles.push(automation.spawn());
        }

        BackgroundTasks { handles }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.inner.breakers
    }

    pub fn health(&self) -> &HealthTracker {
        &self.inner.health
    }

    pub fn degradation(&self) -> &DegradationManager {
        &self.inner.degradation
    }
}

/// Handles for the engine's background loops; aborted on drop.
pub struct BackgroundTasks {
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl EngineInner {
    async fn run(
        self: Arc<Self>,
        req: ValidatedRequest,
    ) -> Result<EnsembleResult, EnsembleError> {
        // Storage degrades down its own chain independently of the
        // feature-level restriction: read-only stops writes, offline stops
        // cache traffic entirely.
        let storage = self.fallbacks.active_storage_mode();
        if storage != StorageMode::MemoryCache {
            self.events.emit(EngineEvent::FallbackEngaged {
                domain: "storage",
                alternative: storage.as_str().to_string(),
            });
        }
        let caching_allowed = !self.degradation.is_feature_restricted("caching");
        let key = cache_key(PREFIX_ENSEMBLE, &req.fingerprint())?;

        if caching_allowed && storage.allows_reads() {
            if let Some(mut cached) = self.cache.get::<EnsembleResult>(&key) {
                self.events.emit(EngineEvent::CacheHit { key });
                cached.from_cache = true;
                cached.correlation_id = req.correlation_id.clone();
                return Ok(cached);
            }
            self.events.emit(EngineEvent::CacheMiss { key: key.clone() });
        }

        let deadline = Instant::now() + self.config.ensemble_deadline;
        let role_budget = self.config.role_deadline.min(self.config.ensemble_deadline);
        let roles = self.enabled_roles(req.tier);

        let mut join_set: JoinSet<RoleOutput> = JoinSet::new();
        for role in roles.iter().cloned() {
            let engine = Arc::clone(&self);
            let prompt = req.prompt.clone();
            let role_deadline = (Instant::now() + role_budget).min(deadline);
            join_set.spawn(async move { engine.run_role(role, prompt, role_deadline).await });
        }

        let mut outputs: Vec<RoleOutput> = Vec::with_capacity(roles.len());
        let collect = async {
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(output) => outputs.push(output),
                    Err(e) => tracing::warn!(error = %e, "role task did not complete"),
                }
            }
        };
        let deadline_tokio = tokio::time::Instant::now()
            + deadline.saturating_duration_since(Instant::now());
        if tokio::time::timeout_at(deadline_tokio, collect).await.is_err() {
            tracing::warn!(
                correlation_id = %req.correlation_id,
                "request deadline elapsed, cancelling outstanding role tasks"
            );
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
        }

        // Roles whose tasks never delivered become failed(timeout) outputs.
        for role in &roles {
            if !outputs.iter().any(|o| &o.role == role) {
                if let Some(binding) = self.fallbacks.catalog().primary(role) {
                    outputs.push(RoleOutput::timed_out(&binding, role_budget));
                }
            }
        }
        outputs.sort_by(|a, b| a.role.cmp(&b.role));

        let analytics_allowed = !self.degradation.is_feature_restricted("detailed_analytics");
        if analytics_allowed {
            for output in &outputs {
                if output.is_fulfilled() {
                    self.events.emit(EngineEvent::RoleFulfilled {
                        role: output.role.clone(),
                        latency: output.latency,
                    });
                } else {
                    self.events.emit(EngineEvent::RoleFailed {
                        role: output.role.clone(),
                        category: ErrorCategory::Unknown,
                    });
                }
            }
        }

        let complex_voting_allowed = !self.degradation.is_feature_restricted("complex_voting")
            && !self.degradation.is_feature_restricted("voting");
        let voting = self.voting.decide(&outputs, complex_voting_allowed)?;

        let enhanced_allowed = !self.degradation.is_feature_restricted("enhanced_synthesis");
        let synthesis = self
            .synthesis
            .synthesize(&req.prompt, &outputs, Some(&voting.winner), None, enhanced_allowed, deadline)
            .await;
        self.events.emit(EngineEvent::SynthesisCompleted {
            status: synthesis.status.as_str(),
            fallback_used: synthesis.fallback_used.clone(),
        });

        let level = if self.config.graceful_degradation_enabled {
            self.degradation.assess(&self.health.snapshot(), &self.breakers.snapshot())
        } else {
            self.degradation.current()
        };

        let result = EnsembleResult {
            correlation_id: req.correlation_id.clone(),
            role_outputs: outputs,
            voting,
            synthesis,
            from_cache: false,
            degradation_level: level.as_str().to_string(),
            created_at: Utc::now(),
        };

        let any_fulfilled = result.role_outputs.iter().any(RoleOutput::is_fulfilled);
        if caching_allowed
            && storage.allows_writes()
            && any_fulfilled
            && result.synthesis.status != SynthesisStatus::EmergencyFallback
        {
            let storage_service = format!("storage:{}", storage.as_str());
            match self.cache.set(&key, &result, None) {
                Ok(()) => {
                    self.fallbacks.record_outcome(&storage_service, true, Duration::ZERO, None);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to cache ensemble result");
                    self.fallbacks.record_outcome(
                        &storage_service,
                        false,
                        Duration::ZERO,
                        Some(&e),
                    );
                }
            }
        }

        Ok(result)
    }

    /// One role task: walk the health-ranked candidates, each through its
    /// breaker and the retry policy, until one produces a fulfilled output
    /// or the deadline kills the attempt.
    async fn run_role(
        self: Arc<Self>,
        role: Role,
        prompt: String,
        deadline: Instant,
    ) -> RoleOutput {
        let started = Instant::now();

        let mut candidates = self.fallbacks.model_candidates(&role);
        if self.degradation.is_feature_restricted("model_fallbacks") {
            candidates.truncate(1);
        }
        if candidates.is_empty() {
            // Everything is filtered; the primary still gets one shot (its
            // breaker will short-circuit if it is the reason).
            match self.fallbacks.catalog().primary(&role) {
                Some(binding) => candidates = vec![Alternative::new(binding, 1, 0.5)],
                None => {
                    let binding = RoleBinding::new(role.clone(), crate::role::ProviderId::OpenAi, "unknown");
                    return RoleOutput::failed(
                        &binding,
                        format!("role {role} has no catalog entry"),
                        started.elapsed(),
                    );
                }
            }
        }

        let mut last: Option<(RoleBinding, EnsembleError)> = None;
        let mut first_candidate = true;

        for alternative in candidates {
            let binding = alternative.value;
            let service = binding.service_name();

            let Some(provider) = self.providers.get(binding.provider) else {
                tracing::warn!(service = %service, "no provider registered, skipping candidate");
                continue;
            };
            let breaker = self.breakers.get_or_create(&service);

            let attempt_started = Instant::now();
            let result = self
                .retry
                .execute_until(deadline, || {
                    let provider = Arc::clone(&provider);
                    let binding = binding.clone();
                    let prompt = prompt.clone();
                    let params = self.params.clone();
                    let breaker = Arc::clone(&breaker);
                    async move {
                        breaker
                            .execute(|| {
                                ModelAdapter::invoke(&provider, &binding, &prompt, &params, deadline)
                            })
                            .await
                    }
                })
                .await;

            let elapsed = attempt_started.elapsed();
            match result {
                Ok(output) => {
                    self.fallbacks.record_outcome(&service, true, output.latency, None);
                    if !first_candidate {
                        self.events.emit(EngineEvent::FallbackEngaged {
                            domain: "model",
                            alternative: service,
                        });
                    }
                    return output;
                }
                Err(e) => {
                    tracing::debug!(service = %service, role = %role, error = %e, "candidate failed");
                    self.fallbacks.record_outcome(&service, false, elapsed, Some(&e));
                    last = Some((binding, e));
                    first_candidate = false;
                    if Instant::now() >= deadline {
                        break;
                    }
                }
            }
        }

        match last {
            Some((binding, error)) => RoleOutput::failed(&binding, error, started.elapsed()),
            None => {
                // Candidates existed but none had a registered provider.
                let binding = self
                    .fallbacks
                    .catalog()
                    .primary(&role)
                    .unwrap_or_else(|| {
                        RoleBinding::new(role.clone(), crate::role::ProviderId::OpenAi, "unknown")
                    });
                RoleOutput::failed(&binding, "no provider available for role", started.elapsed())
            }
        }
    }

    fn enabled_roles(&self, tier: Tier) -> Vec<Role> {
        match self.tier_roles.get(&tier) {
            Some(roles) if !roles.is_empty() => roles.clone(),
            _ => self.fallbacks.catalog().roles(),
        }
    }
}

/// Probes a `provider:model` service with a one-token prompt.
struct ProviderProbe {
    providers: ProviderRegistry,
    params: ModelParams,
}

#[async_trait]
impl RecoveryProbe for ProviderProbe {
    async fn probe(&self, service: &str) -> Result<(), EnsembleError> {
        let (provider_name, model) = service
            .split_once(':')
            .ok_or_else(|| EnsembleError::internal(format!("unparseable service name {service}")))?;

        let provider_id = match provider_name {
            "openai" => crate::role::ProviderId::OpenAi,
            "anthropic" => crate::role::ProviderId::Anthropic,
            "google" => crate::role::ProviderId::Google,
            "xai" => crate::role::ProviderId::Xai,
            other => {
                return Err(EnsembleError::internal(format!("unknown provider {other}")));
            }
        };
        let provider = self.providers.get(provider_id).ok_or_else(|| {
            EnsembleError::internal(format!("no provider registered for {provider_name}"))
        })?;

        let mut params = self.params.clone();
        params.max_tokens = 1;
        match tokio::time::timeout(Duration::from_secs(5), provider.complete(model, "ping", &params))
            .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EnsembleError::model_failure(
                provider_id,
                model,
                ErrorCategory::Timeout,
                "probe timed out",
            )),
        }
    }
}

pub struct EnsembleEngineBuilder {
    config: EngineConfig,
    providers: ProviderRegistry,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    catalog: ModelCatalog,
    params: ModelParams,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    waiter: Waiter,
    tier_roles: HashMap<Tier, Vec<Role>>,
}

impl Default for EnsembleEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EnsembleEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            providers: ProviderRegistry::new(),
            synthesizer: None,
            catalog: ModelCatalog::standard(),
            params: ModelParams::default(),
            events: Arc::new(LogSink),
            clock: Arc::new(MonotonicClock::default()),
            waiter: Waiter::Tokio,
            tier_roles: HashMap::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn provider(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.providers.register(provider);
        self
    }

    pub fn synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn params(mut self, params: ModelParams) -> Self {
        self.params = params;
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Override the clock driving breakers, cache TTLs, and recovery
    /// schedules (deterministic tests).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override how retry delays are waited out (deterministic tests).
    pub fn waiter(mut self, waiter: Waiter) -> Self {
        self.waiter = waiter;
        self
    }

    /// Restrict a tier to a subset of catalog roles.
    pub fn tier_roles(mut self, tier: Tier, roles: Vec<Role>) -> Self {
        self.tier_roles.insert(tier, roles);
        self
    }

    pub fn build(self) -> Result<EnsembleEngine, EnsembleError> {
        if self.providers.is_empty() {
            return Err(EnsembleError::validation("providers", "at least one provider is required"));
        }
        if self.catalog.roles().is_empty() {
            return Err(EnsembleError::validation("catalog", "model catalog must not be empty"));
        }
        for (tier, roles) in &self.tier_roles {
            for role in roles {
                if self.catalog.alternatives_for(role).is_empty() {
                    return Err(EnsembleError::validation(
                        "tierRoles",
                        format!("role {role} for tier {} is not in the catalog", tier.as_str()),
                    ));
                }
            }
        }

        let health = HealthTracker::new();
        let breakers = BreakerRegistry::new(
            self.config.breaker.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.events),
        );
        let fallbacks = Arc::new(FallbackManager::new(
            self.catalog,
            health.clone(),
            breakers.clone(),
            Arc::clone(&self.clock),
        ));
        let cache = Arc::new(MultiTierCache::with_clock(
            self.config.cache.clone(),
            Arc::clone(&self.clock),
        ));
        let degradation = Arc::new(
            DegradationManager::new(self.config.graceful_degradation_enabled)
                .with_sink(Arc::clone(&self.events))
                .classify(SYNTHESIS_SERVICE, ServiceCriticality::Core),
        );

        let retry = RetryPolicy::builder()
            .max_attempts(self.config.retry.max_attempts)
            .map_err(|e| EnsembleError::validation("retry", e.to_string()))?
            .schedule(RetrySchedule::new(
                self.config.retry.base_delay,
                self.config.retry.multiplier,
                self.config.retry.max_delay,
            ))
            .with_jitter(Jitter::additive(self.config.retry.jitter))
            .waiter(self.waiter.clone())
            .build();

        let voting = VotingEngine::new(Arc::clone(&fallbacks));
        let synthesis = SynthesisEngine::new(self.synthesizer, Arc::clone(&fallbacks));
        let gate = Bulkhead::new(self.config.max_concurrent_requests);

        Ok(EnsembleEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                providers: self.providers,
                params: self.params,
                fallbacks,
                breakers,
                health,
                cache,
                degradation,
                voting,
                synthesis,
                retry,
                gate,
                events: self.events,
                clock: self.clock,
                tier_roles: self.tier_roles,
            }),
        })
    }
}
