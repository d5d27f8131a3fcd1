#![forbid(unsafe_code)]

//! # Chorus
//!
//! AI ensemble orchestration for async Rust: fan one prompt out to several
//! LLM providers in parallel, aggregate their answers by weighted voting,
//! synthesize a single response, and stay standing when providers fall over.
//!
//! ## What's inside
//!
//! - **Ensemble dispatcher** with per-role deadlines, cancellation, and
//!   deterministic result ordering
//! - **Resilience layer**: classified errors, circuit breakers with sliding
//!   failure windows, retry with backoff + jitter, ranked fallbacks
//! - **Weighted voting** and **progressive synthesis** over role outputs
//! - **Multi-tier cache** (hot/warm/cold) with compression, promotion, and
//!   LRU eviction
//! - **Graceful degradation** and background **recovery automation**
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use chorus::{
//!     EnsembleEngine, EnsembleRequest, EngineConfig, ModelParams, ModelProvider,
//!     ProviderId, ProviderResponse, Tier,
//! };
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct OpenAiSdk; // your SDK binding
//!
//! #[async_trait]
//! impl ModelProvider for OpenAiSdk {
//!     fn id(&self) -> ProviderId {
//!         ProviderId::OpenAi
//!     }
//!
//!     async fn complete(
//!         &self,
//!         model: &str,
//!         prompt: &str,
//!         _params: &ModelParams,
//!     ) -> Result<ProviderResponse, chorus::EnsembleError> {
//!         // call the provider here
//!         Ok(ProviderResponse {
//!             content: format!("{model} says hello to: {prompt}"),
//!             tokens_in: Some(12),
//!             tokens_out: Some(5),
//!             confidence: None,
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), chorus::EnsembleError> {
//!     let engine = EnsembleEngine::builder()
//!         .config(EngineConfig::from_env())
//!         .provider(Arc::new(OpenAiSdk))
//!         .build()?;
//!     let _background = engine.start_background();
//!
//!     let result = engine
//!         .ensemble(EnsembleRequest::new("What is 2+2?", "u1", "s1", Tier::Free))
//!         .await?;
//!     println!("{} (winner: {})", result.synthesis.content, result.voting.winner);
//!     Ok(())
//! }
//! ```

mod breaker_registry;
mod bulkhead;
mod cache;
mod cache_key;
mod circuit_breaker;
mod clock;
mod config;
mod degradation;
mod dispatcher;
mod envelope;
mod error;
mod events;
mod fallback;
mod health;
mod jitter;
mod provider;
mod recovery;
mod request;
mod retry;
mod role;
mod schedule;
mod synthesis;
mod voting;

// Re-exports
pub use breaker_registry::BreakerRegistry;
pub use bulkhead::Bulkhead;
pub use cache::{CacheSettings, CacheStats, CacheTier, MultiTierCache};
pub use cache_key::{cache_key, PREFIX_ENSEMBLE, PREFIX_HEALTH, PREFIX_MEMORY};
pub use circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ConfigError, EngineConfig, RetrySettings};
pub use degradation::{
    DegradationLevel, DegradationManager, DegradationState, ServiceCriticality,
};
pub use dispatcher::{BackgroundTasks, EnsembleEngine, EnsembleEngineBuilder};
pub use envelope::{Audience, ErrorEnvelope, RecoveryAdvice, RecoveryActionAdvice, Severity};
pub use error::{EnsembleError, ErrorCategory};
pub use events::{EngineEvent, EventSink, LogSink, MemorySink, NullSink};
pub use fallback::{
    Alternative, FallbackCandidate, FallbackManager, ModelCatalog, StorageMode,
    SynthesisStrategy, UsageStats, VotingStrategy,
};
pub use health::{HealthRecord, HealthTracker};
pub use provider::{
    ModelAdapter, ModelParams, ModelProvider, ProviderRegistry, ProviderResponse,
    MAX_PROMPT_CHARS,
};
pub use recovery::{playbook, RecoveryAction, RecoveryAutomation, RecoveryProbe};
pub use request::{EnsembleRequest, EnsembleResult, Tier, ValidatedRequest};
pub use retry::{DelayLog, RetryBuildError, RetryPolicy, RetryPolicyBuilder, Waiter};
pub use role::{ConfidenceLevel, ProviderId, Role, RoleBinding, RoleOutput, RoleStatus};
pub use schedule::RetrySchedule;
pub use synthesis::{
    SynthesisEngine, SynthesisResult, SynthesisStatus, Synthesizer, EMERGENCY_CONTENT,
};
pub use jitter::Jitter;
pub use voting::{vote, vote_with_strategy, Consensus, VotingEngine, VotingResult};

pub mod prelude;
