//! Convenient re-exports for common Chorus types.
pub use crate::{
    CircuitBreakerConfig, CircuitState, Consensus, DegradationLevel, EngineConfig,
    EnsembleEngine, EnsembleError, EnsembleRequest, EnsembleResult, ErrorCategory, Jitter,
    ModelCatalog, ModelParams, ModelProvider, ProviderId, ProviderResponse, RetryPolicy,
    RetrySchedule, Role, RoleBinding, RoleOutput, RoleStatus, SynthesisResult, SynthesisStatus,
    Synthesizer, Tier, VotingResult,
};
