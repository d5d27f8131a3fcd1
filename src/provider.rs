//! Uniform contract over model provider SDKs.
//!
//! Providers are stateless black boxes: prompt and params in, text and usage
//! out, or an [`EnsembleError`] already classified by [`ErrorCategory`].
//! The [`ModelAdapter`] normalizes every call into a [`RoleOutput`],
//! enforces the prompt cap and the caller's deadline, and never retries;
//! breakers and retry wrap it from outside.

use crate::error::{EnsembleError, ErrorCategory};
use crate::role::{ProviderId, RoleBinding, RoleOutput};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Longest prompt any provider accepts.
pub const MAX_PROMPT_CHARS: usize = 25_000;

/// Sampling and sizing knobs forwarded to providers.
#[derive(Debug, Clone)]
pub struct ModelParams {
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self { max_tokens: 1_024, temperature: 0.7 }
    }
}

/// Raw provider response before normalization.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub content: String,
    /// Provider-reported usage when available; never invented.
    pub tokens_in: Option<u32>,
    pub tokens_out: Option<u32>,
    /// Provider-reported confidence when available.
    pub confidence: Option<f64>,
}

/// Black-box provider SDK. Implementations must be stateless and must map
/// their wire errors into classified [`EnsembleError`]s.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        params: &ModelParams,
    ) -> Result<ProviderResponse, EnsembleError>;
}

/// Registry of the providers the engine can address.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderId, Arc<dyn ModelProvider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&'static str> = self.providers.keys().map(|p| p.as_str()).collect();
        f.debug_struct("ProviderRegistry").field("providers", &ids).finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn ModelProvider>) {
        self.providers.insert(provider.id(), provider);
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<dyn ModelProvider>> {
        self.providers.get(&id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Normalizing adapter in front of every provider call.
#[derive(Debug, Clone, Default)]
pub struct ModelAdapter;

impl ModelAdapter {
    /// Invoke a provider for a role binding, bounded by `deadline`.
    ///
    /// Returns a fulfilled [`RoleOutput`]; all failures (including the
    /// deadline elapsing) come back as classified errors for the resilience
    /// layer to act on.
    pub async fn invoke(
        provider: &Arc<dyn ModelProvider>,
        binding: &RoleBinding,
        prompt: &str,
        params: &ModelParams,
        deadline: Instant,
    ) -> Result<RoleOutput, EnsembleError> {
        if prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(EnsembleError::validation(
                "prompt",
                format!("prompt exceeds {MAX_PROMPT_CHARS} characters"),
            ));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(EnsembleError::model_failure(
                binding.provider,
                &binding.model,
                ErrorCategory::Timeout,
                "deadline elapsed before provider call",
            ));
        }

        let started = Instant::now();
        let response =
            match tokio::time::timeout(remaining, provider.complete(&binding.model, prompt, params))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(EnsembleError::model_failure(
                        binding.provider,
                        &binding.model,
                        ErrorCategory::Timeout,
                        format!("provider call exceeded deadline ({remaining:?})"),
                    ))
                }
            };
        let latency = started.elapsed();

        if response.content.is_empty() {
            return Err(EnsembleError::model_failure(
                binding.provider,
                &binding.model,
                ErrorCategory::Unknown,
                "provider returned empty content",
            ));
        }

        let confidence = response
            .confidence
            .map(|c| c.clamp(0.0, 1.0))
            .unwrap_or_else(|| derived_confidence(&response.content));

        Ok(RoleOutput::fulfilled(
            binding,
            response.content,
            latency,
            response.tokens_in.unwrap_or(0),
            response.tokens_out.unwrap_or(0),
            confidence,
        ))
    }
}

/// Deterministic confidence heuristic for providers that report no score:
/// longer, properly terminated answers read as more confident, capped well
/// below certainty.
fn derived_confidence(content: &str) -> f64 {
    let trimmed = content.trim();
    let length_component = (trimmed.chars().count() as f64 / 2_000.0).min(0.35);
    let terminal_bonus = if trimmed.ends_with(['.', '!', '?', '`']) { 0.1 } else { 0.0 };
    (0.5 + length_component + terminal_bonus).min(0.95)
}
