//! Synthesis: one final answer out of many role outputs.
//!
//! The enhanced path hands the fulfilled outputs to a [`Synthesizer`]
//! (itself a model behind the provider contract). When that path is
//! restricted or fails, the engine walks the synthesis fallback chain and,
//! as the last resort, returns the fixed emergency payload. Status reflects
//! exactly which path produced the content.

use crate::error::EnsembleError;
use crate::fallback::{FallbackManager, SynthesisStrategy};
use crate::role::{ProviderId, RoleOutput};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fixed payload when every synthesis path is exhausted.
pub const EMERGENCY_CONTENT: &str = "We're sorry - all of our AI services are temporarily \
unavailable. Your request was received and nothing was lost; please try again in a few moments.";

/// Health-tracking service name for the enhanced path.
pub const SYNTHESIS_SERVICE: &str = "synthesis";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisStatus {
    Ok,
    Fallback,
    EmergencyFallback,
}

impl SynthesisStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SynthesisStatus::Ok => "ok",
            SynthesisStatus::Fallback => "fallback",
            SynthesisStatus::EmergencyFallback => "emergency_fallback",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisResult {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub status: SynthesisStatus,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_used: Option<String>,
    pub source_count: usize,
}

impl SynthesisResult {
    /// The terminal emergency payload.
    #[must_use]
    pub fn emergency() -> Self {
        Self {
            content: EMERGENCY_CONTENT.to_string(),
            model: "emergency".to_string(),
            provider: "none".to_string(),
            status: SynthesisStatus::EmergencyFallback,
            confidence: 0.1,
            fallback_used: None,
            source_count: 0,
        }
    }
}

/// Enhanced synthesis path: merge role outputs into one answer.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn provider(&self) -> ProviderId;
    fn model(&self) -> &str;

    async fn synthesize(
        &self,
        prompt: &str,
        outputs: &[RoleOutput],
    ) -> Result<String, EnsembleError>;
}

/// Policy layer walking enhanced → named fallbacks → emergency.
pub struct SynthesisEngine {
    synthesizer: Option<Arc<dyn Synthesizer>>,
    fallbacks: Arc<FallbackManager>,
}

impl SynthesisEngine {
    pub fn new(synthesizer: Option<Arc<dyn Synthesizer>>, fallbacks: Arc<FallbackManager>) -> Self {
        Self { synthesizer, fallbacks }
    }

    /// Produce the final answer.
    ///
    /// `enhanced_allowed` is false when degradation restricts enhanced
    /// synthesis. `cached_content` backs the `cached_response` strategy.
    pub async fn synthesize(
        &self,
        prompt: &str,
        outputs: &[RoleOutput],
        winner_role: Option<&crate::role::Role>,
        cached_content: Option<String>,
        enhanced_allowed: bool,
        deadline: Instant,
    ) -> SynthesisResult {
        let fulfilled: Vec<&RoleOutput> = outputs.iter().filter(|o| o.is_fulfilled()).collect();
        if fulfilled.is_empty() {
            return SynthesisResult::emergency();
        }

        if enhanced_allowed {
            if let Some(result) = self.try_enhanced(prompt, outputs, &fulfilled, deadline).await {
                return result;
            }
        }

        for alternative in self.fallbacks.synthesis_chain() {
            let strategy = alternative.value;
            let produced = run_strategy(strategy, &fulfilled, winner_role, prompt, cached_content.as_deref());
            let service = format!("synthesis:{}", strategy.as_str());
            match produced {
                Some(result) => {
                    self.fallbacks.record_outcome(&service, true, Duration::ZERO, None);
                    return result;
                }
                None => {
                    let err = EnsembleError::Synthesis {
                        message: format!("{} produced nothing", strategy.as_str()),
                    };
                    self.fallbacks.record_outcome(&service, false, Duration::ZERO, Some(&err));
                }
            }
        }

        SynthesisResult::emergency()
    }

    async fn try_enhanced(
        &self,
        prompt: &str,
        outputs: &[RoleOutput],
        fulfilled: &[&RoleOutput],
        deadline: Instant,
    ) -> Option<SynthesisResult> {
        let synthesizer = self.synthesizer.as_ref()?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            let err =
                EnsembleError::Synthesis { message: "no deadline budget left".to_string() };
            self.fallbacks.record_outcome(SYNTHESIS_SERVICE, false, Duration::ZERO, Some(&err));
            return None;
        }

        let started = Instant::now();
        let synthesized =
            match tokio::time::timeout(remaining, synthesizer.synthesize(prompt, outputs)).await {
                Ok(Ok(content)) if !content.is_empty() => content,
                Ok(Ok(_)) => {
                    let err = EnsembleError::Synthesis {
                        message: "synthesizer returned empty content".to_string(),
                    };
                    self.fallbacks.record_outcome(
                        SYNTHESIS_SERVICE,
                        false,
                        started.elapsed(),
                        Some(&err),
                    );
                    return None;
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "enhanced synthesis failed");
                    self.fallbacks.record_outcome(
                        SYNTHESIS_SERVICE,
                        false,
                        started.elapsed(),
                        Some(&e),
                    );
                    return None;
                }
                Err(_) => {
                    tracing::warn!("enhanced synthesis exceeded deadline");
                    let err = EnsembleError::model_failure(
                        synthesizer.provider(),
                        synthesizer.model(),
                        crate::error::ErrorCategory::Timeout,
                        "synthesis deadline exceeded",
                    );
                    self.fallbacks.record_outcome(SYNTHESIS_SERVICE, false, remaining, Some(&err));
                    return None;
                }
            };
        self.fallbacks.record_outcome(SYNTHESIS_SERVICE, true, started.elapsed(), None);

        let avg_confidence: f64 =
            fulfilled.iter().map(|o| o.confidence).sum::<f64>() / fulfilled.len() as f64;
        Some(SynthesisResult {
            content: synthesized,
            model: synthesizer.model().to_string(),
            provider: synthesizer.provider().as_str().to_string(),
            status: SynthesisStatus::Ok,
            confidence: avg_confidence.min(0.95),
            fallback_used: None,
            source_count: fulfilled.len(),
        })
    }
}

/// Pure strategy execution; `None` means the strategy cannot apply.
fn run_strategy(
    strategy: SynthesisStrategy,
    fulfilled: &[&RoleOutput],
    winner_role: Option<&crate::role::Role>,
    prompt: &str,
    cached_content: Option<&str>,
) -> Option<SynthesisResult> {
    let quality = strategy.baseline_quality();
    match strategy {
        SynthesisStrategy::BestResponseSelection => {
            let best = winner_role
                .and_then(|role| fulfilled.iter().find(|o| &o.role == role))
                .or_else(|| {
                    fulfilled.iter().max_by(|a, b| {
                        a.confidence
                            .partial_cmp(&b.confidence)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| b.role.cmp(&a.role))
                    })
                })?;
            Some(SynthesisResult {
                content: best.content.clone(),
                model: best.model.clone(),
                provider: best.provider.as_str().to_string(),
                status: SynthesisStatus::Fallback,
                confidence: best.confidence.min(quality),
                fallback_used: Some(strategy.as_str().to_string()),
                source_count: 1,
            })
        }
        SynthesisStrategy::SimpleConcatenation => {
            if fulfilled.is_empty() {
                return None;
            }
            let content = fulfilled
                .iter()
                .map(|o| format!("[{}] {}", o.role, o.content))
                .collect::<Vec<_>>()
                .join("\n\n");
            let avg: f64 =
                fulfilled.iter().map(|o| o.confidence).sum::<f64>() / fulfilled.len() as f64;
            Some(SynthesisResult {
                content,
                model: "ensemble-concat".to_string(),
                provider: "none".to_string(),
                status: SynthesisStatus::Fallback,
                confidence: avg.min(quality),
                fallback_used: Some(strategy.as_str().to_string()),
                source_count: fulfilled.len(),
            })
        }
        SynthesisStrategy::TemplateBased => {
            let best = fulfilled.first()?;
            let content = format!(
                "Based on the available responses to \"{}\": {}",
                truncate(prompt, 120),
                best.content
            );
            Some(SynthesisResult {
                content,
                model: "ensemble-template".to_string(),
                provider: "none".to_string(),
                status: SynthesisStatus::Fallback,
                confidence: quality,
                fallback_used: Some(strategy.as_str().to_string()),
                source_count: 1,
            })
        }
        SynthesisStrategy::CachedResponse => {
            let content = cached_content?.to_string();
            if content.is_empty() {
                return None;
            }
            Some(SynthesisResult {
                content,
                model: "cache".to_string(),
                provider: "none".to_string(),
                status: SynthesisStatus::Fallback,
                confidence: quality,
                fallback_used: Some(strategy.as_str().to_string()),
                source_count: 0,
            })
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
