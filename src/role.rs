//! Roles: the logical participants of an ensemble and their outputs.
//!
//! A role (`gpt4o`, `gemini`, `claude`, `xai`) is bound to a concrete
//! `(provider, model)` pair. Every role task terminates in exactly one
//! [`RoleOutput`], fulfilled or failed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Logical participant name, ordered lexicographically so result ordering
/// over roles is stable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(String);

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Role(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Role {
    fn from(name: &str) -> Self {
        Role(name.to_string())
    }
}

/// Upstream model providers the engine knows how to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenAi,
    Anthropic,
    Google,
    Xai,
}

impl ProviderId {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Google => "google",
            ProviderId::Xai => "xai",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete binding of a role to a provider and model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBinding {
    pub role: Role,
    pub provider: ProviderId,
    pub model: String,
}

impl RoleBinding {
    pub fn new(role: impl Into<Role>, provider: ProviderId, model: impl Into<String>) -> Self {
        Self { role: role.into(), provider, model: model.into() }
    }

    /// Service identifier used for circuit breakers and health records.
    #[must_use]
    pub fn service_name(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }
}

/// Terminal status of a role task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleStatus {
    Fulfilled,
    Failed,
}

/// Coarse label derived from the confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    VeryLow,
    Low,
    Medium,
    High,
}

impl ConfidenceLevel {
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score < 0.3 {
            ConfidenceLevel::VeryLow
        } else if score < 0.5 {
            ConfidenceLevel::Low
        } else if score < 0.75 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::High
        }
    }
}

/// One per model queried. Invariant: `status == Fulfilled` implies non-empty
/// content and a confidence in `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleOutput {
    pub role: Role,
    pub provider: ProviderId,
    pub model: String,
    pub status: RoleStatus,
    pub content: String,
    #[serde(rename = "latencyMs", with = "duration_millis")]
    pub latency: Duration,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub confidence: f64,
    pub confidence_level: ConfidenceLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RoleOutput {
    /// A fulfilled output. Confidence is clamped into `[0, 1]`.
    pub fn fulfilled(
        binding: &RoleBinding,
        content: String,
        latency: Duration,
        tokens_in: u32,
        tokens_out: u32,
        confidence: f64,
    ) -> Self {
        let confidence = confidence.clamp(0.0, 1.0);
        Self {
            role: binding.role.clone(),
            provider: binding.provider,
            model: binding.model.clone(),
            status: RoleStatus::Fulfilled,
            content,
            latency,
            tokens_in,
            tokens_out,
            confidence,
            confidence_level: ConfidenceLevel::from_score(confidence),
            error: None,
        }
    }

    /// A failed output carrying the terminal error message.
    pub fn failed(binding: &RoleBinding, error: impl fmt::Display, latency: Duration) -> Self {
        Self {
            role: binding.role.clone(),
            provider: binding.provider,
            model: binding.model.clone(),
            status: RoleStatus::Failed,
            content: String::new(),
            latency,
            tokens_in: 0,
            tokens_out: 0,
            confidence: 0.0,
            confidence_level: ConfidenceLevel::VeryLow,
            error: Some(error.to_string()),
        }
    }

    /// A failed output for a role whose task never delivered before the
    /// request deadline.
    pub fn timed_out(binding: &RoleBinding, deadline: Duration) -> Self {
        Self::failed(
            binding,
            format!("role task exceeded deadline of {:?}", deadline),
            deadline,
        )
    }

    #[must_use]
    pub fn is_fulfilled(&self) -> bool {
        self.status == RoleStatus::Fulfilled
    }
}

/// Serialize `Duration` as integer milliseconds (`latencyMs` on the wire).
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
