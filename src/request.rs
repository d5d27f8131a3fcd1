//! Ensemble request and result types.
//!
//! Validation happens once at the edge: prompts are capped, ids must be
//! non-empty, and the correlation id is always populated before any other
//! component can observe the request.

use crate::error::EnsembleError;
use crate::provider::MAX_PROMPT_CHARS;
use crate::role::RoleOutput;
use crate::synthesis::SynthesisResult;
use crate::voting::VotingResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription tier of the requesting user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Premium,
}

impl Tier {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
        }
    }
}

/// Incoming request, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsembleRequest {
    pub prompt: String,
    pub user_id: String,
    pub session_id: String,
    pub tier: Tier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl EnsembleRequest {
    pub fn new(
        prompt: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        tier: Tier,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            tier,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Validate and stamp a correlation id if the caller didn't supply one.
    pub fn into_validated(self) -> Result<ValidatedRequest, EnsembleError> {
        if self.prompt.is_empty() {
            return Err(EnsembleError::validation("prompt", "prompt must not be empty"));
        }
        if self.prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(EnsembleError::validation(
                "prompt",
                format!("prompt exceeds {MAX_PROMPT_CHARS} characters"),
            ));
        }
        if self.user_id.is_empty() {
            return Err(EnsembleError::validation("userId", "userId must not be empty"));
        }
        if self.session_id.is_empty() {
            return Err(EnsembleError::validation("sessionId", "sessionId must not be empty"));
        }

        let correlation_id = match self.correlation_id {
            Some(id) if !id.is_empty() => id,
            _ => Uuid::new_v4().to_string(),
        };

        Ok(ValidatedRequest {
            prompt: self.prompt,
            user_id: self.user_id,
            session_id: self.session_id,
            tier: self.tier,
            correlation_id,
        })
    }
}

/// Request that passed validation; the correlation id is always present.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub prompt: String,
    pub user_id: String,
    pub session_id: String,
    pub tier: Tier,
    pub correlation_id: String,
}

impl ValidatedRequest {
    /// The cache identity of this request: synthesis depends only on these
    /// three fields, so sessions share cached answers.
    #[must_use]
    pub fn fingerprint(&self) -> CacheFingerprint<'_> {
        CacheFingerprint { prompt: &self.prompt, user_id: &self.user_id, tier: self.tier }
    }
}

/// Payload hashed into the ensemble cache key.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheFingerprint<'a> {
    pub prompt: &'a str,
    pub user_id: &'a str,
    pub tier: Tier,
}

/// Final ensemble response with provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsembleResult {
    pub correlation_id: String,
    /// Sorted by role name; stable across runs.
    pub role_outputs: Vec<RoleOutput>,
    pub voting: VotingResult,
    pub synthesis: SynthesisResult,
    pub from_cache: bool,
    pub degradation_level: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> EnsembleRequest {
        EnsembleRequest::new("What is 2+2?", "u1", "s1", Tier::Free)
    }

    #[test]
    fn valid_request_passes_and_gets_a_correlation_id() {
        let validated = request().into_validated().unwrap();
        assert!(!validated.correlation_id.is_empty());
        assert_eq!(validated.tier, Tier::Free);
    }

    #[test]
    fn caller_correlation_id_is_preserved() {
        let validated =
            request().with_correlation_id("corr-42").into_validated().unwrap();
        assert_eq!(validated.correlation_id, "corr-42");
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let mut req = request();
        req.prompt.clear();
        let err = req.into_validated().unwrap_err();
        assert!(matches!(err, EnsembleError::Validation { field: "prompt", .. }));
    }

    #[test]
    fn prompt_boundaries() {
        let mut req = request();
        req.prompt = "p".repeat(MAX_PROMPT_CHARS);
        assert!(req.clone().into_validated().is_ok());

        req.prompt.push('p');
        assert!(req.into_validated().is_err());

        let mut one = request();
        one.prompt = "p".to_string();
        assert!(one.into_validated().is_ok());
    }

    #[test]
    fn empty_ids_are_rejected() {
        let mut req = request();
        req.user_id.clear();
        assert!(matches!(
            req.into_validated().unwrap_err(),
            EnsembleError::Validation { field: "userId", .. }
        ));

        let mut req = request();
        req.session_id.clear();
        assert!(matches!(
            req.into_validated().unwrap_err(),
            EnsembleError::Validation { field: "sessionId", .. }
        ));
    }

    #[test]
    fn fingerprint_ignores_session() {
        let a = EnsembleRequest::new("p", "u", "s1", Tier::Premium).into_validated().unwrap();
        let b = EnsembleRequest::new("p", "u", "s2", Tier::Premium).into_validated().unwrap();
        let key_a = crate::cache_key::cache_key("ensemble", &a.fingerprint()).unwrap();
        let key_b = crate::cache_key::cache_key("ensemble", &b.fingerprint()).unwrap();
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn fingerprint_distinguishes_tier() {
        let free = EnsembleRequest::new("p", "u", "s", Tier::Free).into_validated().unwrap();
        let premium = EnsembleRequest::new("p", "u", "s", Tier::Premium).into_validated().unwrap();
        let key_free = crate::cache_key::cache_key("ensemble", &free.fingerprint()).unwrap();
        let key_premium = crate::cache_key::cache_key("ensemble", &premium.fingerprint()).unwrap();
        assert_ne!(key_free, key_premium);
    }
}
