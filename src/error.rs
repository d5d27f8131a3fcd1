//! Error taxonomy and classification.
//!
//! Every failure in the engine is an [`EnsembleError`], and every error
//! answers two questions the resilience layer needs: is it operational
//! (environment misbehaving) or a programmer bug, and is it worth retrying.
//! Adapters map provider responses into a coarse [`ErrorCategory`] that also
//! drives the recovery playbooks and the wire envelope.

use crate::role::ProviderId;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

/// Coarse classification of a failure, shared by retry decisions, recovery
/// playbooks, and the error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    RateLimit,
    Timeout,
    ServerError,
    NetworkError,
    AuthError,
    QuotaExceeded,
    ValidationError,
    ServiceUnavailable,
    Unknown,
}

impl ErrorCategory {
    /// Map an HTTP-ish status code from a provider into a category.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => ErrorCategory::AuthError,
            402 => ErrorCategory::QuotaExceeded,
            408 => ErrorCategory::Timeout,
            422 => ErrorCategory::ValidationError,
            429 => ErrorCategory::RateLimit,
            503 => ErrorCategory::ServiceUnavailable,
            500..=599 => ErrorCategory::ServerError,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Whether failures of this category are transient enough to retry.
    ///
    /// Auth and quota failures will not heal on their own; retrying them
    /// only burns budget against a provider that already said no.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::RateLimit
                | ErrorCategory::Timeout
                | ErrorCategory::ServerError
                | ErrorCategory::NetworkError
                | ErrorCategory::ServiceUnavailable
        )
    }

    /// Snake-case label used in the wire envelope and playbook keys.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::AuthError => "auth_error",
            ErrorCategory::QuotaExceeded => "quota_exceeded",
            ErrorCategory::ValidationError => "validation_error",
            ErrorCategory::ServiceUnavailable => "service_unavailable",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Source = Box<dyn StdError + Send + Sync + 'static>;

/// Unified error type for the ensemble engine.
#[derive(Debug)]
pub enum EnsembleError {
    /// A provider call failed. Category drives retry and recovery behavior.
    ModelFailure {
        provider: ProviderId,
        model: String,
        category: ErrorCategory,
        message: String,
        source: Option<Source>,
    },
    /// The synthesis engine could not produce output on its current path.
    Synthesis { message: String },
    /// The voting engine could not produce a winner on its current path.
    Voting { message: String },
    /// The caller handed us an invalid request.
    Validation { field: &'static str, message: String },
    /// The named service's circuit breaker is open; retry after the given
    /// duration at the earliest.
    CircuitOpen { service: String, retry_after: Duration },
    /// A cache operation failed (serialization, compression).
    Cache { message: String },
    /// The engine is at its concurrent-request limit.
    Capacity { in_flight: usize, max: usize },
    /// Internal invariant violation. Never retried, surfaced immediately.
    Internal { message: String },
}

impl EnsembleError {
    pub fn model_failure(
        provider: ProviderId,
        model: impl Into<String>,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> Self {
        EnsembleError::ModelFailure {
            provider,
            model: model.into(),
            category,
            message: message.into(),
            source: None,
        }
    }

    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        EnsembleError::Validation { field, message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        EnsembleError::Internal { message: message.into() }
    }

    /// Category of the failure, for playbooks and envelopes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            EnsembleError::ModelFailure { category, .. } => *category,
            EnsembleError::Validation { .. } => ErrorCategory::ValidationError,
            EnsembleError::CircuitOpen { .. } | EnsembleError::Capacity { .. } => {
                ErrorCategory::ServiceUnavailable
            }
            EnsembleError::Synthesis { .. }
            | EnsembleError::Voting { .. }
            | EnsembleError::Cache { .. }
            | EnsembleError::Internal { .. } => ErrorCategory::Unknown,
        }
    }

    /// Operational errors come from the environment (providers, network,
    /// load). Validation failures and internal invariant violations mean
    /// the embedding code misused the engine, so they classify as
    /// programmer errors.
    #[must_use]
    pub fn is_operational(&self) -> bool {
        !matches!(
            self,
            EnsembleError::Validation { .. } | EnsembleError::Internal { .. }
        )
    }

    /// Whether the resilience layer may retry this exact call.
    ///
    /// `CircuitOpen` is operational but never retryable at the call site:
    /// the caller must route to a fallback or wait out the breaker.
    /// `Capacity` is the one service-unavailable shape that IS retryable,
    /// since load subsides on its own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            EnsembleError::ModelFailure { category, .. } => category.is_retryable(),
            EnsembleError::Capacity { .. } => true,
            EnsembleError::CircuitOpen { .. }
            | EnsembleError::Synthesis { .. }
            | EnsembleError::Voting { .. }
            | EnsembleError::Validation { .. }
            | EnsembleError::Cache { .. }
            | EnsembleError::Internal { .. } => false,
        }
    }

    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, EnsembleError::CircuitOpen { .. })
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            EnsembleError::ModelFailure { category: ErrorCategory::Timeout, .. }
        )
    }
}

impl fmt::Display for EnsembleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnsembleError::ModelFailure { provider, model, category, message, .. } => {
                write!(f, "{provider}:{model} failed ({category}): {message}")
            }
            EnsembleError::Synthesis { message } => write!(f, "synthesis failed: {message}"),
            EnsembleError::Voting { message } => write!(f, "voting failed: {message}"),
            EnsembleError::Validation { field, message } => {
                write!(f, "invalid request ({field}): {message}")
            }
            EnsembleError::CircuitOpen { service, retry_after } => {
                write!(f, "circuit breaker open for {service} (retry after {retry_after:?})")
            }
            EnsembleError::Cache { message } => write!(f, "cache error: {message}"),
            EnsembleError::Capacity { in_flight, max } => {
                write!(f, "engine at capacity ({in_flight} in-flight, max {max})")
            }
            EnsembleError::Internal { message } => write!(f, "internal error: {message}"),
        }
    }
}

impl StdError for EnsembleError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            EnsembleError::ModelFailure { source, .. } => {
                source.as_deref().map(|e| e as &(dyn StdError + 'static))
            }
            _ => None,
        }
    }
}
