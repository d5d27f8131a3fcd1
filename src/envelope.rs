//! Wire-format error envelope with recovery guidance.
//!
//! Only programmer errors and unrecoverable serialization failures surface
//! as envelopes; partial provider failure never does. Messages come in
//! three audience tiers: short and actionable for users, code-bearing for
//! developers, full context for admins.

use crate::error::{EnsembleError, ErrorCategory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    fn for_category(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::AuthError | ErrorCategory::QuotaExceeded => Severity::Critical,
            ErrorCategory::ServerError | ErrorCategory::ServiceUnavailable => Severity::High,
            ErrorCategory::Timeout | ErrorCategory::NetworkError => Severity::Medium,
            ErrorCategory::RateLimit | ErrorCategory::ValidationError | ErrorCategory::Unknown => {
                Severity::Low
            }
        }
    }
}

/// Who is reading the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    User,
    Developer,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub error_type: String,
    pub severity: Severity,
    pub message: String,
    pub code: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryActionAdvice {
    #[serde(rename = "type")]
    pub action_type: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    pub automatic: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryAdvice {
    pub suggestions: Vec<String>,
    pub actions: Vec<RecoveryActionAdvice>,
    /// Seconds until the condition likely clears.
    pub estimated_recovery_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub status: String,
    pub error: ErrorBody,
    pub recovery: RecoveryAdvice,
    #[serde(skip)]
    context: BTreeMap<String, String>,
}

impl ErrorEnvelope {
    /// Build the envelope for an error, attributed to a service.
    pub fn from_error(error: &EnsembleError, service: &str, correlation_id: &str) -> Self {
        let category = error.category();
        let timestamp = Utc::now();
        let mut context = BTreeMap::new();
        context.insert("service".to_string(), service.to_string());
        context.insert("retryable".to_string(), error.is_retryable().to_string());
        context.insert("operational".to_string(), error.is_operational().to_string());

        Self {
            status: "error".to_string(),
            error: ErrorBody {
                error_type: category.as_str().to_string(),
                severity: Severity::for_category(category),
                message: error.to_string(),
                code: error_code(service, category, timestamp),
                timestamp,
                correlation_id: correlation_id.to_string(),
            },
            recovery: recovery_advice(category),
            context,
        }
    }

    /// Audience-tiered message. Users get something short and actionable;
    /// developers get the code; admins get code, correlation id, and
    /// context.
    #[must_use]
    pub fn message_for(&self, audience: Audience) -> String {
        match audience {
            Audience::User => user_message(&self.error.error_type),
            Audience::Developer => {
                format!("[{}] {}", self.error.code, self.error.message)
            }
            Audience::Admin => {
                let context: Vec<String> =
                    self.context.iter().map(|(k, v)| format!("{k}={v}")).collect();
                format!(
                    "[{}] correlation={} {} ({})",
                    self.error.code,
                    self.error.correlation_id,
                    self.error.message,
                    context.join(", ")
                )
            }
        }
    }
}

/// `<SVC3>-<TYPE3>-<base36 timestamp>`.
fn error_code(service: &str, category: ErrorCategory, timestamp: DateTime<Utc>) -> String {
    let svc: String = service
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(3)
        .collect::<String>()
        .to_ascii_uppercase();
    let svc = if svc.is_empty() { "UNK".to_string() } else { format!("{svc:0<3}") };

    let typ = match category {
        ErrorCategory::RateLimit => "RAT",
        ErrorCategory::Timeout => "TIM",
        ErrorCategory::ServerError => "SRV",
        ErrorCategory::NetworkError => "NET",
        ErrorCategory::AuthError => "AUT",
        ErrorCategory::QuotaExceeded => "QUO",
        ErrorCategory::ValidationError => "VAL",
        ErrorCategory::ServiceUnavailable => "UNA",
        ErrorCategory::Unknown => "UNK",
    };

    format!("{svc}-{typ}-{}", base36(timestamp.timestamp_millis().max(0) as u64))
}

fn base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

fn user_message(error_type: &str) -> String {
    match error_type {
        "rate_limit" => "We're handling a lot of requests right now. Please try again in a moment.",
        "timeout" => "That took longer than expected. Please try again.",
        "server_error" | "service_unavailable" => {
            "Our AI services are having a moment. Please try again shortly."
        }
        "network_error" => "We had trouble reaching our AI services. Please try again.",
        "auth_error" | "quota_exceeded" => {
            "There's a configuration issue on our side. The team has been notified."
        }
        "validation_error" => "That request couldn't be processed. Please check your input.",
        _ => "Something went wrong. Please try again.",
    }
    .to_string()
}

fn recovery_advice(category: ErrorCategory) -> RecoveryAdvice {
    match category {
        ErrorCategory::RateLimit => RecoveryAdvice {
            suggestions: vec![
                "Wait before retrying".to_string(),
                "Reduce request frequency".to_string(),
            ],
            actions: vec![RecoveryActionAdvice {
                action_type: "retry".to_string(),
                label: "Retry automatically".to_string(),
                delay_ms: Some(30_000),
                automatic: true,
            }],
            estimated_recovery_time: 30,
        },
        ErrorCategory::Timeout | ErrorCategory::NetworkError => RecoveryAdvice {
            suggestions: vec![
                "Retry the request".to_string(),
                "Check connectivity".to_string(),
            ],
            actions: vec![RecoveryActionAdvice {
                action_type: "retry".to_string(),
                label: "Retry now".to_string(),
                delay_ms: Some(1_000),
                automatic: true,
            }],
            estimated_recovery_time: 5,
        },
        ErrorCategory::ServerError | ErrorCategory::ServiceUnavailable => RecoveryAdvice {
            suggestions: vec!["Retry with backoff".to_string(), "Use a fallback provider".to_string()],
            actions: vec![RecoveryActionAdvice {
                action_type: "retry".to_string(),
                label: "Retry with backoff".to_string(),
                delay_ms: Some(5_000),
                automatic: true,
            }],
            estimated_recovery_time: 60,
        },
        ErrorCategory::AuthError | ErrorCategory::QuotaExceeded => RecoveryAdvice {
            suggestions: vec!["Verify credentials and billing".to_string()],
            actions: vec![RecoveryActionAdvice {
                action_type: "contact_admin".to_string(),
                label: "Contact an administrator".to_string(),
                delay_ms: None,
                automatic: false,
            }],
            estimated_recovery_time: 3_600,
        },
        ErrorCategory::ValidationError => RecoveryAdvice {
            suggestions: vec!["Fix the request and resubmit".to_string()],
            actions: vec![RecoveryActionAdvice {
                action_type: "edit_request".to_string(),
                label: "Edit and retry".to_string(),
                delay_ms: None,
                automatic: false,
            }],
            estimated_recovery_time: 0,
        },
        ErrorCategory::Unknown => RecoveryAdvice {
            suggestions: vec!["Retry the request".to_string()],
            actions: vec![RecoveryActionAdvice {
                action_type: "retry".to_string(),
                label: "Retry".to_string(),
                delay_ms: Some(2_000),
                automatic: false,
            }],
            estimated_recovery_time: 10,
        },
    }
}
