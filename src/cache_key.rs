//! Stable cache key derivation.
//!
//! Keys are `"<prefix>:<first 16 hex chars of sha256(canonical JSON)>"`.
//! Canonicalization sorts object keys recursively, so two payloads that are
//! equal as values always fingerprint identically regardless of field order.

use crate::error::EnsembleError;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Key prefixes used by the engine.
pub const PREFIX_ENSEMBLE: &str = "ensemble";
pub const PREFIX_MEMORY: &str = "memory";
pub const PREFIX_HEALTH: &str = "health";

/// Derive the cache key for a payload under a prefix.
pub fn cache_key<T: Serialize>(prefix: &str, payload: &T) -> Result<String, EnsembleError> {
    let value = serde_json::to_value(payload)
        .map_err(|e| EnsembleError::Cache { message: format!("fingerprint payload: {e}") })?;
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(format!("{prefix}:{hex}"))
}

/// JSON serialization with recursively sorted object keys and no whitespace.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
