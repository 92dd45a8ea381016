//! Secret handling for credentials in configuration
//!
//! Provider keys are wrapped in [`SecretString`] so they are redacted in
//! `Debug`/`Display` output and in the status snapshot.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A wrapper type for sensitive strings like API keys
#[derive(Clone, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SecretString {
    value: String,
}

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// Get the actual value (use with caution)
    pub fn expose_secret(&self) -> &str {
        &self.value
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Get a partially redacted version for status output
    pub fn partial_redact(&self) -> String {
        if self.value.is_empty() {
            return "[EMPTY]".to_string();
        }

        let len = self.value.chars().count();
        if len <= 8 {
            return "[REDACTED]".to_string();
        }

        let head_len = if self.value.starts_with("sk-") || self.value.starts_with("pk-") {
            3
        } else {
            2
        };
        let head: String = self.value.chars().take(head_len).collect();
        let tail: String = self.value.chars().skip(len - 4).collect();
        format!("{}...{}", head, tail)
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A trait for types that can be logged safely
pub trait SafeLogging {
    /// Returns a safe version for logging
    fn safe_for_logging(&self) -> String;
}

impl SafeLogging for super::schema::ProviderConfig {
    fn safe_for_logging(&self) -> String {
        format!(
            "{} ({:?}, priority {}, key {}, {})",
            self.name,
            self.wire_format,
            self.priority,
            self.api_key.partial_redact(),
            self.base_url
        )
    }
}
