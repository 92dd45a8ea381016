//! Configuration schema structures with serde support

use super::error::{ValidationError, ValidationErrorKind};
use super::secrets::SecretString;
use crate::protocol::ModelCategory;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Root configuration document
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Candidate ordering policy
    #[serde(default)]
    pub fallback_strategy: FallbackStrategy,

    /// Circuit breaker thresholds shared by all providers
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    /// Retry and backoff behaviour
    #[serde(default)]
    pub retry: RetrySettings,

    /// Two-tier cache settings
    #[serde(default)]
    pub cache: CacheSettings,

    /// On-demand health probing
    #[serde(default)]
    pub health: HealthSettings,

    /// HTTP surface settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Client-facing model names mapped to categories
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_aliases: HashMap<String, ModelCategory>,

    /// Ordered provider list
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// Upstream provider configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Unique provider name
    pub name: String,

    /// Whether this provider is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Routing priority (lower = tried first)
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Base URL for the provider API
    pub base_url: String,

    /// Credential (supports environment variable interpolation)
    pub api_key: SecretString,

    /// Wire format spoken by the provider
    #[serde(default)]
    pub wire_format: WireFormat,

    /// Per-call timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum retries per call, falling back to `retry.max_retries`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Extra headers sent with every upstream call
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Concrete models per category
    #[serde(default)]
    pub models: CategoryModels,

    /// Ceiling applied to the requested `max_tokens`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_limit: Option<u32>,
}

impl ProviderConfig {
    /// Concrete models offered for a category, in configured order
    pub fn models_for(&self, category: ModelCategory) -> &[String] {
        self.models.get(category)
    }

    /// Whether the provider offers at least one model for the category
    pub fn offers(&self, category: ModelCategory) -> bool {
        !self.models_for(category).is_empty()
    }

    /// Categories the provider offers
    pub fn categories(&self) -> Vec<ModelCategory> {
        ModelCategory::ALL
            .into_iter()
            .filter(|category| self.offers(*category))
            .collect()
    }

    /// Effective retry budget given the global default
    pub fn max_retries_or(&self, default: u32) -> u32 {
        self.max_retries.unwrap_or(default)
    }

    /// Per-call timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Apply the provider's output ceiling to a requested budget
    pub fn clamp_max_tokens(&self, requested: u32) -> u32 {
        match self.max_tokens_limit {
            Some(limit) => requested.min(limit),
            None => requested,
        }
    }
}

/// Wire formats spoken by upstream providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// Same messages protocol as clients speak
    #[default]
    Native,
    /// OpenAI-compatible chat completions
    #[serde(alias = "openai_compatible")]
    Openai,
}

/// Concrete model identifiers per category
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CategoryModels {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub big: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub middle: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub small: Vec<String>,
}

impl CategoryModels {
    pub fn get(&self, category: ModelCategory) -> &[String] {
        match category {
            ModelCategory::Big => &self.big,
            ModelCategory::Middle => &self.middle,
            ModelCategory::Small => &self.small,
        }
    }
}

/// Candidate ordering policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Ascending priority value, ties broken by configuration order
    #[default]
    Priority,
    /// Uniform random permutation per request
    Random,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open circuit waits before releasing a probe
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout: u64,
}

impl CircuitBreakerSettings {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout)
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    /// Retries per candidate when the provider does not override it
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial retry delay in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum retry delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub exponential_base: f64,

    /// Jitter factor (0.0 to 1.0)
    #[serde(default = "default_jitter")]
    pub jitter_factor: f64,

    /// Honour provider retry-after hints
    #[serde(default = "default_true")]
    pub respect_retry_after: bool,

    /// Maximum total time to spend retrying one candidate
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Retry completions that report zero output tokens
    #[serde(default = "default_true")]
    pub retry_on_zero_output: bool,

    /// Cap on zero-output retries per candidate
    #[serde(default = "default_zero_output_retries")]
    pub zero_output_max_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            exponential_base: default_backoff_multiplier(),
            jitter_factor: default_jitter(),
            respect_retry_after: true,
            timeout_ms: None,
            retry_on_zero_output: true,
            zero_output_max_retries: default_zero_output_retries(),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum entries held by the in-process tier
    #[serde(default = "default_fast_capacity")]
    pub fast_capacity: u64,

    /// TTL applied when callers do not supply one
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,

    /// Shared backing tier; in-process only when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,

    /// Upper bound on every backing-tier call
    #[serde(default = "default_backing_timeout")]
    pub backing_timeout_ms: u64,

    /// Namespace prefix for backing-tier keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            fast_capacity: default_fast_capacity(),
            default_ttl_secs: default_cache_ttl(),
            redis_url: None,
            backing_timeout_ms: default_backing_timeout(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// Health probe configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HealthSettings {
    /// How long a probe result stays fresh
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    /// Output budget of a probe request
    #[serde(default = "default_probe_max_tokens")]
    pub probe_max_tokens: u32,

    /// Prompt sent by probes
    #[serde(default = "default_probe_prompt")]
    pub probe_prompt: String,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            probe_max_tokens: default_probe_max_tokens(),
            probe_prompt: default_probe_prompt(),
        }
    }
}

/// HTTP surface configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Idle interval before a `ping` event is sent on a stream
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_secs: u64,

    /// Accepted inbound keys mapped to identity labels (open when empty)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub api_keys: HashMap<String, String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            heartbeat_interval_secs: default_heartbeat(),
            api_keys: HashMap::new(),
        }
    }
}

// Default value functions for serde
fn default_true() -> bool { true }
fn default_priority() -> u32 { 100 }
fn default_timeout_secs() -> u64 { 60 }
fn default_max_retries() -> u32 { 2 }
fn default_failure_threshold() -> u32 { 5 }
fn default_recovery_timeout() -> u64 { 60 }
fn default_initial_delay() -> u64 { 250 }
fn default_max_delay() -> u64 { 10_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_jitter() -> f64 { 0.1 }
fn default_zero_output_retries() -> u32 { 1 }
fn default_fast_capacity() -> u64 { 1024 }
fn default_cache_ttl() -> u64 { 300 }
fn default_backing_timeout() -> u64 { 500 }
fn default_key_prefix() -> String { "tiergate".to_string() }
fn default_probe_max_tokens() -> u32 { 8 }
fn default_probe_prompt() -> String { "ping".to_string() }
fn default_bind() -> String { "0.0.0.0:8082".to_string() }
fn default_heartbeat() -> u64 { 15 }

impl GatewayConfig {
    /// Structural validation of the document
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.providers.is_empty() {
            return Err(ValidationError::required("providers")
                .with_context("At least one provider must be configured"));
        }

        let mut seen_names = std::collections::HashSet::new();
        for (i, provider) in self.providers.iter().enumerate() {
            if !seen_names.insert(provider.name.as_str()) {
                return Err(ValidationError::new(
                    format!("providers[{}].name", i),
                    ValidationErrorKind::DuplicateValue {
                        value: provider.name.clone(),
                    },
                ));
            }

            provider.validate(&format!("providers[{}]", i))?;
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ValidationError::out_of_range(
                "circuit_breaker.failure_threshold",
                "Must be greater than 0",
            ));
        }

        self.retry.validate("retry")?;

        if self.cache.fast_capacity == 0 {
            return Err(ValidationError::out_of_range(
                "cache.fast_capacity",
                "Must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Look up a provider by name
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }
}

impl ProviderConfig {
    /// Validate provider configuration
    pub fn validate(&self, path: &str) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::required(format!("{}.name", path)));
        }

        if self.api_key.is_empty() {
            return Err(ValidationError::required(format!("{}.api_key", path)));
        }

        if self.base_url.is_empty() {
            return Err(ValidationError::required(format!("{}.base_url", path)));
        }

        match url::Url::parse(&self.base_url) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::new(
                        format!("{}.base_url", path),
                        ValidationErrorKind::InvalidUrl {
                            message: format!("URL scheme must be http or https, got: {}", url.scheme()),
                        },
                    ));
                }
            }
            Err(e) => {
                return Err(ValidationError::new(
                    format!("{}.base_url", path),
                    ValidationErrorKind::InvalidUrl {
                        message: e.to_string(),
                    },
                ));
            }
        }

        if self.timeout_secs == 0 {
            return Err(ValidationError::out_of_range(
                format!("{}.timeout_secs", path),
                "Must be greater than 0",
            ));
        }

        for category in ModelCategory::ALL {
            for (i, model) in self.models_for(category).iter().enumerate() {
                if model.trim().is_empty() {
                    return Err(ValidationError::required(format!(
                        "{}.models.{}[{}]",
                        path, category, i
                    )));
                }
            }
        }

        if self.max_tokens_limit == Some(0) {
            return Err(ValidationError::out_of_range(
                format!("{}.max_tokens_limit", path),
                "Must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl RetrySettings {
    /// Validate retry settings
    pub fn validate(&self, path: &str) -> Result<(), ValidationError> {
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ValidationError::new(
                format!("{}.max_delay_ms", path),
                ValidationErrorKind::Incompatible {
                    message: "Must be >= initial_delay_ms".to_string(),
                },
            ));
        }

        if self.exponential_base < 1.0 {
            return Err(ValidationError::out_of_range(
                format!("{}.exponential_base", path),
                "Must be at least 1.0",
            ));
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ValidationError::out_of_range(
                format!("{}.jitter_factor", path),
                "Must be between 0.0 and 1.0",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider(name: &str) -> serde_json::Value {
        json!({
            "name": name,
            "base_url": "https://api.example.com",
            "api_key": "sk-test-123456789",
            "models": {"small": ["tiny-1"]}
        })
    }

    #[test]
    fn test_defaults_applied() {
        let config: GatewayConfig =
            serde_json::from_value(json!({"providers": [provider("a")]})).unwrap();
        let p = &config.providers[0];
        assert!(p.enabled);
        assert_eq!(p.priority, 100);
        assert_eq!(p.wire_format, WireFormat::Native);
        assert_eq!(config.fallback_strategy, FallbackStrategy::Priority);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(p.categories(), vec![ModelCategory::Small]);
        config.validate().unwrap();
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let config: GatewayConfig =
            serde_json::from_value(json!({"providers": [provider("a"), provider("a")]})).unwrap();
        let err = config.validate().unwrap_err();
        assert_eq!(err.field_path, "providers[1].name");
    }

    #[test]
    fn test_openai_compatible_alias() {
        let format: WireFormat = serde_json::from_value(json!("openai_compatible")).unwrap();
        assert_eq!(format, WireFormat::Openai);
    }

    #[test]
    fn test_clamp_max_tokens() {
        let mut p: ProviderConfig = serde_json::from_value(provider("a")).unwrap();
        assert_eq!(p.clamp_max_tokens(9000), 9000);
        p.max_tokens_limit = Some(4096);
        assert_eq!(p.clamp_max_tokens(9000), 4096);
        assert_eq!(p.clamp_max_tokens(100), 100);
    }
}
