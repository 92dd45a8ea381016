//! Gateway error taxonomy
//!
//! Only [`GatewayError::Conversion`], [`GatewayError::UnknownModel`] and
//! [`GatewayError::ExhaustedCandidates`] are meant to reach clients; every
//! other variant is recovered locally by the retry executor or the router.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors produced while serving a request
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Input cannot be mapped to or from a provider format
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// The requested model name maps to no category
    #[error("Unknown model '{0}'")]
    UnknownModel(String),

    /// Circuit breaker denied the call
    #[error("Provider '{provider}' is unavailable (circuit open)")]
    ProviderUnavailable { provider: String },

    /// Non-2xx response from the provider
    #[error("Upstream returned {status}: {message}")]
    Upstream {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Per-call deadline elapsed
    #[error("Upstream timed out after {}ms", .0.as_millis())]
    UpstreamTimeout(Duration),

    /// A successful completion that produced no output
    #[error("Provider '{provider}' returned zero output tokens for '{model}'")]
    ZeroOutputTokens { provider: String, model: String },

    /// Connection-level failure
    #[error("Network error: {0}")]
    Network(String),

    /// Provider body that could not be decoded
    #[error("Malformed upstream response: {0}")]
    MalformedResponse(String),

    /// Backing cache tier failure
    #[error("Cache backend error: {0}")]
    CacheBackend(String),

    /// Every candidate failed
    #[error("{}", ExhaustedSummary(.0))]
    ExhaustedCandidates(Vec<CandidateFailure>),
}

/// Terminal failure of one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
    pub provider: String,
    pub model: String,
    pub reason: String,
    /// Upstream rejected the request itself rather than failing to serve it
    pub client_fault: bool,
}

impl CandidateFailure {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, error: &GatewayError) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            reason: error.to_string(),
            client_fault: error.is_client_fault(),
        }
    }
}

impl fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.provider, self.model, self.reason)
    }
}

struct ExhaustedSummary<'a>(&'a [CandidateFailure]);

impl fmt::Display for ExhaustedSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "No available candidates");
        }
        write!(f, "All {} candidates failed: ", self.0.len())?;
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

impl GatewayError {
    /// Whether the same candidate may be attempted again
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Upstream { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            GatewayError::UpstreamTimeout(_)
            | GatewayError::ZeroOutputTokens { .. }
            | GatewayError::Network(_)
            | GatewayError::MalformedResponse(_) => true,
            _ => false,
        }
    }

    /// Whether an exhausted candidate counts against its provider's circuit
    pub fn trips_circuit(&self) -> bool {
        self.is_retryable()
    }

    /// Upstream rejected the request as malformed or unauthorized
    pub fn is_client_fault(&self) -> bool {
        match self {
            GatewayError::Upstream { status, .. } => {
                (400..500).contains(status) && *status != 429 && *status != 408
            }
            GatewayError::Conversion(_) | GatewayError::UnknownModel(_) => true,
            _ => false,
        }
    }

    /// Fatal for the whole request: no other candidate could do better
    pub fn aborts_routing(&self) -> bool {
        matches!(self, GatewayError::Conversion(_) | GatewayError::UnknownModel(_))
    }

    /// Provider-suggested delay before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::Upstream { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// HTTP status used when the error is rendered to a client
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Conversion(_) => 400,
            GatewayError::UnknownModel(_) => 404,
            GatewayError::ProviderUnavailable { .. } => 503,
            GatewayError::Upstream { status, .. } => *status,
            GatewayError::UpstreamTimeout(_) => 504,
            GatewayError::ZeroOutputTokens { .. }
            | GatewayError::Network(_)
            | GatewayError::MalformedResponse(_) => 502,
            GatewayError::CacheBackend(_) => 500,
            GatewayError::ExhaustedCandidates(failures) => {
                if !failures.is_empty() && failures.iter().all(|f| f.client_fault) {
                    400
                } else {
                    503
                }
            }
        }
    }

    /// Messages-API error type string for the error envelope
    pub fn error_type(&self) -> &'static str {
        match self.http_status() {
            400 | 413 | 422 => "invalid_request_error",
            401 => "authentication_error",
            403 => "permission_error",
            404 => "not_found_error",
            429 => "rate_limit_error",
            503 | 529 => "overloaded_error",
            _ => "api_error",
        }
    }
}
