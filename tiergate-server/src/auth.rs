//! Inbound caller identification
//!
//! The gateway itself only sees an opaque [`Identity`]; how a request is
//! mapped to one is decided here.

use axum::http::HeaderMap;
use tiergate_core::config::ServerSettings;
use tiergate_core::context::Identity;

/// Rejection produced when a caller cannot be identified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthError {
    pub message: String,
}

impl AuthError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Maps request headers to an accounting identity
pub trait IdentityResolver: Send + Sync {
    /// `server` comes from the snapshot the request is pinned to, so key
    /// changes take effect on the next request after a reload.
    fn resolve(&self, headers: &HeaderMap, server: &ServerSettings) -> Result<Identity, AuthError>;
}

/// Resolves callers against `server.api_keys`
///
/// With no keys configured every caller is anonymous.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApiKeyResolver;

impl IdentityResolver for ApiKeyResolver {
    fn resolve(&self, headers: &HeaderMap, server: &ServerSettings) -> Result<Identity, AuthError> {
        if server.api_keys.is_empty() {
            return Ok(Identity::anonymous());
        }

        let key = extract_api_key(headers).ok_or_else(|| AuthError::new("missing api key"))?;
        server
            .api_keys
            .get(&key)
            .map(Identity::new)
            .ok_or_else(|| AuthError::new("invalid api key"))
    }
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = header_value(headers, "x-api-key") {
        return Some(value);
    }

    let auth = header_value(headers, "authorization")?;
    let auth = auth.trim();
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
