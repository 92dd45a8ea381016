//! Error rendering in the messages-API envelope

use crate::auth::AuthError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tiergate_core::config::ConfigError;
use tiergate_core::providers::GatewayError;
use tracing::warn;

/// Anything a handler can fail with
#[derive(Debug)]
pub enum ApiError {
    Gateway(GatewayError),
    Unauthorized(AuthError),
    InvalidRequest(String),
    NotFound(String),
    Config(ConfigError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Gateway(e) => {
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::InvalidRequest(_) | ApiError::Config(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::Gateway(e) => e.error_type(),
            ApiError::Unauthorized(_) => "authentication_error",
            ApiError::InvalidRequest(_) | ApiError::Config(_) => "invalid_request_error",
            ApiError::NotFound(_) => "not_found_error",
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Gateway(e) => e.to_string(),
            ApiError::Unauthorized(e) => e.message.clone(),
            ApiError::InvalidRequest(m) | ApiError::NotFound(m) => m.clone(),
            ApiError::Config(e) => e.to_string(),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        ApiError::Gateway(e)
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        ApiError::Unauthorized(e)
    }
}

impl From<ConfigError> for ApiError {
    fn from(e: ConfigError) -> Self {
        ApiError::Config(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.message();
        if status.is_server_error() {
            warn!(status = status.as_u16(), "{}", message);
        }

        let body = json!({
            "type": "error",
            "error": {
                "type": self.error_type(),
                "message": message,
            }
        });
        (status, Json(body)).into_response()
    }
}
