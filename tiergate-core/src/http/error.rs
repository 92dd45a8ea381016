//! HTTP error mapping utilities

use crate::providers::GatewayError;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Longest raw body echoed into an error message
const MAX_ERROR_BODY: usize = 512;

/// Map a non-success status, its headers and body to a gateway error
pub fn map_http_error(status: StatusCode, headers: &HeaderMap, body: &[u8], request_id: Uuid) -> GatewayError {
    let parsed = serde_json::from_slice::<Value>(body).ok();
    let details = parsed.as_ref().and_then(extract_error_details);

    let message = details
        .as_ref()
        .map(|d| d.message.clone())
        .unwrap_or_else(|| raw_body_excerpt(body, status));

    let retry_after = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
        .or_else(|| {
            headers
                .get("retry-after-ms")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        })
        .or_else(|| details.and_then(|d| d.retry_after_seconds).map(Duration::from_secs));

    GatewayError::Upstream {
        status: status.as_u16(),
        message: format!("{} [request_id: {}]", message, request_id),
        retry_after,
    }
}

/// Map a transport-level failure
pub fn map_transport_error(err: &reqwest::Error, timeout: Duration) -> GatewayError {
    if err.is_timeout() {
        GatewayError::UpstreamTimeout(timeout)
    } else if err.is_connect() {
        GatewayError::Network(format!("connection failed: {}", err))
    } else if err.is_decode() || err.is_body() {
        GatewayError::Network(format!("failed to read response body: {}", err))
    } else {
        GatewayError::Network(err.to_string())
    }
}

struct ErrorDetails {
    message: String,
    retry_after_seconds: Option<u64>,
}

/// Pull a message out of the common error envelopes
fn extract_error_details(json: &Value) -> Option<ErrorDetails> {
    // {"error": {"message": ..}} on both the native and OpenAI envelopes
    if let Some(error) = json.get("error") {
        if let Some(message) = error.get("message").and_then(Value::as_str) {
            let message = match error.get("type").and_then(Value::as_str) {
                Some(kind) => format!("{}: {}", kind, message),
                None => message.to_string(),
            };
            return Some(ErrorDetails {
                message,
                retry_after_seconds: error.get("retry_after").and_then(Value::as_u64),
            });
        }
        if let Some(message) = error.as_str() {
            return Some(ErrorDetails {
                message: message.to_string(),
                retry_after_seconds: None,
            });
        }
    }

    json.get("message").and_then(Value::as_str).map(|message| ErrorDetails {
        message: message.to_string(),
        retry_after_seconds: json.get("retry_after").and_then(Value::as_u64),
    })
}

fn raw_body_excerpt(body: &[u8], status: StatusCode) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return format!("HTTP error {}", status.as_u16());
    }
    match text.char_indices().nth(MAX_ERROR_BODY) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Parse a Retry-After value given in (possibly fractional) seconds
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let value = header_value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    value
        .parse::<f64>()
        .ok()
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
        .map(Duration::from_secs_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use test_case::test_case;

    #[test_case("5", Some(Duration::from_secs(5)); "integer seconds")]
    #[test_case(" 1.5 ", Some(Duration::from_millis(1500)); "fractional seconds")]
    #[test_case("Wed, 21 Oct 2015 07:28:00 GMT", None; "http date")]
    #[test_case("-1", None; "negative")]
    fn test_parse_retry_after(value: &str, expected: Option<Duration>) {
        assert_eq!(parse_retry_after(value), expected);
    }

    #[test]
    fn test_native_error_envelope() {
        let body = br#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        let id = Uuid::new_v4();

        match map_http_error(StatusCode::from_u16(529).unwrap(), &headers, body, id) {
            GatewayError::Upstream {
                status,
                message,
                retry_after,
            } => {
                assert_eq!(status, 529);
                assert!(message.starts_with("overloaded_error: Overloaded"));
                assert!(message.contains(&id.to_string()));
                assert_eq!(retry_after, Some(Duration::from_secs(3)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_plain_text_body_is_truncated() {
        let body = "x".repeat(2000);
        let err = map_http_error(
            StatusCode::BAD_GATEWAY,
            &HeaderMap::new(),
            body.as_bytes(),
            Uuid::nil(),
        );
        assert!(err.to_string().len() < 700);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retry_after_from_body() {
        let body = br#"{"error":{"message":"slow down","retry_after":7}}"#;
        let err = map_http_error(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), body, Uuid::nil());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }
}
