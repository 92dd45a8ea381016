//! HTTP handlers and router assembly

use crate::error::ApiError;
use crate::state::AppState;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use tiergate_core::config::{parse_document, ConfigFormat};
use tiergate_core::context::RequestContext;
use tiergate_core::protocol::{CountTokensRequest, MessagesRequest};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Build the full application router
///
/// Every route except `/health` requires an identity.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/v1/messages", post(messages_handler))
        .route("/v1/messages/count_tokens", post(count_tokens_handler));

    let admin = Router::new()
        .route("/admin/status", get(status_handler))
        .route("/admin/health/check", post(health_check_handler))
        .route("/admin/config/reload", post(reload_handler))
        .route("/admin/circuits/{provider}/reset", post(reset_circuit_handler));

    let public = Router::new().route("/health", get(liveness_handler));

    api.merge(admin)
        .merge(public)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Pin the live snapshot and identify the caller against it
fn admit(state: &AppState, headers: &HeaderMap) -> Result<RequestContext, ApiError> {
    let snapshot = state.gateway.config().load();
    let identity = state.identity.resolve(headers, &snapshot.config.server)?;
    Ok(RequestContext::new(snapshot, identity))
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidRequest(format!("Invalid request body: {}", e)))
}

fn with_request_id(mut response: Response, ctx: &RequestContext) -> Response {
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn messages_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let ctx = admit(&state, &headers)?;
    let request: MessagesRequest = parse_json(&body)?;
    debug!(
        request_id = %ctx.request_id,
        identity = %ctx.identity,
        model = %request.model,
        stream = request.is_streaming(),
        "Inbound messages request"
    );

    if request.is_streaming() {
        let stream = state.gateway.stream(ctx.clone(), request).await?;
        info!(
            request_id = %ctx.request_id,
            provider = stream.provider(),
            model = stream.model(),
            "Streaming response"
        );
        let frames = stream.map(|event| Ok::<_, Infallible>(event.to_sse_frame()));

        let response = (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            Body::from_stream(frames),
        )
            .into_response();
        return Ok(with_request_id(response, &ctx));
    }

    let response = state.gateway.messages(&ctx, &request).await?;
    Ok(with_request_id(Json(response).into_response(), &ctx))
}

async fn count_tokens_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    admit(&state, &headers)?;
    let request: CountTokensRequest = parse_json(&body)?;
    Ok(Json(state.gateway.count_tokens(&request)).into_response())
}

async fn status_handler(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    admit(&state, &headers)?;
    Ok(Json(state.gateway.status().await).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct HealthCheckQuery {
    #[serde(default)]
    force: bool,
}

async fn health_check_handler(
    State(state): State<AppState>,
    Query(query): Query<HealthCheckQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = admit(&state, &headers)?;
    let records = state.gateway.health_check(&ctx, query.force).await;
    let healthy = records.iter().filter(|r| r.healthy).count();
    Ok(Json(json!({
        "healthy": healthy,
        "total": records.len(),
        "records": records,
    }))
    .into_response())
}

async fn reload_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    admit(&state, &headers)?;

    let format = match headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        Some(content_type) if content_type.contains("yaml") => ConfigFormat::Yaml,
        _ => ConfigFormat::Json,
    };
    let document = std::str::from_utf8(&body)
        .map_err(|_| ApiError::InvalidRequest("Configuration document is not valid UTF-8".to_string()))?;

    let config = parse_document(document, format, "reload request")?;
    let version = state.gateway.reload(config)?;
    info!(version, "Configuration reloaded over HTTP");
    Ok(Json(json!({ "version": version })).into_response())
}

async fn reset_circuit_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    admit(&state, &headers)?;
    if !state.gateway.reset_circuit(&provider) {
        return Err(ApiError::NotFound(format!("Unknown provider: {}", provider)));
    }
    Ok(Json(json!({ "provider": provider, "status": "closed" })).into_response())
}

async fn liveness_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": tiergate_core::version(),
    }))
}
