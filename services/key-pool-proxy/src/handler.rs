//! Client-facing request handler.
//!
//! One route handles every call: check out a credential from the
//! appropriate family (primary or vertex), forward the request upstream,
//! and — for a streaming call — hand the response off to the Stream
//! Retry Engine instead of returning it directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use stream_retry::RetryConfig;
use tracing::warn;

use crate::error::Error;
use crate::metrics;
use crate::state::{AppState, Family};

/// Extract `{model}` from a Gemini-shaped REST path
/// (`/v1beta/models/{model}:generateContent`).
fn extract_model(path: &str) -> Option<&str> {
    let after = path.rsplit_once("models/")?.1;
    let model = after.split(':').next()?;
    (!model.is_empty()).then_some(model)
}

fn is_streaming(path: &str) -> bool {
    path.contains(":streamGenerateContent")
}

/// Requests under `/vertex` target the secondary credential family; the
/// prefix is stripped before the remaining path is parsed for the model.
fn select_family<'a>(state: &'a AppState, path: &'a str) -> (&'a Family, &'a str) {
    match path.strip_prefix("/vertex") {
        Some(rest) => (&state.vertex, rest),
        None => (&state.primary, path),
    }
}

pub async fn client_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    state.record_request();
    let start = Instant::now();
    let method = request.method().as_str().to_string();
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();

    let (family, upstream_path) = select_family(&state, &path);
    let model = extract_model(upstream_path).unwrap_or_default().to_string();
    let streaming = is_streaming(upstream_path);

    let response = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(raw) => match serde_json::from_slice::<Value>(&raw) {
            Ok(request_body) => match family.checkout(Some(&model)).await {
                Some(key) if streaming => {
                    stream_response(&state, model, key, request_body).await
                }
                Some(key) => non_stream_response(&state, family, model, key, request_body).await,
                None => {
                    state.record_error();
                    Error::Upstream("no credentials configured".into()).into_response()
                }
            },
            Err(e) => {
                state.record_error();
                Error::InvalidRequest(format!("invalid JSON body: {e}")).into_response()
            }
        },
        Err(e) => {
            state.record_error();
            Error::InvalidRequest(format!("failed to read request body: {e}")).into_response()
        }
    };

    metrics::record_request(response.status().as_u16(), &method, start.elapsed().as_secs_f64());
    response
}

async fn stream_response(state: &AppState, model: String, key: String, body: Value) -> Response {
    let source: Arc<dyn stream_retry::RetrySource> = state.client.clone();
    let initial = match source.retry(&model, &key, &body).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, model, "initial upstream stream request failed");
            state.record_error();
            return Error::Upstream(e.to_string()).into_response();
        }
    };

    let config = RetryConfig {
        max_retries: state.max_stream_retries,
        retry_delay: Duration::from_millis(state.stream_retry_delay_ms),
        swallow_thoughts: state.swallow_thoughts_after_retry,
    };

    let byte_stream =
        stream_retry::drive(initial, body, model, key, source, config).map(Ok::<_, std::io::Error>);

    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(byte_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn non_stream_response(
    state: &AppState,
    family: &Family,
    model: String,
    mut key: String,
    body: Value,
) -> Response {
    let mut last_status = StatusCode::BAD_GATEWAY;
    let mut last_body = Bytes::new();

    for attempt in 0..=state.max_retries {
        match state.client.generate(&model, &key, &body).await {
            Ok((status, bytes)) if (200..300).contains(&status) => {
                family.report_success(&key).await;
                return Response::builder()
                    .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
                    .header(axum::http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(bytes))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
            }
            Ok((status, bytes)) => {
                let body_str = String::from_utf8_lossy(&bytes);
                family.report_failure(&key, Some(&model), status, &body_str).await;
                last_status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                last_body = bytes;
            }
            Err(e) => {
                warn!(error = %e, attempt, model, "upstream request failed");
                family.report_failure(&key, Some(&model), 0, &e.to_string()).await;
                last_body = Bytes::from(e.to_string());
            }
        }

        if attempt == state.max_retries {
            break;
        }
        match family.checkout(Some(&model)).await {
            Some(next) => key = next,
            None => break,
        }
    }

    state.record_error();
    Response::builder()
        .status(last_status)
        .header(axum::http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(last_body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
