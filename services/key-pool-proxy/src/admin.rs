//! Admin API for key pool inspection and maintenance.
//!
//! Runs on a separate listener port from the client-facing proxy. Every
//! route requires a bearer token matching `admin_auth_token`, presented
//! either as an `Authorization: Bearer <token>` header or an
//! `admin_token` cookie.
//!
//! Endpoints:
//! - GET  /api/keys              — paginated, filterable key listing
//! - GET  /api/keys/all          — full valid/invalid key lists
//! - GET  /api/keys/status       — registry + pool stats snapshot
//! - POST /api/keys/pool/maintenance — trigger a maintenance tick

use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use common::Secret;
use serde::Deserialize;

use crate::error::Error;
use crate::state::{AppState, Family};

#[derive(Clone)]
pub struct AdminState {
    pub app: AppState,
    pub admin_auth_token: Option<Arc<Secret<String>>>,
}

pub fn build_admin_router(state: AdminState) -> Router {
    let auth_state = state.clone();
    Router::new()
        .route("/api/keys", get(list_keys))
        .route("/api/keys/all", get(all_keys))
        .route("/api/keys/status", get(status))
        .route("/api/keys/pool/maintenance", post(run_maintenance))
        .route_layer(middleware::from_fn_with_state(auth_state, require_bearer))
        .with_state(state)
}

async fn require_bearer(
    State(state): State<AdminState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.admin_auth_token else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| {
            request
                .headers()
                .get(axum::http::header::COOKIE)
                .and_then(|v| v.to_str().ok())
                .and_then(|cookies| {
                    cookies.split(';').find_map(|c| {
                        let c = c.trim();
                        c.strip_prefix("admin_token=").map(str::to_string)
                    })
                })
        });

    match presented {
        Some(token) if token == expected.expose().as_str() => next.run(request).await,
        _ => Error::Unauthorized.into_response(),
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum StatusFilter {
    Valid,
    Invalid,
    All,
}

impl Default for StatusFilter {
    fn default() -> Self {
        StatusFilter::All
    }
}

#[derive(Debug, Deserialize)]
struct ListKeysQuery {
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    search: Option<String>,
    #[serde(default)]
    fail_count_threshold: Option<u32>,
    #[serde(default)]
    status: StatusFilter,
}

fn default_page() -> usize {
    1
}

fn default_limit() -> usize {
    50
}

fn redact(key: &str) -> String {
    if key.len() <= 8 {
        "*".repeat(key.len())
    } else {
        format!("{}...{}", &key[..4], &key[key.len() - 4..])
    }
}

/// Which family an admin request targets. The admin surface inspects
/// the primary family by default; `?family=vertex` switches to the
/// secondary one, mirroring the client-facing `/vertex` prefix.
fn select_family<'a>(app: &'a AppState, family: Option<&str>) -> &'a Family {
    match family {
        Some("vertex") => &app.vertex,
        _ => &app.primary,
    }
}

#[derive(Debug, Deserialize)]
struct FamilyQuery {
    family: Option<String>,
}

async fn list_keys(
    State(state): State<AdminState>,
    Query(query): Query<ListKeysQuery>,
    Query(family_query): Query<FamilyQuery>,
) -> impl IntoResponse {
    let family = select_family(&state.app, family_query.family.as_deref());
    let snapshot = family.registry.status_snapshot().await;

    let mut entries: Vec<(String, u32)> = match query.status {
        StatusFilter::Valid => snapshot.valid,
        StatusFilter::Invalid => snapshot.invalid,
        StatusFilter::All => snapshot
            .valid
            .into_iter()
            .chain(snapshot.invalid)
            .collect(),
    };

    if let Some(search) = &query.search {
        entries.retain(|(key, _)| key.contains(search.as_str()));
    }
    if let Some(threshold) = query.fail_count_threshold {
        entries.retain(|(_, count)| *count >= threshold);
    }

    let total_items = entries.len();
    let limit = query.limit.max(1);
    let total_pages = total_items.div_ceil(limit).max(1);
    let page = query.page.max(1);
    let start = (page - 1) * limit;

    let keys: serde_json::Map<String, serde_json::Value> = entries
        .into_iter()
        .skip(start)
        .take(limit)
        .map(|(key, count)| (redact(&key), serde_json::json!(count)))
        .collect();

    axum::Json(serde_json::json!({
        "keys": keys,
        "total_items": total_items,
        "total_pages": total_pages,
        "current_page": page,
    }))
}

async fn all_keys(
    State(state): State<AdminState>,
    Query(family_query): Query<FamilyQuery>,
) -> impl IntoResponse {
    let family = select_family(&state.app, family_query.family.as_deref());
    let snapshot = family.registry.status_snapshot().await;

    let valid_keys: Vec<String> = snapshot.valid.iter().map(|(k, _)| redact(k)).collect();
    let invalid_keys: Vec<String> = snapshot.invalid.iter().map(|(k, _)| redact(k)).collect();
    let total_count = valid_keys.len() + invalid_keys.len();

    axum::Json(serde_json::json!({
        "valid_keys": valid_keys,
        "invalid_keys": invalid_keys,
        "total_count": total_count,
    }))
}

async fn status(
    State(state): State<AdminState>,
    Query(family_query): Query<FamilyQuery>,
) -> impl IntoResponse {
    let family = select_family(&state.app, family_query.family.as_deref());
    let snapshot = family.registry.status_snapshot().await;

    let pool_stats = match &family.pool {
        Some(pool) => serde_json::to_value(pool.stats()).unwrap_or_default(),
        None => serde_json::Value::Null,
    };

    axum::Json(serde_json::json!({
        "registry": {
            "valid_count": snapshot.valid.len(),
            "invalid_count": snapshot.invalid.len(),
        },
        "pool": pool_stats,
        "requests_total": state.app.requests_total.load(std::sync::atomic::Ordering::Relaxed),
        "errors_total": state.app.errors_total.load(std::sync::atomic::Ordering::Relaxed),
    }))
}

async fn run_maintenance(
    State(state): State<AdminState>,
    Query(family_query): Query<FamilyQuery>,
) -> impl IntoResponse {
    let family = select_family(&state.app, family_query.family.as_deref());
    let Some(pool) = &family.pool else {
        return axum::Json(serde_json::json!({"error": "pool disabled for this family"}));
    };

    let before = pool.len();
    pool.maintain().await;
    let after = pool.len();

    axum::Json(serde_json::json!({
        "before_size": before,
        "after_size": after,
        "utilization": pool.stats().utilization,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use tower::ServiceExt;

    use crate::config::Config;

    fn test_config() -> Config {
        Config {
            keys: crate::config::KeysConfig {
                api_keys: vec!["key-aaaaaaaaaaaa".to_string(), "key-bbbbbbbbbbbb".to_string()],
                vertex_api_keys: vec![],
                max_failures: 5,
            },
            pool: crate::config::PoolSettings {
                enabled: false,
                ..Default::default()
            },
            retry: Default::default(),
            server: crate::config::ServerConfig {
                listen_addr: "127.0.0.1:8080".parse().unwrap(),
                admin_listen_addr: "127.0.0.1:9090".parse().unwrap(),
                upstream_url: "https://example.test".to_string(),
                timeout_secs: 60,
                admin_auth_token: None,
            },
        }
    }

    fn test_app_state(config: &Config) -> AppState {
        let client = Arc::new(
            provider::GeminiClient::new(reqwest::Client::new(), &config.server.upstream_url)
                .unwrap(),
        );
        AppState::new(config, client)
    }

    #[tokio::test]
    async fn unauthorized_without_token_when_configured() {
        let config = test_config();
        let app_state = test_app_state(&config);
        let state = AdminState {
            app: app_state,
            admin_auth_token: Some(Arc::new(Secret::new("secret-token".to_string()))),
        };
        let app = build_admin_router(state);

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/keys/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn authorized_with_bearer_token() {
        let config = test_config();
        let app_state = test_app_state(&config);
        let state = AdminState {
            app: app_state,
            admin_auth_token: Some(Arc::new(Secret::new("secret-token".to_string()))),
        };
        let app = build_admin_router(state);

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/keys/status")
                    .header("Authorization", "Bearer secret-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn list_keys_paginates_and_redacts() {
        let config = test_config();
        let app_state = test_app_state(&config);
        let state = AdminState {
            app: app_state,
            admin_auth_token: None,
        };
        let app = build_admin_router(state);

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/keys?limit=1&page=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["total_items"], 2);
        assert_eq!(json["total_pages"], 2);
        assert_eq!(json["keys"].as_object().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn maintenance_reports_pool_disabled() {
        let config = test_config();
        let app_state = test_app_state(&config);
        let state = AdminState {
            app: app_state,
            admin_auth_token: None,
        };
        let app = build_admin_router(state);

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/keys/pool/maintenance")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "pool disabled for this family");
    }
}
