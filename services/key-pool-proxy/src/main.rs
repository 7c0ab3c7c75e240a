//! Load-balancing proxy in front of a generative content API.
//!
//! Binds two listeners: the client-facing port that forwards requests
//! through the key pool and Stream Retry Engine, and an admin port
//! exposing pool inspection and maintenance routes. A background task
//! runs pool maintenance on a fixed interval.

mod admin;
mod config;
mod error;
mod handler;
mod metrics;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminState;
use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting key pool proxy");

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        admin_listen_addr = %config.server.admin_listen_addr,
        upstream_url = %config.server.upstream_url,
        pool_enabled = config.pool.enabled,
        "configuration loaded"
    );

    let metrics_handle = metrics::install_recorder();

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.server.timeout_secs))
        .build()
        .context("failed to build upstream HTTP client")?;
    let client = Arc::new(
        provider::GeminiClient::new(http_client, config.server.upstream_url.clone())
            .context("invalid upstream_url")?,
    );

    let app_state = AppState::new(&config, client);

    let maintenance_state = app_state.clone();
    let maintenance_interval = Duration::from_secs(config.pool.maintenance_interval_minutes * 60);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(maintenance_interval);
        loop {
            ticker.tick().await;
            maintenance_state.maintain_all().await;
        }
    });

    let client_app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(move || render_metrics(metrics_handle.clone())))
        .fallback(handler::client_handler)
        .with_state(app_state.clone());

    let admin_state = AdminState {
        app: app_state,
        admin_auth_token: config
            .server
            .admin_auth_token
            .clone()
            .map(Arc::new),
    };
    let admin_app = admin::build_admin_router(admin_state);

    let client_listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    let admin_listener = TcpListener::bind(config.server.admin_listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.admin_listen_addr))?;

    info!(addr = %config.server.listen_addr, "client listener bound");
    info!(addr = %config.server.admin_listen_addr, "admin listener bound");

    let client_server = axum::serve(client_listener, client_app).with_graceful_shutdown(shutdown_signal());
    let admin_server = axum::serve(admin_listener, admin_app).with_graceful_shutdown(shutdown_signal());

    tokio::try_join!(
        async { client_server.await.context("client server error") },
        async { admin_server.await.context("admin server error") },
    )?;

    info!("shutdown complete");
    Ok(())
}

async fn render_metrics(handle: metrics_exporter_prometheus::PrometheusHandle) -> String {
    handle.render()
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let requests = state
        .requests_total
        .load(std::sync::atomic::Ordering::Relaxed);
    let errors = state
        .errors_total
        .load(std::sync::atomic::Ordering::Relaxed);

    axum::Json(serde_json::json!({
        "status": "healthy",
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
