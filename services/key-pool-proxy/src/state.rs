//! Shared application state: the registry/pool pair for each credential
//! family, the upstream client, and request counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono_tz::Tz;
use error_classifier::KeyAction;
use key_registry::KeyRegistry;
use provider::GeminiClient;
use valid_key_pool::{PoolConfig, ValidKeyPool};

use crate::config::Config;

/// One credential family: its registry and, if the pool is enabled, its
/// working set. The primary (Gemini API) and secondary (Vertex) families
/// are two independent instances of this pair sharing identical code
/// paths, selected by the caller based on which upstream family a request
/// targets.
#[derive(Clone)]
pub struct Family {
    pub registry: Arc<KeyRegistry>,
    pub pool: Option<Arc<ValidKeyPool>>,
    quota_reset_hour: u32,
    timezone: Tz,
}

impl Family {
    fn new(credentials: Vec<String>, config: &Config, client: Arc<GeminiClient>) -> Self {
        let registry = Arc::new(KeyRegistry::new(credentials, config.keys.max_failures));
        let pool = if config.pool.enabled {
            let pool_config = PoolConfig {
                pool_size: config.pool.size,
                min_threshold: config.pool.min_threshold,
                emergency_refill_count: config.pool.emergency_refill_count,
                ttl_hours: config.pool.key_ttl_hours,
                concurrent_verifications: config.pool.concurrent_verifications,
                test_model: config.pool.test_model.clone(),
                pro_models: config.pool.pro_models.clone(),
                pro_model_max_usage: config.pool.pro_model_max_usage,
                non_pro_model_max_usage: config.pool.non_pro_model_max_usage,
                min_refill_interval: std::time::Duration::from_secs(5),
                quota_reset_hour: config.pool.quota_reset_hour,
                timezone: config.timezone(),
            };
            Some(
                ValidKeyPool::new(registry.clone(), client, pool_config)
                    .expect("pool configuration validated at startup"),
            )
        } else {
            None
        };
        Self {
            registry,
            pool,
            quota_reset_hour: config.pool.quota_reset_hour,
            timezone: config.timezone(),
        }
    }

    /// Check out a credential: through the pool if enabled, falling back
    /// to the registry's own round-robin otherwise.
    pub async fn checkout(&self, model: Option<&str>) -> Option<String> {
        match &self.pool {
            Some(pool) => pool.checkout(model).await,
            None => self.registry.next_working_key(model).await,
        }
    }

    /// Record a successful upstream call against `key`.
    pub async fn report_success(&self, key: &str) {
        match &self.pool {
            Some(pool) => pool.report_success(key).await,
            None => self.registry.reset_failure(key).await,
        }
    }

    /// Classify and apply an upstream failure against `key`. Routes
    /// through the pool (which evicts on top of the registry mutation)
    /// when the pool is enabled, otherwise applies the classified action
    /// to the registry directly.
    pub async fn report_failure(&self, key: &str, model: Option<&str>, status: u16, body: &str) {
        if let Some(pool) = &self.pool {
            pool.report_failure(key, model, status, body).await;
            return;
        }
        let classification = error_classifier::classify(status, model);
        match classification.key_action {
            KeyAction::MarkFailed => self.registry.mark_failed(key).await,
            KeyAction::DecrementAndEvict | KeyAction::CountOnly => {
                self.registry.increment_failure(key).await;
            }
            KeyAction::CoolDownModel => {
                if let Some(m) = model {
                    self.registry
                        .cool_down(key, m, self.quota_reset_hour, self.timezone)
                        .await;
                }
            }
        }
    }
}

/// Application state shared across every client and admin request handler.
#[derive(Clone)]
pub struct AppState {
    pub primary: Family,
    pub vertex: Family,
    pub client: Arc<GeminiClient>,
    pub max_retries: u32,
    pub max_stream_retries: u32,
    pub stream_retry_delay_ms: u64,
    pub swallow_thoughts_after_retry: bool,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: &Config, client: Arc<GeminiClient>) -> Self {
        Self {
            primary: Family::new(config.keys.api_keys.clone(), config, client.clone()),
            vertex: Family::new(config.keys.vertex_api_keys.clone(), config, client.clone()),
            client,
            max_retries: config.retry.max_retries,
            max_stream_retries: config.retry.max_stream_retries,
            stream_retry_delay_ms: config.retry.stream_retry_delay_ms,
            swallow_thoughts_after_retry: config.retry.swallow_thoughts_after_retry,
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Run one maintenance tick against both families' pools, ignoring
    /// families with the pool disabled.
    pub async fn maintain_all(&self) {
        if let Some(pool) = &self.primary.pool {
            pool.maintain().await;
        }
        if let Some(pool) = &self.vertex.pool {
            pool.maintain().await;
        }
    }
}
