//! Valid Key Pool: a small, continuously-verified working set of credentials
//! drawn from the key registry.
//!
//! Where the registry just tracks "have we seen this key fail," the pool
//! keeps a bounded ring of credentials that have actually round-tripped a
//! live verification call recently, so request-time checkout never pays for
//! an upstream probe. The pool holds an `Arc<KeyRegistry>` and a `Verifier`
//! it never owns the registry's write path directly; all failure
//! bookkeeping still goes through the registry.
//!
//! Background refill and emergency refill run as spawned tasks against
//! `Arc<ValidKeyPool>`, so construction returns the pool already wrapped.

pub mod error;

pub use error::{Error, Result};

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono_tz::Tz;
use error_classifier::KeyAction;
use key_registry::KeyRegistry;
use rand::seq::SliceRandom;
use rand::RngExt;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

/// A verification probe against the upstream API. Implementations own the
/// HTTP client and the minimal request body needed to confirm a credential
/// is live.
///
/// Uses `Pin<Box<dyn Future>>` for dyn-compatibility, the same shape the
/// rest of this workspace uses for its provider abstraction.
pub trait Verifier: Send + Sync {
    fn verify<'a>(
        &'a self,
        key: &'a str,
        model: &'a str,
    ) -> Pin<Box<dyn Future<Output = VerifyOutcome> + Send + 'a>>;
}

/// Result of one verification probe.
#[derive(Debug, Clone)]
pub enum VerifyOutcome {
    Success,
    Failure { status: u16, body: String },
}

/// Static pool configuration, sourced from the deployment's configuration
/// file.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub pool_size: usize,
    pub min_threshold: usize,
    pub emergency_refill_count: usize,
    pub ttl_hours: f64,
    pub concurrent_verifications: usize,
    pub test_model: String,
    pub pro_models: Vec<String>,
    pub pro_model_max_usage: i64,
    pub non_pro_model_max_usage: i64,
    pub min_refill_interval: Duration,
    pub quota_reset_hour: u32,
    pub timezone: Tz,
}

impl PoolConfig {
    fn normalize_model(model: &str) -> String {
        model
            .strip_suffix("-non-thinking")
            .or_else(|| model.strip_suffix("-search"))
            .or_else(|| model.strip_suffix("-image"))
            .unwrap_or(model)
            .to_string()
    }

    fn is_pro_model(&self, model: &str) -> bool {
        let normalized = Self::normalize_model(model);
        self.pro_models.iter().any(|pm| normalized.contains(pm.as_str()))
    }

    fn max_usage_for_model(&self, model: Option<&str>) -> i64 {
        match model {
            Some(m) if self.is_pro_model(m) => self.pro_model_max_usage,
            _ => self.non_pro_model_max_usage,
        }
    }
}

/// A credential currently held in the working set, with its TTL and
/// per-model usage count since it entered the pool.
#[derive(Debug, Clone)]
pub struct PooledKey {
    pub key: String,
    created_at: Instant,
    expires_at: Instant,
    usage_count: u32,
}

impl PooledKey {
    fn new(key: String, ttl_hours: f64) -> Self {
        let ttl_secs = (ttl_hours * 3600.0).max(0.0);
        let jitter = rand::rng().random_range(-ttl_secs * 0.10..=ttl_secs * 0.10);
        let now = Instant::now();
        Self {
            key,
            created_at: now,
            expires_at: now + Duration::from_secs_f64((ttl_secs + jitter).max(0.0)),
            usage_count: 0,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    fn is_usage_exhausted(&self, max_usage: i64) -> bool {
        max_usage > 0 && self.usage_count as i64 >= max_usage
    }

    fn age_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }
}

struct PoolState {
    pool: VecDeque<PooledKey>,
    pool_set: HashSet<String>,
}

#[derive(Default)]
struct Stats {
    hit_count: AtomicU64,
    miss_count: AtomicU64,
    emergency_refill_count: AtomicU64,
    expired_keys_removed: AtomicU64,
    usage_exhausted_keys_removed: AtomicU64,
    total_verifications: AtomicU64,
    successful_verifications: AtomicU64,
    verification_failures: AtomicU64,
    maintenance_count: AtomicU64,
    pro_model_requests: AtomicU64,
    non_pro_model_requests: AtomicU64,
    keys_checked_for_expiration: AtomicU64,
}

#[derive(Default)]
struct PerfTimes {
    last_hit: Option<Instant>,
    last_miss: Option<Instant>,
    last_maintenance: Option<Instant>,
}

/// Snapshot of pool health and counters, for the admin status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pool_size: usize,
    pub current_size: usize,
    pub utilization: f64,
    pub ttl_hours: f64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub emergency_refill_count: u64,
    pub expired_keys_removed: u64,
    pub usage_exhausted_keys_removed: u64,
    pub total_verifications: u64,
    pub successful_verifications: u64,
    pub verification_failures: u64,
    pub verification_success_rate: f64,
    pub verification_failure_rate: f64,
    pub maintenance_count: u64,
    pub pro_model_requests: u64,
    pub non_pro_model_requests: u64,
    pub avg_key_age_secs: f64,
    pub max_key_age_secs: u64,
    pub min_key_age_secs: u64,
    pub ttl_expiry_rate: f64,
    pub keys_checked_for_expiration: u64,
}

/// The working set of verified credentials sitting in front of the
/// registry.
pub struct ValidKeyPool {
    state: Mutex<PoolState>,
    in_verification: Mutex<HashSet<String>>,
    verification_sem: Semaphore,
    emergency_lock: Arc<Mutex<()>>,
    last_refill: Mutex<Option<Instant>>,
    perf: Mutex<PerfTimes>,
    registry: Arc<KeyRegistry>,
    verifier: Arc<dyn Verifier>,
    config: PoolConfig,
    stats: Stats,
}

impl ValidKeyPool {
    /// Build a pool. The verifier is required at construction — there is no
    /// way to run a pool without something to check keys against, so this
    /// is not an `Option` that gets filled in later.
    pub fn new(
        registry: Arc<KeyRegistry>,
        verifier: Arc<dyn Verifier>,
        config: PoolConfig,
    ) -> Result<Arc<Self>> {
        if config.pool_size == 0 {
            return Err(Error::InvalidConfig("pool_size must be > 0".into()));
        }
        if config.concurrent_verifications == 0 {
            return Err(Error::InvalidConfig(
                "concurrent_verifications must be > 0".into(),
            ));
        }
        info!(
            pool_size = config.pool_size,
            min_threshold = config.min_threshold,
            "valid key pool initialized"
        );
        let sem = Semaphore::new(config.concurrent_verifications);
        Ok(Arc::new(Self {
            state: Mutex::new(PoolState {
                pool: VecDeque::with_capacity(config.pool_size),
                pool_set: HashSet::new(),
            }),
            in_verification: Mutex::new(HashSet::new()),
            verification_sem: sem,
            emergency_lock: Arc::new(Mutex::new(())),
            last_refill: Mutex::new(None),
            perf: Mutex::new(PerfTimes::default()),
            registry,
            verifier,
            config,
            stats: Stats::default(),
        }))
    }

    /// Hand back a usable credential for `model`. Never fails outright: if
    /// the pool is empty it falls through to the registry's round-robin
    /// fallback, returning `None` only if the registry itself has no
    /// credentials at all.
    pub async fn checkout(self: &Arc<Self>, model: Option<&str>) -> Option<String> {
        self.record_model_stat(model);
        self.remove_expired_keys().await;

        let max_usage = self.config.max_usage_for_model(model);
        let mut state = self.state.lock().await;

        loop {
            let Some(mut entry) = state.pool.pop_front() else {
                break;
            };
            state.pool_set.remove(&entry.key);

            let expired = entry.is_expired();
            drop(state);
            let cooling = if expired {
                false
            } else {
                self.registry.in_cooldown(&entry.key, model).await
            };

            if !expired && !cooling {
                if entry.is_usage_exhausted(max_usage) {
                    self.stats
                        .usage_exhausted_keys_removed
                        .fetch_add(1, Ordering::Relaxed);
                    self.trigger_refill_on_key_removal(model).await;
                    state = self.state.lock().await;
                    continue;
                }

                entry.usage_count += 1;
                let key = entry.key.clone();
                state = self.state.lock().await;
                state.pool.push_back(entry);
                state.pool_set.insert(key.clone());
                drop(state);
                self.record_hit().await;
                return Some(key);
            }

            if expired {
                self.stats.expired_keys_removed.fetch_add(1, Ordering::Relaxed);
            }
            self.trigger_refill_on_key_removal(model).await;
            state = self.state.lock().await;
        }
        drop(state);

        self.emergency_refill(model).await
    }

    /// Remove a key from the working set (hard eviction, e.g. after a
    /// disqualifying upstream error) and trigger the same refill logic a
    /// natural pool-exhaustion event would.
    pub async fn evict(self: &Arc<Self>, key: &str) {
        {
            let mut state = self.state.lock().await;
            state.pool.retain(|entry| entry.key != key);
            state.pool_set.remove(key);
        }
        self.trigger_refill_on_key_removal(None).await;
    }

    /// Record that an upstream call with `key` succeeded, clearing its
    /// registry failure count.
    pub async fn report_success(&self, key: &str) {
        self.registry.reset_failure(key).await;
    }

    /// Record that an upstream call with `key` failed, running the failure
    /// through the shared classifier and applying whatever action it
    /// prescribes against the registry and, for evicting actions, the pool.
    pub async fn report_failure(self: &Arc<Self>, key: &str, model: Option<&str>, status: u16, _body: &str) {
        let classification = error_classifier::classify(status, model);
        self.apply_key_action(key, model, classification.key_action).await;
        if matches!(
            classification.key_action,
            KeyAction::MarkFailed | KeyAction::DecrementAndEvict
        ) {
            self.evict(key).await;
        }
    }

    /// Record an ultimate request failure (all retries exhausted without a
    /// working key). Unlike pool-exhaustion events mid-checkout, this is
    /// the caller's explicit signal that the whole request failed.
    pub fn record_miss(&self) {
        self.stats.miss_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Periodic maintenance: expire stale entries, refill toward capacity
    /// with one-second pacing between attempts, and occasionally sweep the
    /// pool for TTL-only liveness. This is the scheduler's entry point; the
    /// scheduler itself is out of scope here.
    pub async fn maintain(self: &Arc<Self>) {
        self.stats.maintenance_count.fetch_add(1, Ordering::Relaxed);
        self.perf.lock().await.last_maintenance = Some(Instant::now());
        self.remove_expired_keys().await;

        let current_size = self.state.lock().await.pool.len();
        if current_size < self.config.pool_size {
            let refill_target = if current_size < self.config.min_threshold {
                3
            } else if (current_size as f64) < (self.config.pool_size as f64) * 0.7 {
                2
            } else {
                1
            };
            let max_attempts = refill_target * 2;
            let mut successes = 0;
            let mut attempts = 0;
            while successes < refill_target && attempts < max_attempts {
                if self.async_verify_and_add(None).await {
                    successes += 1;
                }
                attempts += 1;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            debug!(successes, attempts, refill_target, "maintenance refill pass complete");
        }

        let maintenance_count = self.stats.maintenance_count.load(Ordering::Relaxed);
        let size_now = self.state.lock().await.pool.len();
        let should_validate = (size_now > 0 && size_now < self.config.min_threshold)
            || maintenance_count % 5 == 0;
        if should_validate {
            self.validate_pool_keys().await;
        }
    }

    /// Current counters and derived rates, for the admin status endpoint.
    pub async fn stats(&self) -> PoolStats {
        let ages: Vec<u64> = {
            let state = self.state.lock().await;
            state.pool.iter().map(PooledKey::age_secs).collect()
        };
        let current_size = ages.len();

        let hit = self.stats.hit_count.load(Ordering::Relaxed);
        let miss = self.stats.miss_count.load(Ordering::Relaxed);
        let lookups = hit + miss;
        let (hit_rate, miss_rate) = if lookups > 0 {
            (hit as f64 / lookups as f64, miss as f64 / lookups as f64)
        } else {
            (0.0, 0.0)
        };

        let total_ver = self.stats.total_verifications.load(Ordering::Relaxed);
        let succ_ver = self.stats.successful_verifications.load(Ordering::Relaxed);
        let fail_ver = self.stats.verification_failures.load(Ordering::Relaxed);
        let (ver_success_rate, ver_failure_rate) = if total_ver > 0 {
            (
                succ_ver as f64 / total_ver as f64,
                fail_ver as f64 / total_ver as f64,
            )
        } else {
            (0.0, 0.0)
        };

        let checked = self.stats.keys_checked_for_expiration.load(Ordering::Relaxed);
        let expired_removed = self.stats.expired_keys_removed.load(Ordering::Relaxed);
        let ttl_expiry_rate = if checked > 0 {
            expired_removed as f64 / checked as f64
        } else {
            0.0
        };

        PoolStats {
            pool_size: self.config.pool_size,
            current_size,
            utilization: if self.config.pool_size > 0 {
                current_size as f64 / self.config.pool_size as f64
            } else {
                0.0
            },
            ttl_hours: self.config.ttl_hours,
            hit_count: hit,
            miss_count: miss,
            hit_rate,
            miss_rate,
            emergency_refill_count: self.stats.emergency_refill_count.load(Ordering::Relaxed),
            expired_keys_removed: expired_removed,
            usage_exhausted_keys_removed: self
                .stats
                .usage_exhausted_keys_removed
                .load(Ordering::Relaxed),
            total_verifications: total_ver,
            successful_verifications: succ_ver,
            verification_failures: fail_ver,
            verification_success_rate: ver_success_rate,
            verification_failure_rate: ver_failure_rate,
            maintenance_count: self.stats.maintenance_count.load(Ordering::Relaxed),
            pro_model_requests: self.stats.pro_model_requests.load(Ordering::Relaxed),
            non_pro_model_requests: self.stats.non_pro_model_requests.load(Ordering::Relaxed),
            avg_key_age_secs: if ages.is_empty() {
                0.0
            } else {
                ages.iter().sum::<u64>() as f64 / ages.len() as f64
            },
            max_key_age_secs: ages.iter().copied().max().unwrap_or(0),
            min_key_age_secs: ages.iter().copied().min().unwrap_or(0),
            ttl_expiry_rate,
            keys_checked_for_expiration: checked,
        }
    }

    /// Number of keys currently in the working set.
    pub async fn len(&self) -> usize {
        self.state.lock().await.pool.len()
    }

    fn record_model_stat(&self, model: Option<&str>) {
        match model {
            Some(m) if self.config.is_pro_model(m) => {
                self.stats.pro_model_requests.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.stats.non_pro_model_requests.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn record_hit(&self) {
        self.stats.hit_count.fetch_add(1, Ordering::Relaxed);
        self.perf.lock().await.last_hit = Some(Instant::now());
    }

    async fn apply_key_action(&self, key: &str, model: Option<&str>, action: KeyAction) {
        match action {
            KeyAction::CoolDownModel => {
                let model_label = model.unwrap_or(&self.config.test_model);
                self.registry
                    .cool_down(
                        key,
                        model_label,
                        self.config.quota_reset_hour,
                        self.config.timezone,
                    )
                    .await;
            }
            KeyAction::MarkFailed => self.registry.mark_failed(key).await,
            KeyAction::DecrementAndEvict => {
                self.registry.increment_failure(key).await;
            }
            KeyAction::CountOnly => {}
        }
    }

    /// Probabilistic refill, triggered whenever a key leaves the pool
    /// (expired, cooled down, or usage-exhausted). Below `min_threshold`
    /// this is unconditional; otherwise the chance climbs the closer the
    /// pool gets to empty, throttled to at most one spawn per
    /// `min_refill_interval`.
    async fn trigger_refill_on_key_removal(self: &Arc<Self>, model: Option<&str>) {
        let current_size = self.state.lock().await.pool.len();

        if current_size < self.config.min_threshold {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                pool.emergency_refill_async(None).await;
            });
            return;
        }

        if current_size >= self.config.pool_size {
            return;
        }

        let now = Instant::now();
        {
            let mut last = self.last_refill.lock().await;
            if let Some(prev) = *last {
                if now.duration_since(prev) < self.config.min_refill_interval {
                    return;
                }
            }
            *last = Some(now);
        }

        let threshold = self.config.min_threshold as f64;
        let refill_chance = if (current_size as f64) < (self.config.pool_size as f64) * 0.8 {
            if (current_size as f64) < threshold * 1.5 {
                0.4
            } else if (current_size as f64) < threshold * 2.0 {
                0.3
            } else {
                0.2
            }
        } else {
            0.05
        };

        if rand::rng().random::<f64>() < refill_chance {
            let pool = Arc::clone(self);
            let model = model.map(str::to_string);
            tokio::spawn(async move {
                pool.async_verify_and_add(model.as_deref()).await;
            });
        }
    }

    /// Pick one unused-but-valid registry credential, verify it, and add it
    /// to the pool on success. Gated by the verification semaphore.
    async fn async_verify_and_add(&self, model: Option<&str>) -> bool {
        let Ok(_permit) = self.verification_sem.acquire().await else {
            return false;
        };

        if self.state.lock().await.pool.len() >= self.config.pool_size {
            return false;
        }

        let pool_set = self.state.lock().await.pool_set.clone();
        let in_verification = self.in_verification.lock().await.clone();

        let mut candidates = Vec::new();
        for key in self.registry.valid_keys().await {
            if pool_set.contains(&key) || in_verification.contains(&key) {
                continue;
            }
            if self.registry.in_cooldown(&key, model).await {
                continue;
            }
            candidates.push(key);
        }
        if candidates.is_empty() {
            return false;
        }

        let idx = rand::rng().random_range(0..candidates.len());
        let selected = candidates.swap_remove(idx);

        self.in_verification.lock().await.insert(selected.clone());
        let success = self.verify_key(&selected, model).await;
        self.in_verification.lock().await.remove(&selected);

        if success {
            let mut state = self.state.lock().await;
            if state.pool.len() < self.config.pool_size && !state.pool_set.contains(&selected) {
                state.pool_set.insert(selected.clone());
                state.pool.push_back(PooledKey::new(selected, self.config.ttl_hours));
            }
        }
        success
    }

    /// Verify a single credential, running any failure through the shared
    /// classifier exactly as a live request failure would be. Used by both
    /// the refill path and emergency fan-out.
    async fn verify_key(&self, key: &str, model: Option<&str>) -> bool {
        self.stats.total_verifications.fetch_add(1, Ordering::Relaxed);
        let test_model = model.unwrap_or(&self.config.test_model);
        match self.verifier.verify(key, test_model).await {
            VerifyOutcome::Success => {
                self.registry.reset_failure(key).await;
                self.stats.successful_verifications.fetch_add(1, Ordering::Relaxed);
                true
            }
            VerifyOutcome::Failure { status, body: _ } => {
                let classification = error_classifier::classify(status, model);
                self.apply_key_action(key, model, classification.key_action).await;
                self.stats.verification_failures.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Non-blocking fallback for an exhausted pool: returns the registry's
    /// immediate round-robin candidate while a background task tries to
    /// restock the pool. The caller is never blocked on the restock.
    async fn emergency_refill(self: &Arc<Self>, model: Option<&str>) -> Option<String> {
        let candidate = self.registry.next_working_key(model).await;

        if let Ok(guard) = Arc::clone(&self.emergency_lock).try_lock_owned() {
            let pool = Arc::clone(self);
            let model = model.map(str::to_string);
            tokio::spawn(async move {
                let _guard = guard;
                pool.background_emergency_refill(model.as_deref()).await;
            });
        }

        candidate
    }

    /// Fan out verification across a random sample of unused registry
    /// credentials, adding every one that passes. Called only from
    /// `emergency_refill`'s spawned task, which already holds
    /// `emergency_lock` for the duration of this call.
    async fn background_emergency_refill(self: &Arc<Self>, model: Option<&str>) {
        let pool_keys = self.state.lock().await.pool_set.clone();
        let mut available = Vec::new();
        for key in self.registry.valid_keys().await {
            if pool_keys.contains(&key) {
                continue;
            }
            if self.registry.in_cooldown(&key, model).await {
                continue;
            }
            available.push(key);
        }
        if available.is_empty() {
            return;
        }

        let refill_count = self.config.emergency_refill_count.min(available.len());
        available.shuffle(&mut rand::rng());
        let sample = &available[..refill_count];

        let results = futures_util::future::join_all(
            sample.iter().map(|key| self.verify_for_emergency(key, model)),
        )
        .await;

        let mut any_success = false;
        for (key, ok) in sample.iter().zip(results) {
            if !ok {
                continue;
            }
            any_success = true;
            let mut state = self.state.lock().await;
            if state.pool.len() < self.config.pool_size && !state.pool_set.contains(key) {
                state.pool_set.insert(key.clone());
                state.pool.push_back(PooledKey::new(key.clone(), self.config.ttl_hours));
            }
        }
        if any_success {
            self.stats.emergency_refill_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The unconditional below-`min_threshold` refill: fills the gap up to
    /// `min_threshold` with concurrently-verified credentials.
    async fn emergency_refill_async(self: &Arc<Self>, model: Option<&str>) {
        let current_size = self.state.lock().await.pool.len();
        if current_size >= self.config.min_threshold {
            return;
        }
        let needed = self.config.min_threshold - current_size;
        let refill_count = self.config.emergency_refill_count.min(needed);
        if refill_count == 0 {
            return;
        }

        futures_util::future::join_all(
            (0..refill_count).map(|_| self.async_verify_and_add(model)),
        )
        .await;
    }

    /// Simplified verification for the emergency fan-out path: skips the
    /// `in_verification` bookkeeping the normal refill path uses, since
    /// emergency fan-out already verified these keys are unused up front.
    async fn verify_for_emergency(&self, key: &str, model: Option<&str>) -> bool {
        let Ok(_permit) = self.verification_sem.acquire().await else {
            return false;
        };
        let test_model = model.unwrap_or(&self.config.test_model);
        matches!(
            self.verifier.verify(key, test_model).await,
            VerifyOutcome::Success
        )
    }

    /// Drop TTL-expired entries from the pool. Each expired credential is
    /// not just discarded: it gets one more background chance to
    /// revalidate and re-enter with a fresh TTL, since a credential that
    /// merely aged out is not necessarily bad.
    async fn remove_expired_keys(self: &Arc<Self>) {
        let expired_keys: Vec<String> = {
            let mut state = self.state.lock().await;
            let drained: Vec<PooledKey> = state.pool.drain(..).collect();
            self.stats
                .keys_checked_for_expiration
                .fetch_add(drained.len() as u64, Ordering::Relaxed);

            let mut expired = Vec::new();
            for entry in drained {
                if entry.is_expired() {
                    state.pool_set.remove(&entry.key);
                    expired.push(entry.key.clone());
                } else {
                    state.pool.push_back(entry);
                }
            }
            expired
        };

        if expired_keys.is_empty() {
            return;
        }
        self.stats
            .expired_keys_removed
            .fetch_add(expired_keys.len() as u64, Ordering::Relaxed);

        for key in expired_keys {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                pool.revalidate_and_readd(&key).await;
            });
        }
    }

    async fn revalidate_and_readd(&self, key: &str) {
        let Ok(_permit) = self.verification_sem.acquire().await else {
            return;
        };
        {
            let state = self.state.lock().await;
            if state.pool.len() >= self.config.pool_size || state.pool_set.contains(key) {
                return;
            }
        }
        if self.verify_key(key, None).await {
            let mut state = self.state.lock().await;
            if state.pool.len() < self.config.pool_size && !state.pool_set.contains(key) {
                state.pool_set.insert(key.to_string());
                state.pool.push_back(PooledKey::new(key.to_string(), self.config.ttl_hours));
            }
        }
    }

    /// Sample up to five pool entries and drop any that turn out to be
    /// expired. TTL-only: no upstream call, so it never burns quota.
    async fn validate_pool_keys(&self) {
        let sample: Vec<String> = {
            let state = self.state.lock().await;
            let len = state.pool.len();
            let n = len.min(5);
            let mut idxs: Vec<usize> = (0..len).collect();
            idxs.shuffle(&mut rand::rng());
            idxs.into_iter().take(n).map(|i| state.pool[i].key.clone()).collect()
        };

        let mut state = self.state.lock().await;
        for key in sample {
            if let Some(pos) = state.pool.iter().position(|e| e.key == key) {
                if state.pool[pos].is_expired() {
                    state.pool.remove(pos);
                    state.pool_set.remove(&key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct AlwaysOk;
    impl Verifier for AlwaysOk {
        fn verify<'a>(
            &'a self,
            _key: &'a str,
            _model: &'a str,
        ) -> Pin<Box<dyn Future<Output = VerifyOutcome> + Send + 'a>> {
            Box::pin(async { VerifyOutcome::Success })
        }
    }

    struct AlwaysFail(u16);
    impl Verifier for AlwaysFail {
        fn verify<'a>(
            &'a self,
            _key: &'a str,
            _model: &'a str,
        ) -> Pin<Box<dyn Future<Output = VerifyOutcome> + Send + 'a>> {
            Box::pin(async move {
                VerifyOutcome::Failure {
                    status: self.0,
                    body: "nope".into(),
                }
            })
        }
    }

    /// Succeeds for every key except the ones listed, letting tests steer
    /// which credential emergency refill should pick.
    struct FailOnly(Vec<String>, AtomicBool);
    impl FailOnly {
        fn new(bad: Vec<String>) -> Self {
            Self(bad, AtomicBool::new(false))
        }
    }
    impl Verifier for FailOnly {
        fn verify<'a>(
            &'a self,
            key: &'a str,
            _model: &'a str,
        ) -> Pin<Box<dyn Future<Output = VerifyOutcome> + Send + 'a>> {
            let bad = self.0.contains(&key.to_string());
            Box::pin(async move {
                if bad {
                    VerifyOutcome::Failure {
                        status: 401,
                        body: "bad".into(),
                    }
                } else {
                    VerifyOutcome::Success
                }
            })
        }
    }

    fn test_config(pool_size: usize, min_threshold: usize) -> PoolConfig {
        PoolConfig {
            pool_size,
            min_threshold,
            emergency_refill_count: 2,
            ttl_hours: 1.0,
            concurrent_verifications: 4,
            test_model: "gemini-test".into(),
            pro_models: vec!["gemini-2.5-pro".into()],
            pro_model_max_usage: 2,
            non_pro_model_max_usage: 5,
            min_refill_interval: Duration::from_millis(0),
            quota_reset_hour: 0,
            timezone: chrono_tz::UTC,
        }
    }

    async fn seeded_pool(
        credentials: Vec<&str>,
        seed: Vec<&str>,
        verifier: Arc<dyn Verifier>,
        config: PoolConfig,
    ) -> Arc<ValidKeyPool> {
        let registry = Arc::new(KeyRegistry::new(
            credentials.into_iter().map(String::from).collect(),
            3,
        ));
        let pool = ValidKeyPool::new(registry, verifier, config).unwrap();
        {
            let mut state = pool.state.lock().await;
            for key in seed {
                state.pool_set.insert(key.to_string());
                state.pool.push_back(PooledKey::new(key.to_string(), 1.0));
            }
        }
        pool
    }

    #[tokio::test]
    async fn checkout_returns_seeded_key() {
        let pool = seeded_pool(
            vec!["a", "b"],
            vec!["a"],
            Arc::new(AlwaysOk),
            test_config(5, 2),
        )
        .await;
        let key = pool.checkout(None).await;
        assert_eq!(key, Some("a".to_string()));
    }

    #[tokio::test]
    async fn checkout_recycles_key_to_back_of_queue() {
        let pool = seeded_pool(
            vec!["a", "b"],
            vec!["a", "b"],
            Arc::new(AlwaysOk),
            test_config(5, 2),
        )
        .await;
        let k1 = pool.checkout(None).await.unwrap();
        let k2 = pool.checkout(None).await.unwrap();
        let k3 = pool.checkout(None).await.unwrap();
        assert_eq!(k1, "a");
        assert_eq!(k2, "b");
        assert_eq!(k3, "a");
    }

    #[tokio::test]
    async fn checkout_skips_usage_exhausted_key() {
        let mut config = test_config(5, 2);
        config.non_pro_model_max_usage = 1;
        let pool = seeded_pool(vec!["a", "b"], vec!["a", "b"], Arc::new(AlwaysOk), config).await;

        // "a" gets used once, exhausting its cap; "b" still has headroom.
        let first = pool.checkout(None).await.unwrap();
        assert_eq!(first, "a");
        let second = pool.checkout(None).await.unwrap();
        assert_eq!(second, "b");
        // "a" is now exhausted and should be skipped, "b" cycles back.
        let third = pool.checkout(None).await.unwrap();
        assert_eq!(third, "b");
    }

    #[tokio::test]
    async fn checkout_zero_cap_is_unlimited() {
        let mut config = test_config(5, 2);
        config.non_pro_model_max_usage = 0;
        let pool = seeded_pool(vec!["a"], vec!["a"], Arc::new(AlwaysOk), config).await;

        for _ in 0..10 {
            let key = pool.checkout(None).await;
            assert_eq!(key, Some("a".to_string()));
        }
    }

    #[tokio::test]
    async fn checkout_falls_back_to_registry_when_pool_empty() {
        let pool = seeded_pool(vec!["fallback"], vec![], Arc::new(AlwaysOk), test_config(5, 2)).await;
        let key = pool.checkout(None).await;
        assert_eq!(key, Some("fallback".to_string()));
    }

    #[tokio::test]
    async fn checkout_on_empty_registry_returns_none() {
        let pool = seeded_pool(vec![], vec![], Arc::new(AlwaysOk), test_config(5, 2)).await;
        assert!(pool.checkout(None).await.is_none());
    }

    #[tokio::test]
    async fn evict_removes_key_from_pool() {
        let pool = seeded_pool(
            vec!["a", "b"],
            vec!["a", "b"],
            Arc::new(AlwaysOk),
            test_config(5, 2),
        )
        .await;
        pool.evict("a").await;
        assert_eq!(pool.len().await, 1);
        let key = pool.checkout(None).await.unwrap();
        assert_eq!(key, "b");
    }

    #[tokio::test]
    async fn report_failure_auth_error_evicts_and_marks_registry_failed() {
        let pool = seeded_pool(
            vec!["a", "b"],
            vec!["a", "b"],
            Arc::new(AlwaysFail(401)),
            test_config(5, 2),
        )
        .await;
        pool.report_failure("a", None, 401, "unauthorized").await;
        assert_eq!(pool.len().await, 1);
        assert!(!pool.registry.is_valid("a").await);
    }

    #[tokio::test]
    async fn report_success_resets_registry_failure_count() {
        let pool = seeded_pool(vec!["a"], vec!["a"], Arc::new(AlwaysOk), test_config(5, 2)).await;
        pool.registry.increment_failure("a").await;
        pool.report_success("a").await;
        assert_eq!(pool.registry.fail_count("a").await, 0);
    }

    #[tokio::test]
    async fn record_miss_increments_stat_only() {
        let pool = seeded_pool(vec!["a"], vec!["a"], Arc::new(AlwaysOk), test_config(5, 2)).await;
        pool.record_miss();
        pool.record_miss();
        let stats = pool.stats().await;
        assert_eq!(stats.miss_count, 2);
        assert_eq!(stats.hit_count, 0);
    }

    #[tokio::test]
    async fn maintain_refills_toward_capacity() {
        let config = test_config(3, 1);
        let pool = seeded_pool(vec!["a", "b", "c"], vec![], Arc::new(AlwaysOk), config).await;
        pool.maintain().await;
        assert!(pool.len().await > 0);
    }

    #[tokio::test]
    async fn maintain_increments_maintenance_count() {
        let pool = seeded_pool(vec!["a"], vec!["a"], Arc::new(AlwaysOk), test_config(2, 1)).await;
        pool.maintain().await;
        let stats = pool.stats().await;
        assert_eq!(stats.maintenance_count, 1);
    }

    #[tokio::test]
    async fn stats_compute_hit_and_miss_rate() {
        let pool = seeded_pool(
            vec!["a", "b"],
            vec!["a", "b"],
            Arc::new(AlwaysOk),
            test_config(5, 2),
        )
        .await;
        pool.checkout(None).await;
        pool.record_miss();
        let stats = pool.stats().await;
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn pro_model_usage_cap_applies_for_pro_models() {
        let mut config = test_config(5, 2);
        config.pro_model_max_usage = 1;
        let pool = seeded_pool(vec!["a", "b"], vec!["a", "b"], Arc::new(AlwaysOk), config).await;

        let first = pool.checkout(Some("gemini-2.5-pro")).await.unwrap();
        assert_eq!(first, "a");
        // "a" is now exhausted for the pro cap; "b" should come next, then
        // cycle back to "b" again since "a" stays skipped.
        let second = pool.checkout(Some("gemini-2.5-pro")).await.unwrap();
        assert_eq!(second, "b");
        let third = pool.checkout(Some("gemini-2.5-pro")).await.unwrap();
        assert_eq!(third, "b");
    }

    #[tokio::test]
    async fn emergency_refill_picks_up_unused_registry_key() {
        let config = test_config(5, 1);
        let pool = seeded_pool(vec!["a", "b"], vec![], Arc::new(FailOnly::new(vec![])), config).await;
        let key = pool.checkout(None).await;
        assert!(key.is_some());
        // background_emergency_refill was spawned; give it a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn concurrent_pool_misses_spawn_exactly_one_emergency_refill() {
        let config = test_config(5, 1);
        let pool = seeded_pool(
            vec!["a", "b", "c", "d"],
            vec![],
            Arc::new(AlwaysOk),
            config,
        )
        .await;

        let misses = (0..8).map(|_| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.checkout(None).await })
        });
        futures_util::future::join_all(misses).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = pool.stats().await;
        assert_eq!(
            stats.emergency_refill_count, 1,
            "a burst of concurrent pool misses must spawn exactly one background refill"
        );
    }
}
