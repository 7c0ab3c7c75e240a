//! Key Registry: the full set of known upstream credentials plus their
//! failure counts and per-model cooldowns.
//!
//! The registry is the fallback layer underneath the valid-key pool: when
//! the pool is empty it hands back a round-robin credential from here
//! instead. It holds no reference to the pool (see the pool crate's
//! `Verifier`/`KeyRegistry` wiring) to avoid the cyclic ownership the
//! original key manager had between itself and its pool.

pub mod error;

pub use error::{Error, Result};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A snapshot of the registry's valid/invalid partition, for the admin
/// surface.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub valid: Vec<(String, u32)>,
    pub invalid: Vec<(String, u32)>,
}

struct Inner {
    all: Vec<String>,
    valid: Vec<String>,
    fail_count: HashMap<String, u32>,
    cooldown: HashMap<(String, String), DateTime<Utc>>,
}

/// The full credential set with failure tracking and per-model cooldowns.
pub struct KeyRegistry {
    inner: RwLock<Inner>,
    cursor: AtomicUsize,
    max_failures: u32,
}

impl KeyRegistry {
    /// Build a registry from the configured credential list. All
    /// credentials start valid with a failure count of zero.
    pub fn new(credentials: Vec<String>, max_failures: u32) -> Self {
        info!(count = credentials.len(), "key registry initialized");
        let valid = credentials.clone();
        Self {
            inner: RwLock::new(Inner {
                all: credentials,
                valid,
                fail_count: HashMap::new(),
                cooldown: HashMap::new(),
            }),
            cursor: AtomicUsize::new(0),
            max_failures: max_failures.max(1),
        }
    }

    /// Round-robin fallback selection, skipping any credential currently
    /// in cooldown for `model`. If every valid credential is in cooldown,
    /// returns the credential at the current cursor anyway (the caller's
    /// next upstream attempt will re-classify and re-cool it — see the
    /// registry's documented open question on this behavior).
    pub async fn next_working_key(&self, model: Option<&str>) -> Option<String> {
        let inner = self.inner.read().await;
        let n = inner.valid.len();
        if n == 0 {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        let now = Utc::now();

        for offset in 0..n {
            let idx = (start + offset) % n;
            let key = &inner.valid[idx];
            if !Self::cooldown_active(&inner, key, model, now) {
                return Some(key.clone());
            }
        }

        debug!("all valid keys in cooldown for model, returning cursor key anyway");
        Some(inner.valid[start].clone())
    }

    /// The credential immediately following `current` in the valid list,
    /// wrapping around. Used by the retry driver to force a key change
    /// between attempts.
    pub async fn next_key(&self, current: &str) -> Option<String> {
        let inner = self.inner.read().await;
        let n = inner.valid.len();
        if n == 0 {
            return None;
        }
        match inner.valid.iter().position(|k| k == current) {
            Some(idx) => Some(inner.valid[(idx + 1) % n].clone()),
            None => inner.valid.first().cloned(),
        }
    }

    fn cooldown_active(inner: &Inner, key: &str, model: Option<&str>, now: DateTime<Utc>) -> bool {
        let Some(model) = model else {
            return false;
        };
        inner
            .cooldown
            .get(&(key.to_string(), model.to_string()))
            .is_some_and(|until| now < *until)
    }

    /// Mark a credential permanently failed: evicted from the valid list
    /// immediately regardless of its current failure count.
    pub async fn mark_failed(&self, key: &str) {
        let mut inner = self.inner.write().await;
        inner.fail_count.insert(key.to_string(), self.max_failures);
        inner.valid.retain(|k| k != key);
        warn!(key = %redact(key), "key marked failed");
    }

    /// Increment a credential's failure count; evicts from the valid list
    /// once the count reaches `max_failures`. Returns true if this call
    /// caused eviction.
    pub async fn increment_failure(&self, key: &str) -> bool {
        let mut inner = self.inner.write().await;
        let count = inner.fail_count.entry(key.to_string()).or_insert(0);
        *count += 1;
        let evicted = *count >= self.max_failures;
        if evicted {
            inner.valid.retain(|k| k != key);
            warn!(key = %redact(key), "key evicted after repeated failures");
        }
        evicted
    }

    /// Reset a credential's failure count to zero and re-add it to the
    /// valid list if it had been evicted.
    pub async fn reset_failure(&self, key: &str) {
        let mut inner = self.inner.write().await;
        inner.fail_count.insert(key.to_string(), 0);
        if inner.all.iter().any(|k| k == key) && !inner.valid.iter().any(|k| k == key) {
            inner.valid.push(key.to_string());
        }
    }

    /// Cool a (key, model) pair down until the next occurrence of
    /// `reset_hour` (0-23) in `tz`, expressed internally as an absolute
    /// UTC instant.
    pub async fn cool_down(&self, key: &str, model: &str, reset_hour: u32, tz: Tz) {
        let until = next_quota_reset(tz, reset_hour);
        let mut inner = self.inner.write().await;
        inner
            .cooldown
            .insert((key.to_string(), model.to_string()), until);
        info!(key = %redact(key), model, until = %until, "key cooling down for model");
    }

    /// Hard removal: deletes the credential from every internal
    /// collection.
    pub async fn remove(&self, key: &str) {
        let mut inner = self.inner.write().await;
        inner.all.retain(|k| k != key);
        inner.valid.retain(|k| k != key);
        inner.fail_count.remove(key);
        inner.cooldown.retain(|(k, _), _| k != key);
    }

    /// Replace the credential list (config reload), preserving failure
    /// counts for credentials present in both the old and new lists and
    /// advancing the cursor to the successor of the previously-selected
    /// key. Cooldowns for credentials no longer configured are dropped.
    pub async fn reset_all(&self, new_credentials: Vec<String>, preserve: bool) {
        let mut inner = self.inner.write().await;
        let previous_cursor_key = if !inner.valid.is_empty() {
            let idx = self.cursor.load(Ordering::Relaxed) % inner.valid.len();
            Some(inner.valid[idx].clone())
        } else {
            None
        };

        let old_fail_count = std::mem::take(&mut inner.fail_count);
        let old_cooldown = std::mem::take(&mut inner.cooldown);

        inner.all = new_credentials.clone();
        inner.valid = new_credentials;

        if preserve {
            for (key, count) in old_fail_count {
                if inner.all.contains(&key) {
                    if count >= self.max_failures {
                        inner.valid.retain(|k| k != &key);
                    }
                    inner.fail_count.insert(key, count);
                }
            }
            for (pair, until) in old_cooldown {
                if inner.all.contains(&pair.0) {
                    inner.cooldown.insert(pair, until);
                }
            }
        }

        let new_cursor = previous_cursor_key
            .and_then(|prev| inner.valid.iter().position(|k| k == &prev))
            .map(|idx| idx + 1)
            .unwrap_or(0);
        self.cursor.store(new_cursor, Ordering::Relaxed);

        info!(count = inner.all.len(), preserve, "registry reset");
    }

    /// Whether `key` is currently cooling down for `model`.
    pub async fn in_cooldown(&self, key: &str, model: Option<&str>) -> bool {
        let inner = self.inner.read().await;
        Self::cooldown_active(&inner, key, model, Utc::now())
    }

    pub async fn is_valid(&self, key: &str) -> bool {
        self.inner.read().await.valid.iter().any(|k| k == key)
    }

    pub async fn fail_count(&self, key: &str) -> u32 {
        self.inner
            .read()
            .await
            .fail_count
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub async fn all_keys(&self) -> Vec<String> {
        self.inner.read().await.all.clone()
    }

    pub async fn valid_keys(&self) -> Vec<String> {
        self.inner.read().await.valid.clone()
    }

    /// Valid/invalid partition with failure counts, for the admin surface.
    pub async fn status_snapshot(&self) -> StatusSnapshot {
        let inner = self.inner.read().await;
        let mut valid = Vec::new();
        let mut invalid = Vec::new();
        for key in &inner.all {
            let count = inner.fail_count.get(key).copied().unwrap_or(0);
            if inner.valid.contains(key) {
                valid.push((key.clone(), count));
            } else {
                invalid.push((key.clone(), count));
            }
        }
        StatusSnapshot { valid, invalid }
    }
}

/// Next wall-clock instant at `reset_hour:00` in `tz`, expressed in UTC.
fn next_quota_reset(tz: Tz, reset_hour: u32) -> DateTime<Utc> {
    let now_local = Utc::now().with_timezone(&tz);
    let mut candidate = tz
        .with_ymd_and_hms(
            now_local.date_naive().year(),
            now_local.date_naive().month(),
            now_local.date_naive().day(),
            reset_hour.min(23),
            0,
            0,
        )
        .single()
        .unwrap_or(now_local);

    if candidate <= now_local {
        candidate += ChronoDuration::days(1);
    }
    candidate.with_timezone(&Utc)
}

/// First 8 chars of a credential for safe logging, matching the prefix
/// convention used throughout the reference material.
fn redact(key: &str) -> String {
    let prefix: String = key.chars().take(8).collect();
    format!("{prefix}...")
}
