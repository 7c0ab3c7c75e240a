//! Configuration types and loading.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use common::Secret;
use serde::Deserialize;

/// Root configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub keys: KeysConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    pub server: ServerConfig,
}

/// Credential lists and the registry's failure threshold.
#[derive(Debug, Deserialize)]
pub struct KeysConfig {
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub vertex_api_keys: Vec<String>,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

/// Valid Key Pool sizing and refill tuning.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub enabled: bool,
    pub size: usize,
    pub min_threshold: usize,
    pub emergency_refill_count: usize,
    pub concurrent_verifications: usize,
    pub key_ttl_hours: f64,
    pub maintenance_interval_minutes: u64,
    pub pro_models: Vec<String>,
    pub pro_model_max_usage: i64,
    pub non_pro_model_max_usage: i64,
    pub test_model: String,
    pub quota_reset_hour: u32,
    pub timezone: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            size: 20,
            min_threshold: 8,
            emergency_refill_count: 3,
            concurrent_verifications: 5,
            key_ttl_hours: 24.0,
            maintenance_interval_minutes: 5,
            pro_models: vec!["gemini-2.5-pro".to_string()],
            pro_model_max_usage: 100,
            non_pro_model_max_usage: -1,
            test_model: "gemini-2.0-flash".to_string(),
            quota_reset_hour: 7,
            timezone: "America/Los_Angeles".to_string(),
        }
    }
}

/// Retry driver (key-level) and Stream Retry Engine tuning.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub max_stream_retries: u32,
    pub stream_retry_delay_ms: u64,
    pub swallow_thoughts_after_retry: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_stream_retries: 5,
            stream_retry_delay_ms: 500,
            swallow_thoughts_after_retry: true,
        }
    }
}

/// Ambient server wiring — not named by the credential/pool/retry model
/// but required to bind listeners and reach upstream.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub admin_listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(skip)]
    pub admin_auth_token: Option<Secret<String>>,
}

fn default_timeout() -> u64 {
    60
}

fn default_max_failures() -> u32 {
    5
}

impl Config {
    /// Resolve the config file path: `--config` CLI flag, then
    /// `CONFIG_PATH` env var, then `config.toml` in the working directory.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        cli_path
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("CONFIG_PATH").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Load configuration from a TOML file. The admin bearer token is read
    /// from `ADMIN_AUTH_TOKEN` rather than the file, so it never lands in
    /// a config file that might be checked into version control.
    pub fn load(path: &Path) -> common::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&raw)?;
        if let Ok(token) = std::env::var("ADMIN_AUTH_TOKEN") {
            config.server.admin_auth_token = Some(Secret::new(token));
        }
        Ok(config)
    }

    /// Parsed IANA timezone for quota-reset cooldown computation, falling
    /// back to UTC for an unrecognized name rather than failing startup.
    pub fn timezone(&self) -> chrono_tz::Tz {
        self.pool
            .timezone
            .parse()
            .unwrap_or(chrono_tz::Tz::UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_path_prefers_cli_flag() {
        let path = Config::resolve_path(Some("/etc/proxy/config.toml"));
        assert_eq!(path, PathBuf::from("/etc/proxy/config.toml"));
    }

    #[test]
    fn pool_settings_default_matches_documented_defaults() {
        let defaults = PoolSettings::default();
        assert_eq!(defaults.size, 20);
        assert_eq!(defaults.min_threshold, 8);
        assert!(defaults.enabled);
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let config = Config {
            keys: KeysConfig {
                api_keys: vec![],
                vertex_api_keys: vec![],
                max_failures: 5,
            },
            pool: PoolSettings {
                timezone: "Not/A_Zone".to_string(),
                ..PoolSettings::default()
            },
            retry: RetrySettings::default(),
            server: ServerConfig {
                listen_addr: "127.0.0.1:8080".parse().unwrap(),
                admin_listen_addr: "127.0.0.1:9090".parse().unwrap(),
                upstream_url: "https://example.test".to_string(),
                timeout_secs: 60,
                admin_auth_token: None,
            },
        };
        assert_eq!(config.timezone(), chrono_tz::Tz::UTC);
    }
}
