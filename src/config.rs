//! Process configuration.
//!
//! Environment variables are read once at startup. Operational knobs that
//! must change without a restart live in the `system_config` table and are
//! exposed here as atomically swapped snapshots: readers clone an `Arc` and
//! keep using the snapshot they started with.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::store::Store;

pub const KEY_RETRY_CONFIG: &str = "retry_config";
pub const KEY_TIMEOUT_CONFIG: &str = "timeout_config";
pub const KEY_REQUEST_DETAIL: &str = "request_detail_enabled";
pub const KEY_CACHE_TTL: &str = "cache_ttl_override";

/// Configuration sourced from the environment at process start.
pub struct EnvConfig {
    pub admin_username: String,
    pub admin_password: String,
    pub server_port: u16,
    pub jwt_secret: Option<String>,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: Option<String>,
    /// 32-byte key enabling AES-GCM wrapping of stored channel keys.
    pub data_encryption_key: Option<[u8; 32]>,
    pub proxy_base_url: Option<String>,
    pub data_dir: Option<std::path::PathBuf>,
}

fn parse_encryption_key(raw: &str) -> Option<[u8; 32]> {
    let raw = raw.trim();
    if raw.len() == 64 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        let mut key = [0u8; 32];
        for (i, chunk) in raw.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            key[i] = ((hi << 4) | lo) as u8;
        }
        return Some(key);
    }
    if raw.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(raw.as_bytes());
        return Some(key);
    }
    None
}

static ENV_CONFIG: Lazy<EnvConfig> = Lazy::new(|| {
    let data_encryption_key = std::env::var("DATA_ENCRYPTION_KEY")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|raw| {
            let key = parse_encryption_key(&raw);
            if key.is_none() {
                eprintln!("DATA_ENCRYPTION_KEY must be 32 bytes (raw or 64 hex chars); stored channel keys will be plaintext");
            }
            key
        });

    EnvConfig {
        admin_username: std::env::var("ADMIN_USERNAME").unwrap_or_else(|_| "admin".to_string()),
        admin_password: std::env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "admin".to_string()),
        server_port: std::env::var("SERVER_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8787),
        jwt_secret: std::env::var("JWT_SECRET").ok().filter(|v| !v.is_empty()),
        jwt_issuer: std::env::var("JWT_ISSUER").ok().filter(|v| !v.is_empty()),
        jwt_audience: std::env::var("JWT_AUDIENCE").ok().filter(|v| !v.is_empty()),
        data_encryption_key,
        proxy_base_url: std::env::var("PROXY_BASE_URL").ok().filter(|v| !v.is_empty()),
        data_dir: std::env::var("METERGATE_DATA_DIR")
            .ok()
            .filter(|v| !v.is_empty())
            .map(std::path::PathBuf::from),
    }
});

pub fn env_config() -> &'static EnvConfig {
    &ENV_CONFIG
}

/// Retrying-transport configuration, hot-reloadable via `retry_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub enabled: bool,
    /// Total tries including the first, clamped to 1..=10.
    pub max_attempts: u32,
    /// Max time an attempt may buffer/inspect before the gate opens, 1..=60 s.
    pub gate_timeout_secs: u64,
    /// Request bodies larger than this are never replayed.
    pub max_body_bytes: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub retry_on_429: bool,
    pub retry_on_5xx: bool,
    pub respect_retry_after: bool,
    pub retry_on_empty_body: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            gate_timeout_secs: 10,
            max_body_bytes: 4 * 1024 * 1024,
            backoff_base_ms: 300,
            backoff_max_ms: 5000,
            retry_on_429: true,
            retry_on_5xx: true,
            respect_retry_after: true,
            retry_on_empty_body: true,
        }
    }
}

impl RetrySettings {
    pub fn normalized(mut self) -> Self {
        self.max_attempts = self.max_attempts.clamp(1, 10);
        self.gate_timeout_secs = self.gate_timeout_secs.clamp(1, 60);
        if self.backoff_max_ms < self.backoff_base_ms {
            self.backoff_max_ms = self.backoff_base_ms;
        }
        self
    }
}

/// Outbound HTTP client timeouts, hot-reloadable via `timeout_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub streaming_timeout_secs: u64,
    pub pool_idle_timeout_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 120,
            streaming_timeout_secs: 600,
            pool_idle_timeout_secs: 90,
        }
    }
}

#[derive(Default)]
struct HotConfigInner {
    retry: RwLock<Arc<RetrySettings>>,
    timeouts: RwLock<Arc<TimeoutSettings>>,
    request_detail: AtomicBool,
    /// Price-table refresh interval override in seconds, 0 = crate default.
    cache_ttl_secs: AtomicU64,
}

/// Handle to the hot-reloadable configuration snapshots.
#[derive(Clone, Default)]
pub struct HotConfig {
    inner: Arc<HotConfigInner>,
}

impl HotConfig {
    pub fn retry(&self) -> Arc<RetrySettings> {
        self.inner.retry.read().expect("retry lock poisoned").clone()
    }

    pub fn timeouts(&self) -> Arc<TimeoutSettings> {
        self.inner
            .timeouts
            .read()
            .expect("timeout lock poisoned")
            .clone()
    }

    pub fn request_detail_enabled(&self) -> bool {
        self.inner.request_detail.load(Ordering::Relaxed)
    }

    pub fn cache_ttl_override_secs(&self) -> Option<u64> {
        match self.inner.cache_ttl_secs.load(Ordering::Relaxed) {
            0 => None,
            v => Some(v),
        }
    }

    /// Apply a `system_config` value to the in-memory snapshots. Returns an
    /// error message when the value does not parse; the previous snapshot
    /// stays in effect.
    pub fn apply(&self, key: &str, value: &str) -> Result<(), String> {
        match key {
            KEY_RETRY_CONFIG => {
                let parsed: RetrySettings = serde_json::from_str(value)
                    .map_err(|e| format!("invalid retry_config: {}", e))?;
                *self.inner.retry.write().expect("retry lock poisoned") =
                    Arc::new(parsed.normalized());
                Ok(())
            }
            KEY_TIMEOUT_CONFIG => {
                let parsed: TimeoutSettings = serde_json::from_str(value)
                    .map_err(|e| format!("invalid timeout_config: {}", e))?;
                *self.inner.timeouts.write().expect("timeout lock poisoned") = Arc::new(parsed);
                Ok(())
            }
            KEY_REQUEST_DETAIL => {
                let enabled = matches!(value.trim(), "true" | "1" | "yes" | "on");
                self.inner.request_detail.store(enabled, Ordering::Relaxed);
                Ok(())
            }
            KEY_CACHE_TTL => {
                let secs: u64 = value
                    .trim()
                    .parse()
                    .map_err(|_| "invalid cache_ttl_override: expected seconds".to_string())?;
                self.inner.cache_ttl_secs.store(secs, Ordering::Relaxed);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Hydrate all hot keys from the store at startup.
    pub async fn load_from_store(&self, store: &Store) -> Result<(), String> {
        for key in [
            KEY_RETRY_CONFIG,
            KEY_TIMEOUT_CONFIG,
            KEY_REQUEST_DETAIL,
            KEY_CACHE_TTL,
        ] {
            if let Some(value) = store
                .system_config_get(key)
                .await
                .map_err(|e| e.to_string())?
            {
                if let Err(e) = self.apply(key, &value) {
                    crate::logger::warn("config", &format!("Skipping stored {}: {}", key, e));
                }
            }
        }
        Ok(())
    }
}
