//! Persistent store.
//!
//! A single SQLite database holds every table in the data model. All
//! monetary amounts are signed 64-bit micro-USD; all timestamps are UTC
//! RFC3339 strings with a fixed width so lexicographic order matches time
//! order. Mutation boundaries are explicit transactions on a connection
//! checked out from the bounded pool.

pub mod api_keys;
pub mod billing;
pub mod channels;
pub mod groups;
pub mod mappings;
pub mod migrate;
pub mod plans;
pub mod prices;
pub mod request_logs;
pub mod subscriptions;
pub mod system_config;
pub mod users;

use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{AppError, AppResult};

/// Most connections the pool will hand out at once.
const MAX_OPEN: usize = 10;
/// Idle connections kept around for reuse.
const MAX_IDLE: usize = 5;

const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";
/// Sentinel upper bound for `total` windows.
pub const FAR_FUTURE: &str = "9999-12-31T23:59:59.000000Z";

/// Canonical UTC timestamp string. Fixed width, sorts lexicographically.
pub fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.format(TS_FORMAT).to_string()
}

pub fn now_ts() -> String {
    fmt_ts(&Utc::now())
}

/// Parse any RFC3339 timestamp (offset or UTC) into UTC.
pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

struct PoolInner {
    path: PathBuf,
    sem: Arc<Semaphore>,
    idle: Mutex<Vec<Connection>>,
}

/// Handle to the store; clones share one bounded connection pool.
#[derive(Clone)]
pub struct Store {
    inner: Arc<PoolInner>,
}

/// Checked-out connection. Returned to the idle set on drop.
pub struct ConnGuard {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for ConnGuard {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl DerefMut for ConnGuard {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut idle = self.pool.idle.lock().expect("idle lock poisoned");
            if idle.len() < MAX_IDLE {
                idle.push(conn);
            }
        }
    }
}

fn apply_pragmas(conn: &Connection) {
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    conn.pragma_update(None, "foreign_keys", "ON").ok();
    conn.pragma_update(None, "busy_timeout", "5000").ok();
    conn.pragma_update(None, "cache_size", "-64000").ok();
}

impl Store {
    pub fn open(path: PathBuf) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        apply_pragmas(&conn);
        init_schema(&conn)?;

        let inner = Arc::new(PoolInner {
            path,
            sem: Arc::new(Semaphore::new(MAX_OPEN)),
            idle: Mutex::new(vec![conn]),
        });
        Ok(Store { inner })
    }

    pub fn open_default() -> AppResult<Self> {
        let path = match crate::config::env_config().data_dir.clone() {
            Some(dir) => dir.join("metergate.db"),
            None => {
                let mut p = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
                p.push("metergate");
                p.push("metergate.db");
                p
            }
        };
        Self::open(path)
    }

    /// A store backed by a unique temp file; used by tests.
    pub fn open_temp() -> AppResult<Self> {
        let mut path = std::env::temp_dir();
        path.push(format!("metergate-test-{}.db", uuid::Uuid::new_v4()));
        Self::open(path)
    }

    pub fn db_path(&self) -> PathBuf {
        self.inner.path.clone()
    }

    /// Check out a connection; serializes on the pool semaphore.
    pub async fn conn(&self) -> AppResult<ConnGuard> {
        let permit = self
            .inner
            .sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::Internal("connection pool closed".to_string()))?;

        let reused = self.inner.idle.lock().expect("idle lock poisoned").pop();
        let conn = match reused {
            Some(conn) => conn,
            None => {
                let conn = Connection::open(&self.inner.path)?;
                apply_pragmas(&conn);
                conn
            }
        };

        Ok(ConnGuard {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Run a closure against a pooled connection.
    pub async fn with<R>(
        &self,
        f: impl FnOnce(&mut Connection) -> AppResult<R>,
    ) -> AppResult<R> {
        let mut guard = self.conn().await?;
        f(&mut guard)
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            is_admin INTEGER NOT NULL DEFAULT 0,
            balance_micros INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS api_keys (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            prefix TEXT NOT NULL,
            key_hash TEXT NOT NULL UNIQUE,
            revoked_at TEXT,
            last_used_at TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_api_keys_user ON api_keys(user_id);
        CREATE TABLE IF NOT EXISTS groups (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            rate_multiplier REAL NOT NULL DEFAULT 1.0
        );
        CREATE TABLE IF NOT EXISTS user_groups (
            user_id TEXT NOT NULL,
            group_id TEXT NOT NULL,
            PRIMARY KEY (user_id, group_id)
        );
        CREATE TABLE IF NOT EXISTS channel_groups (
            channel_id TEXT NOT NULL,
            group_id TEXT NOT NULL,
            PRIMARY KEY (channel_id, group_id)
        );
        CREATE TABLE IF NOT EXISTS channels (
            id TEXT PRIMARY KEY,
            channel_type TEXT NOT NULL,
            name TEXT NOT NULL,
            base_url TEXT NOT NULL,
            api_key TEXT NOT NULL DEFAULT '',
            enabled INTEGER NOT NULL DEFAULT 1,
            weight INTEGER NOT NULL DEFAULT 1,
            priority INTEGER NOT NULL DEFAULT 0,
            models TEXT NOT NULL DEFAULT '[]',
            headers TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS plans (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            enabled INTEGER NOT NULL DEFAULT 1
        );
        CREATE TABLE IF NOT EXISTS plan_limits (
            id TEXT PRIMARY KEY,
            plan_id TEXT NOT NULL,
            limit_type TEXT NOT NULL,
            window_mode TEXT NOT NULL,
            limit_micros INTEGER NOT NULL,
            UNIQUE (plan_id, limit_type)
        );
        CREATE TABLE IF NOT EXISTS subscriptions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            plan_id TEXT NOT NULL,
            starts_at TEXT NOT NULL,
            expires_at TEXT,
            status TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_subscriptions_user ON subscriptions(user_id, status);
        CREATE TABLE IF NOT EXISTS billing_settings (
            user_id TEXT PRIMARY KEY,
            primary_source TEXT NOT NULL,
            secondary_source TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS billing_events (
            id TEXT PRIMARY KEY,
            request_log_id TEXT,
            user_id TEXT NOT NULL,
            subscription_id TEXT,
            source TEXT NOT NULL,
            event_type TEXT NOT NULL,
            amount_micros INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_billing_events_idem
            ON billing_events(request_log_id, source, event_type)
            WHERE request_log_id IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_billing_events_window
            ON billing_events(subscription_id, source, created_at);
        CREATE TABLE IF NOT EXISTS request_logs (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            api_key_id TEXT NOT NULL,
            original_model TEXT NOT NULL,
            mapped_model TEXT NOT NULL,
            provider TEXT NOT NULL DEFAULT '',
            channel_id TEXT NOT NULL DEFAULT '',
            endpoint TEXT NOT NULL DEFAULT '',
            method TEXT NOT NULL DEFAULT 'POST',
            path TEXT NOT NULL DEFAULT '',
            status_code INTEGER NOT NULL DEFAULT 0,
            latency_ms INTEGER NOT NULL DEFAULT 0,
            is_streaming INTEGER NOT NULL DEFAULT 0,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            cache_read_tokens INTEGER NOT NULL DEFAULT 0,
            cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
            cost_micros INTEGER NOT NULL DEFAULT 0,
            rate_multiplier REAL NOT NULL DEFAULT 1.0,
            charged_subscription_micros INTEGER NOT NULL DEFAULT 0,
            charged_balance_micros INTEGER NOT NULL DEFAULT 0,
            billing_status TEXT NOT NULL DEFAULT 'none',
            error_type TEXT,
            upstream_request_id TEXT,
            request_detail TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_request_logs_user ON request_logs(user_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_request_logs_billing ON request_logs(billing_status);
        CREATE TABLE IF NOT EXISTS model_mappings (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            position INTEGER NOT NULL DEFAULT 0,
            pattern TEXT NOT NULL,
            replacement TEXT NOT NULL,
            is_regex INTEGER NOT NULL DEFAULT 0,
            thinking_level TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_model_mappings_user ON model_mappings(user_id, position);
        CREATE TABLE IF NOT EXISTS model_prices (
            model TEXT PRIMARY KEY,
            input_per_token REAL NOT NULL DEFAULT 0,
            output_per_token REAL NOT NULL DEFAULT 0,
            cache_read_per_token REAL NOT NULL DEFAULT 0,
            cache_creation_per_token REAL NOT NULL DEFAULT 0,
            source TEXT NOT NULL DEFAULT 'manual',
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS system_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )
}
