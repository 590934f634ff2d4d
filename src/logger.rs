//! Global logger.
//!
//! Leveled log records persisted to SQLite alongside the gateway store,
//! with async batched writes so the request path never blocks on log I/O.
//! The admin surface queries and prunes these records via `/api/logs`.

use std::path::PathBuf;
use std::sync::{mpsc, Once, RwLock};
use std::time::{Duration, Instant};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

static INIT: Once = Once::new();

#[derive(Debug, Clone)]
struct LogMessage {
    timestamp: i64,
    level: String,
    source: String,
    message: String,
}

static LOG_SENDER: RwLock<Option<mpsc::Sender<LogMessage>>> = RwLock::new(None);
static LOG_PATH: RwLock<Option<PathBuf>> = RwLock::new(None);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: i64,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct LogQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub level: Option<LogLevel>,
    pub source: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

fn open_conn() -> Option<Connection> {
    let path = LOG_PATH.read().ok()?.clone()?;
    Connection::open(path).ok()
}

/// Initialize the log table and spawn the batch writer. Safe to call more
/// than once; only the first call takes effect.
pub fn init(db_path: PathBuf) {
    INIT.call_once(|| {
        {
            let mut guard = LOG_PATH.write().expect("log path lock poisoned");
            *guard = Some(db_path);
        }

        if let Some(conn) = open_conn() {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS global_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp INTEGER NOT NULL,
                    level TEXT NOT NULL,
                    source TEXT NOT NULL,
                    message TEXT NOT NULL
                )",
                [],
            )
            .ok();
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_global_logs_timestamp ON global_logs(timestamp DESC)",
                [],
            )
            .ok();
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_global_logs_level ON global_logs(level)",
                [],
            )
            .ok();
        }

        spawn_batch_writer();
    });
}

fn spawn_batch_writer() {
    let (tx, rx) = mpsc::channel::<LogMessage>();

    {
        let mut sender = LOG_SENDER.write().expect("log sender lock poisoned");
        *sender = Some(tx);
    }

    std::thread::spawn(move || {
        let mut buffer = Vec::with_capacity(100);
        let mut last_flush = Instant::now();
        let flush_interval = Duration::from_secs(1);

        loop {
            let timeout = flush_interval
                .checked_sub(last_flush.elapsed())
                .unwrap_or(Duration::from_secs(0));

            match rx.recv_timeout(timeout) {
                Ok(msg) => {
                    buffer.push(msg);
                    if buffer.len() >= 100 || last_flush.elapsed() >= flush_interval {
                        flush_logs(&mut buffer);
                        last_flush = Instant::now();
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if !buffer.is_empty() {
                        flush_logs(&mut buffer);
                    }
                    last_flush = Instant::now();
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        if !buffer.is_empty() {
            flush_logs(&mut buffer);
        }
    });
}

fn flush_logs(buffer: &mut Vec<LogMessage>) {
    if buffer.is_empty() {
        return;
    }
    let Some(mut conn) = open_conn() else {
        buffer.clear();
        return;
    };
    let Ok(tx) = conn.transaction() else {
        buffer.clear();
        return;
    };
    for msg in buffer.drain(..) {
        let _ = tx.execute(
            "INSERT INTO global_logs (timestamp, level, source, message) VALUES (?1, ?2, ?3, ?4)",
            params![msg.timestamp, msg.level, msg.source, msg.message],
        );
    }
    let _ = tx.commit();
}

fn log_internal(level: LogLevel, source: &str, message: &str) {
    let msg = LogMessage {
        timestamp: chrono::Utc::now().timestamp(),
        level: level.as_str().to_string(),
        source: source.to_string(),
        message: message.to_string(),
    };

    let sent = LOG_SENDER
        .read()
        .ok()
        .and_then(|guard| guard.as_ref().map(|sender| sender.send(msg.clone()).is_ok()))
        .unwrap_or(false);

    if !sent {
        // Logger not initialized (tests, early startup); stderr is all we have.
        if matches!(level, LogLevel::Warn | LogLevel::Error) {
            eprintln!("[{}] {}: {}", msg.level, msg.source, msg.message);
        }
    }
}

pub fn debug(source: &str, message: &str) {
    log_internal(LogLevel::Debug, source, message);
}

pub fn info(source: &str, message: &str) {
    log_internal(LogLevel::Info, source, message);
}

pub fn warn(source: &str, message: &str) {
    log_internal(LogLevel::Warn, source, message);
}

pub fn error(source: &str, message: &str) {
    log_internal(LogLevel::Error, source, message);
}

fn push_filters(
    sql: &mut String,
    params_vec: &mut Vec<Box<dyn rusqlite::ToSql>>,
    query: &LogQuery,
) {
    if let Some(ref level) = query.level {
        sql.push_str(" AND level = ?");
        params_vec.push(Box::new(level.as_str().to_string()));
    }
    if let Some(ref source) = query.source {
        sql.push_str(" AND source = ?");
        params_vec.push(Box::new(source.clone()));
    }
    if let Some(start_time) = query.start_time {
        sql.push_str(" AND timestamp >= ?");
        params_vec.push(Box::new(start_time));
    }
    if let Some(end_time) = query.end_time {
        sql.push_str(" AND timestamp <= ?");
        params_vec.push(Box::new(end_time));
    }
}

pub fn query_logs(query: &LogQuery) -> Vec<LogEntry> {
    let Some(conn) = open_conn() else {
        return Vec::new();
    };
    let mut sql =
        String::from("SELECT id, timestamp, level, source, message FROM global_logs WHERE 1=1");
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    push_filters(&mut sql, &mut params_vec, query);

    sql.push_str(" ORDER BY timestamp DESC");
    let limit = query.limit.unwrap_or(100);
    let offset = query.offset.unwrap_or(0);
    sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));

    let Ok(mut stmt) = conn.prepare(&sql) else {
        return Vec::new();
    };
    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

    let rows = stmt.query_map(params_refs.as_slice(), |row| {
        let level_str: String = row.get(2)?;
        Ok(LogEntry {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            level: LogLevel::from_str(&level_str).unwrap_or(LogLevel::Info),
            source: row.get(3)?,
            message: row.get(4)?,
        })
    });
    match rows {
        Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
        Err(_) => Vec::new(),
    }
}

pub fn logs_count(query: &LogQuery) -> i64 {
    let Some(conn) = open_conn() else {
        return 0;
    };
    let mut sql = String::from("SELECT COUNT(*) FROM global_logs WHERE 1=1");
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    push_filters(&mut sql, &mut params_vec, query);

    let Ok(mut stmt) = conn.prepare(&sql) else {
        return 0;
    };
    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
    stmt.query_row(params_refs.as_slice(), |row| row.get(0))
        .unwrap_or(0)
}

pub fn delete_logs_before(cutoff: i64) -> Result<i64, String> {
    let Some(conn) = open_conn() else {
        return Ok(0);
    };
    conn.execute("DELETE FROM global_logs WHERE timestamp < ?1", params![cutoff])
        .map(|n| n as i64)
        .map_err(|e| e.to_string())
}

pub fn clear_all_logs() -> Result<i64, String> {
    let Some(conn) = open_conn() else {
        return Ok(0);
    };
    conn.execute("DELETE FROM global_logs", [])
        .map(|n| n as i64)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_round_trip() {
        for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            assert_eq!(LogLevel::from_str(level.as_str()), Some(level));
        }
        assert_eq!(LogLevel::from_str("nope"), None);
    }

    #[test]
    fn logging_without_init_does_not_panic() {
        debug("test", "debug line");
        info("test", "info line");
    }

    #[test]
    fn delete_logs_before_prunes_only_older_rows() {
        let mut path = std::env::temp_dir();
        path.push(format!("metergate-logs-{}.db", uuid::Uuid::new_v4()));
        init(path.clone());

        // Insert rows directly so the test does not wait on the batch
        // writer's flush interval.
        let conn = Connection::open(&path).unwrap();
        for (ts, message) in [(100, "old"), (200, "older"), (300, "recent")] {
            conn.execute(
                "INSERT INTO global_logs (timestamp, level, source, message) VALUES (?1, 'info', 'test', ?2)",
                params![ts, message],
            )
            .unwrap();
        }

        let deleted = delete_logs_before(250).unwrap();
        assert_eq!(deleted, 2);

        // Other tests in this binary may flush their own records here;
        // scope the assertions to this test's source.
        let mine = LogQuery {
            source: Some("test".to_string()),
            ..Default::default()
        };
        let remaining = query_logs(&mine);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].message, "recent");

        // Cutoff is exclusive: a row stamped exactly at the cutoff stays.
        delete_logs_before(300).unwrap();
        assert_eq!(logs_count(&mine), 1);
    }
}
