//! `system_config` key-value rows backing hot-reloadable settings.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::AppResult;

use super::{now_ts, Store};

#[derive(Debug, Clone, Serialize)]
pub struct SystemConfigEntry {
    pub key: String,
    pub value: String,
    pub updated_at: String,
}

pub fn get(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM system_config WHERE key = ?1",
        params![key],
        |r| r.get(0),
    )
    .optional()
}

pub fn set(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO system_config (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, now_ts()],
    )?;
    Ok(())
}

impl Store {
    pub async fn system_config_get(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.conn().await?;
        Ok(get(&conn, key)?)
    }

    pub async fn system_config_set(&self, key: &str, value: &str) -> AppResult<()> {
        let conn = self.conn().await?;
        Ok(set(&conn, key, value)?)
    }

    pub async fn system_config_all(&self) -> AppResult<Vec<SystemConfigEntry>> {
        let conn = self.conn().await?;
        let mut stmt =
            conn.prepare("SELECT key, value, updated_at FROM system_config ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok(SystemConfigEntry {
                key: row.get(0)?,
                value: row.get(1)?,
                updated_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}
