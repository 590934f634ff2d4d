//! Channel rows: configured routes to upstream provider accounts.
//!
//! The upstream API key is AES-GCM-wrapped on write and unwrapped on read
//! when `DATA_ENCRYPTION_KEY` is configured.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::{AppError, AppResult};
use crate::forward::context::Provider;

use super::{now_ts, Store};

/// One entry of a channel's declared model list. A plain string declares a
/// name; the object form adds an alias.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelMatcher {
    Name(String),
    Aliased { name: String, alias: Option<String> },
}

impl ModelMatcher {
    pub fn name(&self) -> &str {
        match self {
            ModelMatcher::Name(name) => name,
            ModelMatcher::Aliased { name, .. } => name,
        }
    }

    pub fn alias(&self) -> Option<&str> {
        match self {
            ModelMatcher::Name(_) => None,
            ModelMatcher::Aliased { alias, .. } => alias.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Channel {
    pub id: String,
    pub channel_type: Provider,
    pub name: String,
    pub base_url: String,
    /// Decrypted upstream API key.
    #[serde(skip_serializing)]
    pub api_key: String,
    pub enabled: bool,
    pub weight: i64,
    pub priority: i64,
    pub models: Vec<ModelMatcher>,
    pub headers: HashMap<String, String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelInput {
    #[serde(alias = "type")]
    pub channel_type: Provider,
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_weight")]
    pub weight: i64,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub models: Vec<ModelMatcher>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

fn default_weight() -> i64 {
    1
}

const COLS: &str =
    "id, channel_type, name, base_url, api_key, enabled, weight, priority, models, headers, created_at";

fn row_to_channel(row: &Row<'_>) -> rusqlite::Result<Channel> {
    let type_raw: String = row.get(1)?;
    let models_raw: String = row.get(8)?;
    let headers_raw: String = row.get(9)?;
    let stored_key: String = row.get(4)?;
    Ok(Channel {
        id: row.get(0)?,
        channel_type: Provider::from_str(&type_raw).unwrap_or(Provider::OpenAI),
        name: row.get(2)?,
        base_url: row.get(3)?,
        api_key: crypto::open_secret(&stored_key),
        enabled: row.get::<_, i64>(5)? != 0,
        weight: row.get(6)?,
        priority: row.get(7)?,
        models: serde_json::from_str(&models_raw).unwrap_or_default(),
        headers: serde_json::from_str(&headers_raw).unwrap_or_default(),
        created_at: row.get(10)?,
    })
}

/// Enabled channels ordered by id, for deterministic round-robin ties.
pub fn list_enabled(conn: &Connection) -> rusqlite::Result<Vec<Channel>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM channels WHERE enabled = 1 ORDER BY id",
        COLS
    ))?;
    let rows = stmt.query_map([], row_to_channel)?;
    rows.collect()
}

pub fn list_all(conn: &Connection) -> rusqlite::Result<Vec<Channel>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM channels ORDER BY id", COLS))?;
    let rows = stmt.query_map([], row_to_channel)?;
    rows.collect()
}

pub fn get(conn: &Connection, id: &str) -> rusqlite::Result<Option<Channel>> {
    conn.query_row(
        &format!("SELECT {} FROM channels WHERE id = ?1", COLS),
        params![id],
        row_to_channel,
    )
    .optional()
}

impl Store {
    pub async fn create_channel(&self, input: ChannelInput) -> AppResult<Channel> {
        self.create_channel_with_id(uuid::Uuid::new_v4().to_string(), input)
            .await
    }

    /// Explicit-id variant; the admin API allows operator-chosen ids so
    /// round-robin tie order is controllable.
    pub async fn create_channel_with_id(
        &self,
        id: String,
        input: ChannelInput,
    ) -> AppResult<Channel> {
        if input.weight < 1 {
            return Err(AppError::BadRequest("weight must be >= 1".to_string()));
        }
        let channel = Channel {
            id,
            channel_type: input.channel_type,
            name: input.name,
            base_url: input.base_url.trim_end_matches('/').to_string(),
            api_key: input.api_key,
            enabled: input.enabled,
            weight: input.weight,
            priority: input.priority,
            models: input.models,
            headers: input.headers,
            created_at: now_ts(),
        };
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO channels (id, channel_type, name, base_url, api_key, enabled, weight, priority, models, headers, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                channel.id,
                channel.channel_type.as_str(),
                channel.name,
                channel.base_url,
                crypto::seal_secret(&channel.api_key),
                channel.enabled as i64,
                channel.weight,
                channel.priority,
                serde_json::to_string(&channel.models).unwrap_or_else(|_| "[]".to_string()),
                serde_json::to_string(&channel.headers).unwrap_or_else(|_| "{}".to_string()),
                channel.created_at
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                AppError::Conflict(format!("channel '{}' already exists", channel.id))
            }
            other => AppError::Database(other),
        })?;
        Ok(channel)
    }

    pub async fn update_channel(&self, id: &str, input: ChannelInput) -> AppResult<Channel> {
        if input.weight < 1 {
            return Err(AppError::BadRequest("weight must be >= 1".to_string()));
        }
        let conn = self.conn().await?;
        let affected = conn.execute(
            "UPDATE channels SET channel_type = ?1, name = ?2, base_url = ?3, api_key = ?4,
                 enabled = ?5, weight = ?6, priority = ?7, models = ?8, headers = ?9
             WHERE id = ?10",
            params![
                input.channel_type.as_str(),
                input.name,
                input.base_url.trim_end_matches('/'),
                crypto::seal_secret(&input.api_key),
                input.enabled as i64,
                input.weight,
                input.priority,
                serde_json::to_string(&input.models).unwrap_or_else(|_| "[]".to_string()),
                serde_json::to_string(&input.headers).unwrap_or_else(|_| "{}".to_string()),
                id
            ],
        )?;
        if affected == 0 {
            return Err(AppError::NotFound(format!("channel '{}' not found", id)));
        }
        get(&conn, id)?.ok_or_else(|| AppError::NotFound(format!("channel '{}' not found", id)))
    }

    pub async fn get_channel(&self, id: &str) -> AppResult<Option<Channel>> {
        let conn = self.conn().await?;
        Ok(get(&conn, id)?)
    }

    pub async fn list_channels(&self) -> AppResult<Vec<Channel>> {
        let conn = self.conn().await?;
        Ok(list_all(&conn)?)
    }

    pub async fn list_enabled_channels(&self) -> AppResult<Vec<Channel>> {
        let conn = self.conn().await?;
        Ok(list_enabled(&conn)?)
    }

    pub async fn delete_channel(&self, id: &str) -> AppResult<()> {
        let conn = self.conn().await?;
        conn.execute("DELETE FROM channel_groups WHERE channel_id = ?1", params![id])?;
        if conn.execute("DELETE FROM channels WHERE id = ?1", params![id])? == 0 {
            return Err(AppError::NotFound(format!("channel '{}' not found", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str) -> ChannelInput {
        ChannelInput {
            channel_type: Provider::OpenAI,
            name: name.to_string(),
            base_url: "https://api.example.com/".to_string(),
            api_key: "sk-test".to_string(),
            enabled: true,
            weight: 1,
            priority: 10,
            models: vec![ModelMatcher::Name("gpt-4o".to_string())],
            headers: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn create_normalizes_base_url() {
        let store = Store::open_temp().unwrap();
        let ch = store.create_channel(input("main")).await.unwrap();
        assert_eq!(ch.base_url, "https://api.example.com");
        let fetched = store.get_channel(&ch.id).await.unwrap().unwrap();
        assert_eq!(fetched.api_key, "sk-test");
        assert_eq!(fetched.models.len(), 1);
        assert_eq!(fetched.models[0].name(), "gpt-4o");
    }

    #[tokio::test]
    async fn matcher_accepts_plain_and_aliased_forms() {
        let parsed: Vec<ModelMatcher> =
            serde_json::from_str(r#"["gpt-4o", {"name": "gpt-4o-mini", "alias": "mini"}]"#).unwrap();
        assert_eq!(parsed[0].name(), "gpt-4o");
        assert_eq!(parsed[1].alias(), Some("mini"));
    }

    #[tokio::test]
    async fn disabled_channels_hidden_from_selection_listing() {
        let store = Store::open_temp().unwrap();
        let mut disabled = input("off");
        disabled.enabled = false;
        store.create_channel(disabled).await.unwrap();
        store.create_channel(input("on")).await.unwrap();
        let enabled = store.list_enabled_channels().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "on");
    }
}
