//! API key rows.
//!
//! Only the SHA-256 fingerprint of a raw key is stored; the raw key is
//! returned exactly once at creation.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::crypto;
use crate::error::{AppError, AppResult};

use super::{now_ts, Store};

#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub prefix: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub revoked_at: Option<String>,
    pub last_used_at: Option<String>,
    pub created_at: String,
}

const COLS: &str = "id, user_id, name, prefix, key_hash, revoked_at, last_used_at, created_at";

fn row_to_key(row: &Row<'_>) -> rusqlite::Result<ApiKey> {
    Ok(ApiKey {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        prefix: row.get(3)?,
        key_hash: row.get(4)?,
        revoked_at: row.get(5)?,
        last_used_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

pub fn get_by_hash(conn: &Connection, key_hash: &str) -> rusqlite::Result<Option<ApiKey>> {
    conn.query_row(
        &format!("SELECT {} FROM api_keys WHERE key_hash = ?1", COLS),
        params![key_hash],
        row_to_key,
    )
    .optional()
}

pub fn list_by_user(conn: &Connection, user_id: &str) -> rusqlite::Result<Vec<ApiKey>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM api_keys WHERE user_id = ?1 ORDER BY created_at DESC",
        COLS
    ))?;
    let rows = stmt.query_map(params![user_id], row_to_key)?;
    rows.collect()
}

impl Store {
    /// Create a key for a user; the returned raw key is never stored.
    pub async fn create_api_key(&self, user_id: &str, name: &str) -> AppResult<(ApiKey, String)> {
        let (raw, prefix, hash) = crypto::generate_api_key();
        let key = ApiKey {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            prefix,
            key_hash: hash,
            revoked_at: None,
            last_used_at: None,
            created_at: now_ts(),
        };
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO api_keys (id, user_id, name, prefix, key_hash, revoked_at, last_used_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, ?6)",
            params![key.id, key.user_id, key.name, key.prefix, key.key_hash, key.created_at],
        )?;
        Ok((key, raw))
    }

    /// Look up a key by the SHA-256 of the presented raw key.
    pub async fn api_key_by_hash(&self, key_hash: &str) -> AppResult<Option<ApiKey>> {
        let conn = self.conn().await?;
        Ok(get_by_hash(&conn, key_hash)?)
    }

    pub async fn list_api_keys(&self, user_id: &str) -> AppResult<Vec<ApiKey>> {
        let conn = self.conn().await?;
        Ok(list_by_user(&conn, user_id)?)
    }

    pub async fn revoke_api_key(&self, id: &str) -> AppResult<()> {
        let conn = self.conn().await?;
        let affected = conn.execute(
            "UPDATE api_keys SET revoked_at = ?1 WHERE id = ?2 AND revoked_at IS NULL",
            params![now_ts(), id],
        )?;
        if affected == 0 {
            return Err(AppError::NotFound(format!("api key '{}' not found or already revoked", id)));
        }
        Ok(())
    }

    /// Fire-and-forget update of `last_used_at`; callers spawn this off the
    /// request path.
    pub async fn touch_api_key(&self, id: &str) -> AppResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
            params![now_ts(), id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stored_fingerprint_matches_raw() {
        let store = Store::open_temp().unwrap();
        let user = store.create_user("dave", "h", false, 0).await.unwrap();
        let (key, raw) = store.create_api_key(&user.id, "dev").await.unwrap();

        assert_eq!(key.key_hash, crypto::sha256_hex(&raw));
        assert_eq!(key.prefix, raw.chars().take(8).collect::<String>());

        let found = store.api_key_by_hash(&key.key_hash).await.unwrap().unwrap();
        assert_eq!(found.id, key.id);
    }

    #[tokio::test]
    async fn revoke_is_one_shot() {
        let store = Store::open_temp().unwrap();
        let user = store.create_user("erin", "h", false, 0).await.unwrap();
        let (key, _) = store.create_api_key(&user.id, "ci").await.unwrap();

        store.revoke_api_key(&key.id).await.unwrap();
        let again = store.revoke_api_key(&key.id).await;
        assert!(again.is_err());

        let found = store.api_key_by_hash(&key.key_hash).await.unwrap().unwrap();
        assert!(found.revoked_at.is_some());
    }
}
