//! Per-user model-mapping rows.
//!
//! Ordered list, first match wins; a pattern is exact or a regex.

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

use super::Store;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMapping {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub position: i64,
    pub pattern: String,
    pub replacement: String,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(default)]
    pub thinking_level: Option<String>,
}

fn row_to_mapping(row: &Row<'_>) -> rusqlite::Result<ModelMapping> {
    Ok(ModelMapping {
        id: row.get(0)?,
        user_id: row.get(1)?,
        position: row.get(2)?,
        pattern: row.get(3)?,
        replacement: row.get(4)?,
        is_regex: row.get::<_, i64>(5)? != 0,
        thinking_level: row.get(6)?,
    })
}

pub fn list_for_user(conn: &Connection, user_id: &str) -> rusqlite::Result<Vec<ModelMapping>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, position, pattern, replacement, is_regex, thinking_level
         FROM model_mappings WHERE user_id = ?1 ORDER BY position, id",
    )?;
    let rows = stmt.query_map(params![user_id], row_to_mapping)?;
    rows.collect()
}

impl Store {
    /// Replace the user's full mapping list in order.
    pub async fn put_model_mappings(
        &self,
        user_id: &str,
        mappings: Vec<ModelMapping>,
    ) -> AppResult<Vec<ModelMapping>> {
        for mapping in &mappings {
            if mapping.is_regex {
                regex::Regex::new(&mapping.pattern).map_err(|e| {
                    AppError::BadRequest(format!("invalid regex '{}': {}", mapping.pattern, e))
                })?;
            }
        }

        let mut conn = self.conn().await?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM model_mappings WHERE user_id = ?1", params![user_id])?;
        let mut stored = Vec::with_capacity(mappings.len());
        for (position, mapping) in mappings.into_iter().enumerate() {
            let row = ModelMapping {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                position: position as i64,
                ..mapping
            };
            tx.execute(
                "INSERT INTO model_mappings
                     (id, user_id, position, pattern, replacement, is_regex, thinking_level)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.id,
                    row.user_id,
                    row.position,
                    row.pattern,
                    row.replacement,
                    row.is_regex as i64,
                    row.thinking_level
                ],
            )?;
            stored.push(row);
        }
        tx.commit()?;
        Ok(stored)
    }

    pub async fn model_mappings(&self, user_id: &str) -> AppResult<Vec<ModelMapping>> {
        let conn = self.conn().await?;
        Ok(list_for_user(&conn, user_id)?)
    }
}
