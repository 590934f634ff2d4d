//! Group rows and rate-multiplier lookup.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::{AppError, AppResult};

use super::Store;

#[derive(Debug, Clone, Serialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub rate_multiplier: f64,
}

fn row_to_group(row: &Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        name: row.get(1)?,
        rate_multiplier: row.get(2)?,
    })
}

pub fn list(conn: &Connection) -> rusqlite::Result<Vec<Group>> {
    let mut stmt = conn.prepare("SELECT id, name, rate_multiplier FROM groups ORDER BY name")?;
    let rows = stmt.query_map([], row_to_group)?;
    rows.collect()
}

/// Effective rate multiplier for a user: the minimum across all groups the
/// user belongs to, 1.0 when the user has no groups.
pub fn user_rate_multiplier(conn: &Connection, user_id: &str) -> rusqlite::Result<f64> {
    let min: Option<f64> = conn
        .query_row(
            "SELECT MIN(g.rate_multiplier)
             FROM groups g JOIN user_groups ug ON ug.group_id = g.id
             WHERE ug.user_id = ?1",
            params![user_id],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    Ok(min.unwrap_or(1.0))
}

impl Store {
    pub async fn create_group(&self, name: &str, rate_multiplier: f64) -> AppResult<Group> {
        if rate_multiplier < 0.0 {
            return Err(AppError::BadRequest("rate_multiplier must be >= 0".to_string()));
        }
        let group = Group {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            rate_multiplier,
        };
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO groups (id, name, rate_multiplier) VALUES (?1, ?2, ?3)",
            params![group.id, group.name, group.rate_multiplier],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                AppError::Conflict(format!("group '{}' already exists", group.name))
            }
            other => AppError::Database(other),
        })?;
        Ok(group)
    }

    pub async fn list_groups(&self) -> AppResult<Vec<Group>> {
        let conn = self.conn().await?;
        Ok(list(&conn)?)
    }

    pub async fn delete_group(&self, id: &str) -> AppResult<()> {
        let conn = self.conn().await?;
        conn.execute("DELETE FROM user_groups WHERE group_id = ?1", params![id])?;
        conn.execute("DELETE FROM channel_groups WHERE group_id = ?1", params![id])?;
        if conn.execute("DELETE FROM groups WHERE id = ?1", params![id])? == 0 {
            return Err(AppError::NotFound(format!("group '{}' not found", id)));
        }
        Ok(())
    }

    pub async fn add_user_to_group(&self, user_id: &str, group_id: &str) -> AppResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT OR IGNORE INTO user_groups (user_id, group_id) VALUES (?1, ?2)",
            params![user_id, group_id],
        )?;
        Ok(())
    }

    pub async fn remove_user_from_group(&self, user_id: &str, group_id: &str) -> AppResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "DELETE FROM user_groups WHERE user_id = ?1 AND group_id = ?2",
            params![user_id, group_id],
        )?;
        Ok(())
    }

    pub async fn user_rate_multiplier(&self, user_id: &str) -> AppResult<f64> {
        let conn = self.conn().await?;
        Ok(user_rate_multiplier(&conn, user_id)?)
    }
}
