//! User rows and balance arithmetic.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::{AppError, AppResult};

use super::{now_ts, Store};

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_admin: bool,
    pub balance_micros: i64,
    pub created_at: String,
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        is_admin: row.get::<_, i64>(3)? != 0,
        balance_micros: row.get(4)?,
        created_at: row.get(5)?,
    })
}

const COLS: &str = "id, username, password_hash, is_admin, balance_micros, created_at";

pub fn insert(conn: &Connection, user: &User) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO users (id, username, password_hash, is_admin, balance_micros, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            user.id,
            user.username,
            user.password_hash,
            user.is_admin as i64,
            user.balance_micros,
            user.created_at
        ],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, id: &str) -> rusqlite::Result<Option<User>> {
    conn.query_row(
        &format!("SELECT {} FROM users WHERE id = ?1", COLS),
        params![id],
        row_to_user,
    )
    .optional()
}

pub fn get_by_username(conn: &Connection, username: &str) -> rusqlite::Result<Option<User>> {
    conn.query_row(
        &format!("SELECT {} FROM users WHERE username = ?1", COLS),
        params![username],
        row_to_user,
    )
    .optional()
}

pub fn list(conn: &Connection) -> rusqlite::Result<Vec<User>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM users ORDER BY username", COLS))?;
    let rows = stmt.query_map([], row_to_user)?;
    rows.collect()
}

/// Read `balance_micros` inside a settlement transaction.
pub fn balance(conn: &Connection, id: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT balance_micros FROM users WHERE id = ?1",
        params![id],
        |r| r.get(0),
    )
    .optional()
}

/// Adjust the balance by a signed delta. Negative balances are allowed; the
/// overuse fallback relies on that.
pub fn adjust_balance(conn: &Connection, id: &str, delta_micros: i64) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE users SET balance_micros = balance_micros + ?1 WHERE id = ?2",
        params![delta_micros, id],
    )
}

pub fn delete(conn: &Connection, id: &str) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM users WHERE id = ?1", params![id])
}

impl Store {
    pub async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        is_admin: bool,
        balance_micros: i64,
    ) -> AppResult<User> {
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            is_admin,
            balance_micros,
            created_at: now_ts(),
        };
        let conn = self.conn().await?;
        insert(&conn, &user).map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                AppError::Conflict(format!("username '{}' already exists", user.username))
            }
            other => AppError::Database(other),
        })?;
        Ok(user)
    }

    pub async fn get_user(&self, id: &str) -> AppResult<Option<User>> {
        let conn = self.conn().await?;
        Ok(get(&conn, id)?)
    }

    pub async fn get_user_by_username(&self, username: &str) -> AppResult<Option<User>> {
        let conn = self.conn().await?;
        Ok(get_by_username(&conn, username)?)
    }

    pub async fn list_users(&self) -> AppResult<Vec<User>> {
        let conn = self.conn().await?;
        Ok(list(&conn)?)
    }

    pub async fn adjust_user_balance(&self, id: &str, delta_micros: i64) -> AppResult<()> {
        let conn = self.conn().await?;
        if adjust_balance(&conn, id, delta_micros)? == 0 {
            return Err(AppError::NotFound(format!("user '{}' not found", id)));
        }
        Ok(())
    }

    pub async fn delete_user(&self, id: &str) -> AppResult<()> {
        let conn = self.conn().await?;
        if delete(&conn, id)? == 0 {
            return Err(AppError::NotFound(format!("user '{}' not found", id)));
        }
        Ok(())
    }

    /// Seed the admin account from the environment on first start.
    pub async fn ensure_admin_user(&self, username: &str, password: &str) -> AppResult<()> {
        let conn = self.conn().await?;
        if get_by_username(&conn, username)?.is_some() {
            return Ok(());
        }
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            password_hash: crate::crypto::sha256_hex(password),
            is_admin: true,
            balance_micros: 0,
            created_at: now_ts(),
        };
        insert(&conn, &user)?;
        crate::logger::info("store", &format!("Seeded admin user '{}'", username));
        Ok(())
    }
}
