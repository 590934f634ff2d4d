//! Plan and plan-limit rows.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::quota::{LimitType, WindowMode};

use super::Store;

#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanLimit {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub plan_id: String,
    pub limit_type: LimitType,
    pub window_mode: WindowMode,
    pub limit_micros: i64,
}

fn row_to_plan(row: &Row<'_>) -> rusqlite::Result<Plan> {
    Ok(Plan {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
    })
}

fn row_to_limit(row: &Row<'_>) -> rusqlite::Result<PlanLimit> {
    let type_raw: String = row.get(2)?;
    let mode_raw: String = row.get(3)?;
    Ok(PlanLimit {
        id: row.get(0)?,
        plan_id: row.get(1)?,
        limit_type: LimitType::from_str(&type_raw).unwrap_or(LimitType::Total),
        window_mode: WindowMode::from_str(&mode_raw).unwrap_or(WindowMode::Fixed),
        limit_micros: row.get(4)?,
    })
}

pub fn get(conn: &Connection, id: &str) -> rusqlite::Result<Option<Plan>> {
    conn.query_row(
        "SELECT id, name, description, enabled FROM plans WHERE id = ?1",
        params![id],
        row_to_plan,
    )
    .optional()
}

pub fn limits_for_plan(conn: &Connection, plan_id: &str) -> rusqlite::Result<Vec<PlanLimit>> {
    let mut stmt = conn.prepare(
        "SELECT id, plan_id, limit_type, window_mode, limit_micros
         FROM plan_limits WHERE plan_id = ?1 ORDER BY limit_type",
    )?;
    let rows = stmt.query_map(params![plan_id], row_to_limit)?;
    rows.collect()
}

impl Store {
    pub async fn create_plan(&self, name: &str, description: &str) -> AppResult<Plan> {
        let plan = Plan {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            enabled: true,
        };
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO plans (id, name, description, enabled) VALUES (?1, ?2, ?3, 1)",
            params![plan.id, plan.name, plan.description],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                AppError::Conflict(format!("plan '{}' already exists", plan.name))
            }
            other => AppError::Database(other),
        })?;
        Ok(plan)
    }

    pub async fn get_plan(&self, id: &str) -> AppResult<Option<Plan>> {
        let conn = self.conn().await?;
        Ok(get(&conn, id)?)
    }

    pub async fn list_plans(&self) -> AppResult<Vec<Plan>> {
        let conn = self.conn().await?;
        let mut stmt =
            conn.prepare("SELECT id, name, description, enabled FROM plans ORDER BY name")?;
        let rows = stmt.query_map([], row_to_plan)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub async fn set_plan_enabled(&self, id: &str, enabled: bool) -> AppResult<()> {
        let conn = self.conn().await?;
        if conn.execute(
            "UPDATE plans SET enabled = ?1 WHERE id = ?2",
            params![enabled as i64, id],
        )? == 0
        {
            return Err(AppError::NotFound(format!("plan '{}' not found", id)));
        }
        Ok(())
    }

    pub async fn delete_plan(&self, id: &str) -> AppResult<()> {
        let conn = self.conn().await?;
        conn.execute("DELETE FROM plan_limits WHERE plan_id = ?1", params![id])?;
        if conn.execute("DELETE FROM plans WHERE id = ?1", params![id])? == 0 {
            return Err(AppError::NotFound(format!("plan '{}' not found", id)));
        }
        Ok(())
    }

    /// Insert or replace the limit for `(plan_id, limit_type)`; a plan holds
    /// at most one limit per type.
    pub async fn upsert_plan_limit(
        &self,
        plan_id: &str,
        limit_type: LimitType,
        window_mode: WindowMode,
        limit_micros: i64,
    ) -> AppResult<PlanLimit> {
        if limit_micros < 0 {
            return Err(AppError::BadRequest("limit_micros must be >= 0".to_string()));
        }
        let conn = self.conn().await?;
        if get(&conn, plan_id)?.is_none() {
            return Err(AppError::NotFound(format!("plan '{}' not found", plan_id)));
        }
        let limit = PlanLimit {
            id: uuid::Uuid::new_v4().to_string(),
            plan_id: plan_id.to_string(),
            limit_type,
            window_mode,
            limit_micros,
        };
        conn.execute(
            "INSERT INTO plan_limits (id, plan_id, limit_type, window_mode, limit_micros)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (plan_id, limit_type) DO UPDATE SET
                 window_mode = excluded.window_mode,
                 limit_micros = excluded.limit_micros",
            params![
                limit.id,
                limit.plan_id,
                limit.limit_type.as_str(),
                limit.window_mode.as_str(),
                limit.limit_micros
            ],
        )?;
        Ok(limit)
    }

    pub async fn plan_limits(&self, plan_id: &str) -> AppResult<Vec<PlanLimit>> {
        let conn = self.conn().await?;
        Ok(limits_for_plan(&conn, plan_id)?)
    }

    pub async fn delete_plan_limit(&self, plan_id: &str, limit_type: LimitType) -> AppResult<()> {
        let conn = self.conn().await?;
        if conn.execute(
            "DELETE FROM plan_limits WHERE plan_id = ?1 AND limit_type = ?2",
            params![plan_id, limit_type.as_str()],
        )? == 0
        {
            return Err(AppError::NotFound("plan limit not found".to_string()));
        }
        Ok(())
    }
}
