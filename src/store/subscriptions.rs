//! Subscription rows.
//!
//! A user holds at most one active subscription; assignment cancels any
//! prior active one inside the same transaction.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

use super::{now_ts, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Expired,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "paused" => Some(SubscriptionStatus::Paused),
            "expired" => Some(SubscriptionStatus::Expired),
            "cancelled" => Some(SubscriptionStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    pub plan_id: String,
    pub starts_at: String,
    pub expires_at: Option<String>,
    pub status: SubscriptionStatus,
}

const COLS: &str = "id, user_id, plan_id, starts_at, expires_at, status";

fn row_to_sub(row: &Row<'_>) -> rusqlite::Result<Subscription> {
    let status_raw: String = row.get(5)?;
    Ok(Subscription {
        id: row.get(0)?,
        user_id: row.get(1)?,
        plan_id: row.get(2)?,
        starts_at: row.get(3)?,
        expires_at: row.get(4)?,
        status: SubscriptionStatus::from_str(&status_raw).unwrap_or(SubscriptionStatus::Cancelled),
    })
}

/// The user's active subscription, if any, honoring `expires_at`.
pub fn active_for_user(
    conn: &Connection,
    user_id: &str,
    now_str: &str,
) -> rusqlite::Result<Option<Subscription>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM subscriptions
             WHERE user_id = ?1 AND status = 'active'
               AND (expires_at IS NULL OR expires_at > ?2)
             ORDER BY starts_at DESC LIMIT 1",
            COLS
        ),
        params![user_id, now_str],
        row_to_sub,
    )
    .optional()
}

pub fn list_for_user(conn: &Connection, user_id: &str) -> rusqlite::Result<Vec<Subscription>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM subscriptions WHERE user_id = ?1 ORDER BY starts_at DESC",
        COLS
    ))?;
    let rows = stmt.query_map(params![user_id], row_to_sub)?;
    rows.collect()
}

impl Store {
    /// Assign a plan to a user. Any prior active subscription is cancelled
    /// atomically with the insert.
    pub async fn assign_subscription(
        &self,
        user_id: &str,
        plan_id: &str,
        expires_at: Option<String>,
    ) -> AppResult<Subscription> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction()?;

        if super::plans::get(&tx, plan_id)?.is_none() {
            return Err(AppError::NotFound(format!("plan '{}' not found", plan_id)));
        }

        tx.execute(
            "UPDATE subscriptions SET status = 'cancelled' WHERE user_id = ?1 AND status = 'active'",
            params![user_id],
        )?;

        let sub = Subscription {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            plan_id: plan_id.to_string(),
            starts_at: now_ts(),
            expires_at,
            status: SubscriptionStatus::Active,
        };
        tx.execute(
            "INSERT INTO subscriptions (id, user_id, plan_id, starts_at, expires_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'active')",
            params![sub.id, sub.user_id, sub.plan_id, sub.starts_at, sub.expires_at],
        )?;
        tx.commit()?;
        Ok(sub)
    }

    pub async fn active_subscription(&self, user_id: &str) -> AppResult<Option<Subscription>> {
        let conn = self.conn().await?;
        Ok(active_for_user(&conn, user_id, &now_ts())?)
    }

    pub async fn list_subscriptions(&self, user_id: &str) -> AppResult<Vec<Subscription>> {
        let conn = self.conn().await?;
        Ok(list_for_user(&conn, user_id)?)
    }

    pub async fn set_subscription_status(
        &self,
        id: &str,
        status: SubscriptionStatus,
    ) -> AppResult<()> {
        let conn = self.conn().await?;
        if conn.execute(
            "UPDATE subscriptions SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )? == 0
        {
            return Err(AppError::NotFound(format!("subscription '{}' not found", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn assignment_cancels_prior_active() {
        let store = Store::open_temp().unwrap();
        let user = store.create_user("gail", "h", false, 0).await.unwrap();
        let basic = store.create_plan("basic", "").await.unwrap();
        let pro = store.create_plan("pro", "").await.unwrap();

        let first = store.assign_subscription(&user.id, &basic.id, None).await.unwrap();
        let second = store.assign_subscription(&user.id, &pro.id, None).await.unwrap();

        let active = store.active_subscription(&user.id).await.unwrap().unwrap();
        assert_eq!(active.id, second.id);

        let all = store.list_subscriptions(&user.id).await.unwrap();
        let old = all.iter().find(|s| s.id == first.id).unwrap();
        assert_eq!(old.status, SubscriptionStatus::Cancelled);
    }

    #[tokio::test]
    async fn expired_subscription_is_not_active() {
        let store = Store::open_temp().unwrap();
        let user = store.create_user("hank", "h", false, 0).await.unwrap();
        let plan = store.create_plan("short", "").await.unwrap();

        let past = "2020-01-01T00:00:00.000000Z".to_string();
        store
            .assign_subscription(&user.id, &plan.id, Some(past))
            .await
            .unwrap();

        assert!(store.active_subscription(&user.id).await.unwrap().is_none());
    }
}
