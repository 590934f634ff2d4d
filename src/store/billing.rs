//! Billing settings and the append-only billing-event ledger.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

use super::{now_ts, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FundingSource {
    Subscription,
    Balance,
}

impl FundingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FundingSource::Subscription => "subscription",
            FundingSource::Balance => "balance",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "subscription" => Some(FundingSource::Subscription),
            "balance" => Some(FundingSource::Balance),
            _ => None,
        }
    }

    pub fn other(&self) -> FundingSource {
        match self {
            FundingSource::Subscription => FundingSource::Balance,
            FundingSource::Balance => FundingSource::Subscription,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingEventType {
    Charge,
    Refund,
    Adjustment,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::Charge => "charge",
            BillingEventType::Refund => "refund",
            BillingEventType::Adjustment => "adjustment",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "charge" => Some(BillingEventType::Charge),
            "refund" => Some(BillingEventType::Refund),
            "adjustment" => Some(BillingEventType::Adjustment),
            _ => None,
        }
    }
}

/// Per-user funding order. Defaults to subscription first, balance second.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingSetting {
    pub user_id: String,
    pub primary_source: FundingSource,
    pub secondary_source: FundingSource,
}

impl BillingSetting {
    pub fn default_for(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            primary_source: FundingSource::Subscription,
            secondary_source: FundingSource::Balance,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BillingEvent {
    pub id: String,
    pub request_log_id: Option<String>,
    pub user_id: String,
    pub subscription_id: Option<String>,
    pub source: FundingSource,
    pub event_type: BillingEventType,
    pub amount_micros: i64,
    pub created_at: String,
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<BillingEvent> {
    let source_raw: String = row.get(4)?;
    let type_raw: String = row.get(5)?;
    Ok(BillingEvent {
        id: row.get(0)?,
        request_log_id: row.get(1)?,
        user_id: row.get(2)?,
        subscription_id: row.get(3)?,
        source: FundingSource::from_str(&source_raw).unwrap_or(FundingSource::Balance),
        event_type: BillingEventType::from_str(&type_raw).unwrap_or(BillingEventType::Adjustment),
        amount_micros: row.get(6)?,
        created_at: row.get(7)?,
    })
}

pub fn get_setting(conn: &Connection, user_id: &str) -> rusqlite::Result<BillingSetting> {
    let found = conn
        .query_row(
            "SELECT primary_source, secondary_source FROM billing_settings WHERE user_id = ?1",
            params![user_id],
            |row| {
                let primary: String = row.get(0)?;
                let secondary: String = row.get(1)?;
                Ok((primary, secondary))
            },
        )
        .optional()?;

    Ok(match found {
        Some((primary, secondary)) => BillingSetting {
            user_id: user_id.to_string(),
            primary_source: FundingSource::from_str(&primary)
                .unwrap_or(FundingSource::Subscription),
            secondary_source: FundingSource::from_str(&secondary)
                .unwrap_or(FundingSource::Balance),
        },
        None => BillingSetting::default_for(user_id),
    })
}

/// Append a ledger event. Returns `false` when the idempotency index
/// rejected a duplicate `(request_log_id, source, event_type)`.
pub fn insert_event(conn: &Connection, event: &BillingEvent) -> rusqlite::Result<bool> {
    let result = conn.execute(
        "INSERT INTO billing_events
             (id, request_log_id, user_id, subscription_id, source, event_type, amount_micros, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.id,
            event.request_log_id,
            event.user_id,
            event.subscription_id,
            event.source.as_str(),
            event.event_type.as_str(),
            event.amount_micros,
            event.created_at
        ],
    );
    match result {
        Ok(_) => Ok(true),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// `sum(charges) - sum(refunds)` for a subscription within `[start, end)`.
pub fn subscription_used_between(
    conn: &Connection,
    subscription_id: &str,
    start: &str,
    end: &str,
) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT IFNULL(SUM(CASE event_type
                    WHEN 'charge' THEN amount_micros
                    WHEN 'refund' THEN -amount_micros
                    ELSE 0 END), 0)
         FROM billing_events
         WHERE source = 'subscription' AND subscription_id = ?1
           AND created_at >= ?2 AND created_at < ?3",
        params![subscription_id, start, end],
        |r| r.get(0),
    )
}

pub fn events_for_request_log(
    conn: &Connection,
    request_log_id: &str,
) -> rusqlite::Result<Vec<BillingEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, request_log_id, user_id, subscription_id, source, event_type, amount_micros, created_at
         FROM billing_events WHERE request_log_id = ?1 ORDER BY source, event_type",
    )?;
    let rows = stmt.query_map(params![request_log_id], row_to_event)?;
    rows.collect()
}

impl Store {
    pub async fn billing_setting(&self, user_id: &str) -> AppResult<BillingSetting> {
        let conn = self.conn().await?;
        Ok(get_setting(&conn, user_id)?)
    }

    pub async fn put_billing_setting(
        &self,
        user_id: &str,
        primary: FundingSource,
    ) -> AppResult<BillingSetting> {
        let setting = BillingSetting {
            user_id: user_id.to_string(),
            primary_source: primary,
            secondary_source: primary.other(),
        };
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO billing_settings (user_id, primary_source, secondary_source)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (user_id) DO UPDATE SET
                 primary_source = excluded.primary_source,
                 secondary_source = excluded.secondary_source",
            params![
                setting.user_id,
                setting.primary_source.as_str(),
                setting.secondary_source.as_str()
            ],
        )?;
        Ok(setting)
    }

    pub async fn billing_events_for_log(&self, request_log_id: &str) -> AppResult<Vec<BillingEvent>> {
        let conn = self.conn().await?;
        Ok(events_for_request_log(&conn, request_log_id)?)
    }

    /// Manual ledger adjustment from the admin surface; also moves the
    /// balance when the source is `balance`.
    pub async fn record_adjustment(
        &self,
        user_id: &str,
        source: FundingSource,
        subscription_id: Option<String>,
        amount_micros: i64,
    ) -> AppResult<BillingEvent> {
        let event = BillingEvent {
            id: uuid::Uuid::new_v4().to_string(),
            request_log_id: None,
            user_id: user_id.to_string(),
            subscription_id,
            source,
            event_type: BillingEventType::Adjustment,
            amount_micros: amount_micros.abs(),
            created_at: now_ts(),
        };
        let mut conn = self.conn().await?;
        let tx = conn.transaction()?;
        insert_event(&tx, &event)?;
        if source == FundingSource::Balance {
            super::users::adjust_balance(&tx, user_id, amount_micros)?;
        }
        tx.commit()?;
        Ok(event)
    }
}
