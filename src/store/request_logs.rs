//! Request-log rows: the record tying dispatch to settlement.
//!
//! A row is created before the upstream call (`billing_status='pending'`),
//! gains token and status fields at response completion, and is closed by
//! the settler.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

use super::{now_ts, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingStatus {
    None,
    Pending,
    Free,
    Settled,
    Overuse,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::None => "none",
            BillingStatus::Pending => "pending",
            BillingStatus::Free => "free",
            BillingStatus::Settled => "settled",
            BillingStatus::Overuse => "overuse",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(BillingStatus::None),
            "pending" => Some(BillingStatus::Pending),
            "free" => Some(BillingStatus::Free),
            "settled" => Some(BillingStatus::Settled),
            "overuse" => Some(BillingStatus::Overuse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestLog {
    pub id: String,
    pub user_id: String,
    pub api_key_id: String,
    pub original_model: String,
    pub mapped_model: String,
    pub provider: String,
    pub channel_id: String,
    pub endpoint: String,
    pub method: String,
    pub path: String,
    pub status_code: i64,
    pub latency_ms: i64,
    pub is_streaming: bool,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cost_micros: i64,
    pub rate_multiplier: f64,
    pub charged_subscription_micros: i64,
    pub charged_balance_micros: i64,
    pub billing_status: BillingStatus,
    pub error_type: Option<String>,
    pub upstream_request_id: Option<String>,
    pub request_detail: Option<String>,
    pub created_at: String,
}

/// Fields fixed at admission time.
pub struct NewRequestLog {
    pub user_id: String,
    pub api_key_id: String,
    pub original_model: String,
    pub mapped_model: String,
    pub provider: String,
    pub channel_id: String,
    pub endpoint: String,
    pub method: String,
    pub path: String,
    pub is_streaming: bool,
    pub rate_multiplier: f64,
    pub request_detail: Option<String>,
}

/// Fields recorded once the upstream response has completed.
#[derive(Debug, Default, Clone)]
pub struct RequestCompletion {
    pub status_code: i64,
    pub latency_ms: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub error_type: Option<String>,
    pub upstream_request_id: Option<String>,
}

const COLS: &str = "id, user_id, api_key_id, original_model, mapped_model, provider, channel_id, \
                    endpoint, method, path, status_code, latency_ms, is_streaming, input_tokens, \
                    output_tokens, cache_read_tokens, cache_creation_tokens, cost_micros, \
                    rate_multiplier, charged_subscription_micros, charged_balance_micros, \
                    billing_status, error_type, upstream_request_id, request_detail, created_at";

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<RequestLog> {
    let billing_raw: String = row.get(21)?;
    Ok(RequestLog {
        id: row.get(0)?,
        user_id: row.get(1)?,
        api_key_id: row.get(2)?,
        original_model: row.get(3)?,
        mapped_model: row.get(4)?,
        provider: row.get(5)?,
        channel_id: row.get(6)?,
        endpoint: row.get(7)?,
        method: row.get(8)?,
        path: row.get(9)?,
        status_code: row.get(10)?,
        latency_ms: row.get(11)?,
        is_streaming: row.get::<_, i64>(12)? != 0,
        input_tokens: row.get(13)?,
        output_tokens: row.get(14)?,
        cache_read_tokens: row.get(15)?,
        cache_creation_tokens: row.get(16)?,
        cost_micros: row.get(17)?,
        rate_multiplier: row.get(18)?,
        charged_subscription_micros: row.get(19)?,
        charged_balance_micros: row.get(20)?,
        billing_status: BillingStatus::from_str(&billing_raw).unwrap_or(BillingStatus::None),
        error_type: row.get(22)?,
        upstream_request_id: row.get(23)?,
        request_detail: row.get(24)?,
        created_at: row.get(25)?,
    })
}

pub fn get(conn: &Connection, id: &str) -> rusqlite::Result<Option<RequestLog>> {
    conn.query_row(
        &format!("SELECT {} FROM request_logs WHERE id = ?1", COLS),
        params![id],
        row_to_log,
    )
    .optional()
}

/// Close the billing side of a log inside the settlement transaction.
pub fn update_billing(
    conn: &Connection,
    id: &str,
    cost_micros: i64,
    charged_subscription_micros: i64,
    charged_balance_micros: i64,
    status: BillingStatus,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE request_logs SET cost_micros = ?1, charged_subscription_micros = ?2,
             charged_balance_micros = ?3, billing_status = ?4
         WHERE id = ?5",
        params![
            cost_micros,
            charged_subscription_micros,
            charged_balance_micros,
            status.as_str(),
            id
        ],
    )
}

impl Store {
    /// Persist the admission record; must succeed before the upstream call.
    pub async fn insert_request_log(&self, new: NewRequestLog) -> AppResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO request_logs
                 (id, user_id, api_key_id, original_model, mapped_model, provider, channel_id,
                  endpoint, method, path, is_streaming, rate_multiplier, billing_status,
                  request_detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 'pending', ?13, ?14)",
            params![
                id,
                new.user_id,
                new.api_key_id,
                new.original_model,
                new.mapped_model,
                new.provider,
                new.channel_id,
                new.endpoint,
                new.method,
                new.path,
                new.is_streaming as i64,
                new.rate_multiplier,
                new.request_detail,
                now_ts()
            ],
        )?;
        Ok(id)
    }

    /// Record a routing failure: a log row with no upstream side.
    pub async fn insert_routing_failure(
        &self,
        user_id: &str,
        api_key_id: &str,
        original_model: &str,
        mapped_model: &str,
        path: &str,
    ) -> AppResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO request_logs
                 (id, user_id, api_key_id, original_model, mapped_model, path, status_code,
                  billing_status, error_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 404, 'none', 'routing', ?7)",
            params![id, user_id, api_key_id, original_model, mapped_model, path, now_ts()],
        )?;
        Ok(id)
    }

    pub async fn complete_request_log(
        &self,
        id: &str,
        completion: &RequestCompletion,
    ) -> AppResult<()> {
        let conn = self.conn().await?;
        let affected = conn.execute(
            "UPDATE request_logs SET status_code = ?1, latency_ms = ?2, input_tokens = ?3,
                 output_tokens = ?4, cache_read_tokens = ?5, cache_creation_tokens = ?6,
                 error_type = ?7, upstream_request_id = ?8
             WHERE id = ?9",
            params![
                completion.status_code,
                completion.latency_ms,
                completion.input_tokens,
                completion.output_tokens,
                completion.cache_read_tokens,
                completion.cache_creation_tokens,
                completion.error_type,
                completion.upstream_request_id,
                id
            ],
        )?;
        if affected == 0 {
            return Err(AppError::NotFound(format!("request log '{}' not found", id)));
        }
        Ok(())
    }

    pub async fn get_request_log(&self, id: &str) -> AppResult<Option<RequestLog>> {
        let conn = self.conn().await?;
        Ok(get(&conn, id)?)
    }

    pub async fn list_request_logs(
        &self,
        user_id: Option<&str>,
        billing_status: Option<BillingStatus>,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<RequestLog>> {
        let conn = self.conn().await?;
        let mut sql = format!("SELECT {} FROM request_logs WHERE 1=1", COLS);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(user_id) = user_id {
            sql.push_str(" AND user_id = ?");
            params_vec.push(Box::new(user_id.to_string()));
        }
        if let Some(status) = billing_status {
            sql.push_str(" AND billing_status = ?");
            params_vec.push(Box::new(status.as_str().to_string()));
        }
        sql.push_str(" ORDER BY created_at DESC");
        sql.push_str(&format!(" LIMIT {} OFFSET {}", limit.max(0), offset.max(0)));

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), row_to_log)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_log(user: &str) -> NewRequestLog {
        NewRequestLog {
            user_id: user.to_string(),
            api_key_id: "k1".to_string(),
            original_model: "gpt-4o-latest".to_string(),
            mapped_model: "gpt-4o".to_string(),
            provider: "openai".to_string(),
            channel_id: "c1".to_string(),
            endpoint: "https://api.example.com".to_string(),
            method: "POST".to_string(),
            path: "/v1/chat/completions".to_string(),
            is_streaming: false,
            rate_multiplier: 1.0,
            request_detail: None,
        }
    }

    #[tokio::test]
    async fn admission_row_is_pending() {
        let store = Store::open_temp().unwrap();
        let id = store.insert_request_log(new_log("u1")).await.unwrap();
        let log = store.get_request_log(&id).await.unwrap().unwrap();
        assert_eq!(log.billing_status, BillingStatus::Pending);
        assert_eq!(log.status_code, 0);
        assert_eq!(log.original_model, "gpt-4o-latest");
        assert_eq!(log.mapped_model, "gpt-4o");
    }

    #[tokio::test]
    async fn completion_records_tokens_and_status() {
        let store = Store::open_temp().unwrap();
        let id = store.insert_request_log(new_log("u1")).await.unwrap();
        store
            .complete_request_log(
                &id,
                &RequestCompletion {
                    status_code: 200,
                    latency_ms: 840,
                    input_tokens: 120,
                    output_tokens: 45,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let log = store.get_request_log(&id).await.unwrap().unwrap();
        assert_eq!(log.status_code, 200);
        assert_eq!(log.latency_ms, 840);
        assert_eq!(log.input_tokens, 120);
        assert_eq!(log.output_tokens, 45);
        // Billing is untouched until the settler runs.
        assert_eq!(log.billing_status, BillingStatus::Pending);
    }

    #[tokio::test]
    async fn routing_failure_row_shape() {
        let store = Store::open_temp().unwrap();
        let id = store
            .insert_routing_failure("u1", "k1", "nope-1", "nope-1", "/v1/chat/completions")
            .await
            .unwrap();
        let log = store.get_request_log(&id).await.unwrap().unwrap();
        assert_eq!(log.status_code, 404);
        assert_eq!(log.error_type.as_deref(), Some("routing"));
        assert_eq!(log.billing_status, BillingStatus::None);
    }

    #[tokio::test]
    async fn listing_filters_by_billing_status() {
        let store = Store::open_temp().unwrap();
        store.insert_request_log(new_log("u1")).await.unwrap();
        store
            .insert_routing_failure("u1", "k1", "m", "m", "/p")
            .await
            .unwrap();
        let pending = store
            .list_request_logs(Some("u1"), Some(BillingStatus::Pending), 10, 0)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        let all = store.list_request_logs(Some("u1"), None, 10, 0).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
