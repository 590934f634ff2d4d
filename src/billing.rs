//! Billing settler.
//!
//! Charges a completed request's cost against the user's funding sources in
//! their configured order, inside a single store transaction. The unique
//! `(request_log_id, source, event_type)` index makes retries idempotent:
//! a duplicate insert aborts the attempt and the previously settled split
//! is returned instead.

use chrono::Utc;
use rusqlite::TransactionBehavior;

use crate::error::{AppError, AppResult};
use crate::quota;
use crate::store::billing::{insert_event, BillingEvent, BillingEventType, FundingSource};
use crate::store::request_logs::{self, BillingStatus};
use crate::store::{self, subscriptions, users, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementOutcome {
    pub billing_status: BillingStatus,
    pub charged_subscription_micros: i64,
    pub charged_balance_micros: i64,
}

/// Settle `cost_micros` for a request log. Zero cost marks the log `free`.
pub async fn settle(
    store: &Store,
    request_log_id: &str,
    user_id: &str,
    cost_micros: i64,
) -> AppResult<SettlementOutcome> {
    if cost_micros <= 0 {
        let outcome = SettlementOutcome {
            billing_status: BillingStatus::Free,
            charged_subscription_micros: 0,
            charged_balance_micros: 0,
        };
        let conn = store.conn().await?;
        request_logs::update_billing(&conn, request_log_id, 0, 0, 0, BillingStatus::Free)?;
        return Ok(outcome);
    }

    let mut conn = store.conn().await?;
    match settle_tx(&mut conn, request_log_id, user_id, cost_micros)? {
        SettleTxOutcome::Settled(outcome) => Ok(outcome),
        SettleTxOutcome::Duplicate => {
            drop(conn);
            already_settled(store, request_log_id).await
        }
    }
}

/// Result of the transaction-scoped settlement attempt.
enum SettleTxOutcome {
    Settled(SettlementOutcome),
    /// The idempotency index rejected a duplicate insert; the caller should
    /// look up the previously settled split.
    Duplicate,
}

/// Run the settlement transaction synchronously, entirely outside of any
/// `.await` point, so the non-`Send` `rusqlite::Transaction` never has to be
/// held across a suspend point in the calling future.
fn settle_tx(
    conn: &mut rusqlite::Connection,
    request_log_id: &str,
    user_id: &str,
    cost_micros: i64,
) -> AppResult<SettleTxOutcome> {
    // Immediate mode takes the write lock up front so the quota read, the
    // balance read, and the updates see one point-in-time state.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let setting = store::billing::get_setting(&tx, user_id)?;
    let now = Utc::now();
    let sub = subscriptions::active_for_user(&tx, user_id, &store::fmt_ts(&now))?;
    let sub_remaining = match &sub {
        Some(sub) => quota::subscription_remaining(&tx, sub, now)?,
        None => 0,
    };
    let balance = users::balance(&tx, user_id)?
        .ok_or_else(|| AppError::NotFound(format!("user '{}' not found", user_id)))?;

    // Greedy consume primary then secondary.
    let mut remaining_cost = cost_micros;
    let mut sub_charge = 0i64;
    let mut balance_charge = 0i64;
    for source in [setting.primary_source, setting.secondary_source] {
        if remaining_cost == 0 {
            break;
        }
        match source {
            FundingSource::Subscription => {
                if sub.is_some() {
                    let take = remaining_cost.min(sub_remaining.max(0));
                    sub_charge += take;
                    remaining_cost -= take;
                }
            }
            FundingSource::Balance => {
                let take = remaining_cost.min(balance.max(0));
                balance_charge += take;
                remaining_cost -= take;
            }
        }
    }

    // Overuse fallback: the residual lands on the subscription when one
    // exists, otherwise on the balance, even if that drives it negative.
    let overuse = remaining_cost > 0;
    if overuse {
        if sub.is_some() {
            sub_charge += remaining_cost;
        } else {
            balance_charge += remaining_cost;
        }
    }

    let created_at = store::fmt_ts(&now);
    if sub_charge > 0 {
        let inserted = insert_event(
            &tx,
            &BillingEvent {
                id: uuid::Uuid::new_v4().to_string(),
                request_log_id: Some(request_log_id.to_string()),
                user_id: user_id.to_string(),
                subscription_id: sub.as_ref().map(|s| s.id.clone()),
                source: FundingSource::Subscription,
                event_type: BillingEventType::Charge,
                amount_micros: sub_charge,
                created_at: created_at.clone(),
            },
        )?;
        if !inserted {
            return Ok(SettleTxOutcome::Duplicate);
        }
    }
    if balance_charge > 0 {
        let inserted = insert_event(
            &tx,
            &BillingEvent {
                id: uuid::Uuid::new_v4().to_string(),
                request_log_id: Some(request_log_id.to_string()),
                user_id: user_id.to_string(),
                subscription_id: None,
                source: FundingSource::Balance,
                event_type: BillingEventType::Charge,
                amount_micros: balance_charge,
                created_at,
            },
        )?;
        if !inserted {
            return Ok(SettleTxOutcome::Duplicate);
        }
        users::adjust_balance(&tx, user_id, -balance_charge)?;
    }

    let status = if overuse {
        BillingStatus::Overuse
    } else {
        BillingStatus::Settled
    };
    request_logs::update_billing(
        &tx,
        request_log_id,
        cost_micros,
        sub_charge,
        balance_charge,
        status,
    )?;
    tx.commit()?;

    crate::logger::info(
        "billing",
        &format!(
            "Settled request {}: cost={} sub={} balance={} status={}",
            request_log_id,
            cost_micros,
            sub_charge,
            balance_charge,
            status.as_str()
        ),
    );

    Ok(SettleTxOutcome::Settled(SettlementOutcome {
        billing_status: status,
        charged_subscription_micros: sub_charge,
        charged_balance_micros: balance_charge,
    }))
}

/// A duplicate billing event means a prior settlement won; surface its split.
async fn already_settled(store: &Store, request_log_id: &str) -> AppResult<SettlementOutcome> {
    let log = store
        .get_request_log(request_log_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("request log '{}' not found", request_log_id)))?;
    Ok(SettlementOutcome {
        billing_status: log.billing_status,
        charged_subscription_micros: log.charged_subscription_micros,
        charged_balance_micros: log.charged_balance_micros,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{LimitType, WindowMode};
    use crate::store::request_logs::NewRequestLog;

    fn new_log(user_id: &str) -> NewRequestLog {
        NewRequestLog {
            user_id: user_id.to_string(),
            api_key_id: "k1".to_string(),
            original_model: "gpt-4o".to_string(),
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

    async fn user_with_daily_window(
        store: &Store,
        balance: i64,
        window_micros: i64,
    ) -> (String, String) {
        let user = store.create_user("settle-user", "h", false, balance).await.unwrap();
        let plan = store.create_plan("plan", "").await.unwrap();
        store
            .upsert_plan_limit(&plan.id, LimitType::Daily, WindowMode::Fixed, window_micros)
            .await
            .unwrap();
        let sub = store.assign_subscription(&user.id, &plan.id, None).await.unwrap();
        (user.id, sub.id)
    }

    #[tokio::test]
    async fn zero_cost_marks_free() {
        let store = Store::open_temp().unwrap();
        let user = store.create_user("free-user", "h", false, 0).await.unwrap();
        let log_id = store.insert_request_log(new_log(&user.id)).await.unwrap();

        let outcome = settle(&store, &log_id, &user.id, 0).await.unwrap();
        assert_eq!(outcome.billing_status, BillingStatus::Free);
        let log = store.get_request_log(&log_id).await.unwrap().unwrap();
        assert_eq!(log.billing_status, BillingStatus::Free);
        assert!(store.billing_events_for_log(&log_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn split_across_subscription_then_balance() {
        let store = Store::open_temp().unwrap();
        let (user_id, _sub) = user_with_daily_window(&store, 1_000_000, 300).await;
        let log_id = store.insert_request_log(new_log(&user_id)).await.unwrap();

        let outcome = settle(&store, &log_id, &user_id, 1_000).await.unwrap();
        assert_eq!(outcome.billing_status, BillingStatus::Settled);
        assert_eq!(outcome.charged_subscription_micros, 300);
        assert_eq!(outcome.charged_balance_micros, 700);

        let user = store.get_user(&user_id).await.unwrap().unwrap();
        assert_eq!(user.balance_micros, 1_000_000 - 700);

        // Conservation: events sum to the log's split.
        let log = store.get_request_log(&log_id).await.unwrap().unwrap();
        assert_eq!(
            log.charged_subscription_micros + log.charged_balance_micros,
            log.cost_micros
        );
        let events = store.billing_events_for_log(&log_id).await.unwrap();
        let total: i64 = events.iter().map(|e| e.amount_micros).sum();
        assert_eq!(total, 1_000);
    }

    #[tokio::test]
    async fn overuse_residual_lands_on_subscription() {
        let store = Store::open_temp().unwrap();
        let (user_id, _sub) = user_with_daily_window(&store, 0, 0).await;
        let log_id = store.insert_request_log(new_log(&user_id)).await.unwrap();

        let outcome = settle(&store, &log_id, &user_id, 500).await.unwrap();
        assert_eq!(outcome.billing_status, BillingStatus::Overuse);
        assert_eq!(outcome.charged_subscription_micros, 500);
        assert_eq!(outcome.charged_balance_micros, 0);
    }

    #[tokio::test]
    async fn overuse_without_subscription_drives_balance_negative() {
        let store = Store::open_temp().unwrap();
        let user = store.create_user("broke", "h", false, 0).await.unwrap();
        let log_id = store.insert_request_log(new_log(&user.id)).await.unwrap();

        let outcome = settle(&store, &log_id, &user.id, 500).await.unwrap();
        assert_eq!(outcome.billing_status, BillingStatus::Overuse);
        assert_eq!(outcome.charged_balance_micros, 500);

        let user = store.get_user(&user.id).await.unwrap().unwrap();
        assert_eq!(user.balance_micros, -500);
    }

    #[tokio::test]
    async fn settlement_is_idempotent() {
        let store = Store::open_temp().unwrap();
        let (user_id, _sub) = user_with_daily_window(&store, 1_000_000, 300).await;
        let log_id = store.insert_request_log(new_log(&user_id)).await.unwrap();

        let first = settle(&store, &log_id, &user_id, 1_000).await.unwrap();
        let second = settle(&store, &log_id, &user_id, 1_000).await.unwrap();
        assert_eq!(first, second);

        // Balance charged exactly once, one event set.
        let user = store.get_user(&user_id).await.unwrap().unwrap();
        assert_eq!(user.balance_micros, 1_000_000 - 700);
        let events = store.billing_events_for_log(&log_id).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn balance_primary_order_respected() {
        let store = Store::open_temp().unwrap();
        let (user_id, _sub) = user_with_daily_window(&store, 1_000_000, 10_000).await;
        store
            .put_billing_setting(&user_id, FundingSource::Balance)
            .await
            .unwrap();
        let log_id = store.insert_request_log(new_log(&user_id)).await.unwrap();

        let outcome = settle(&store, &log_id, &user_id, 1_000).await.unwrap();
        assert_eq!(outcome.charged_balance_micros, 1_000);
        assert_eq!(outcome.charged_subscription_micros, 0);
    }

    #[tokio::test]
    async fn window_usage_reduces_next_settlement() {
        let store = Store::open_temp().unwrap();
        let (user_id, _sub) = user_with_daily_window(&store, 1_000_000, 1_000).await;

        let log1 = store.insert_request_log(new_log(&user_id)).await.unwrap();
        settle(&store, &log1, &user_id, 800).await.unwrap();

        // 200 left in the window; the rest spills to balance.
        let log2 = store.insert_request_log(new_log(&user_id)).await.unwrap();
        let outcome = settle(&store, &log2, &user_id, 500).await.unwrap();
        assert_eq!(outcome.charged_subscription_micros, 200);
        assert_eq!(outcome.charged_balance_micros, 300);
    }
}
