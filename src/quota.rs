//! Quota windowing.
//!
//! For a plan limit `(type, mode)` and an instant `now`, yields the
//! half-open UTC interval `[start, end)` and aggregates subscription usage
//! within it. All arithmetic is on UTC instants; window strings compare
//! lexicographically in the store.

use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::store::plans::PlanLimit;
use crate::store::subscriptions::Subscription;
use crate::store::{self, fmt_ts};

/// Seconds in a rolling 5-hour bucket.
const ROLLING_5H_SECS: i64 = 18_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    Daily,
    Weekly,
    Monthly,
    #[serde(rename = "rolling_5h")]
    Rolling5h,
    Total,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::Daily => "daily",
            LimitType::Weekly => "weekly",
            LimitType::Monthly => "monthly",
            LimitType::Rolling5h => "rolling_5h",
            LimitType::Total => "total",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(LimitType::Daily),
            "weekly" => Some(LimitType::Weekly),
            "monthly" => Some(LimitType::Monthly),
            "rolling_5h" => Some(LimitType::Rolling5h),
            "total" => Some(LimitType::Total),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    Fixed,
    Sliding,
}

impl WindowMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowMode::Fixed => "fixed",
            WindowMode::Sliding => "sliding",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "fixed" => Some(WindowMode::Fixed),
            "sliding" => Some(WindowMode::Sliding),
            _ => None,
        }
    }
}

fn midnight(dt: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(dt.year(), dt.month(), dt.day(), 0, 0, 0)
        .single()
        .unwrap_or(dt)
}

/// Compute `[start, end)` for a limit at `now`. `sub_starts_at` anchors the
/// `total` window.
pub fn window_bounds(
    limit_type: LimitType,
    mode: WindowMode,
    now: DateTime<Utc>,
    sub_starts_at: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let far_future = store::parse_ts(store::FAR_FUTURE).unwrap_or(now + Duration::days(365_000));

    match (limit_type, mode) {
        (LimitType::Total, _) => (sub_starts_at, far_future),

        (LimitType::Daily, WindowMode::Fixed) => {
            let start = midnight(now);
            (start, start + Duration::hours(24))
        }
        (LimitType::Daily, WindowMode::Sliding) => (now - Duration::hours(24), now),

        (LimitType::Weekly, WindowMode::Fixed) => {
            let days_from_monday = now.weekday().num_days_from_monday() as i64;
            let start = midnight(now) - Duration::days(days_from_monday);
            (start, start + Duration::days(7))
        }
        (LimitType::Weekly, WindowMode::Sliding) => (now - Duration::days(7), now),

        (LimitType::Monthly, WindowMode::Fixed) => {
            let start = Utc
                .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(now);
            let end = start
                .checked_add_months(Months::new(1))
                .unwrap_or(start + Duration::days(31));
            (start, end)
        }
        (LimitType::Monthly, WindowMode::Sliding) => {
            let start = now
                .checked_sub_months(Months::new(1))
                .unwrap_or(now - Duration::days(30));
            (start, now)
        }

        (LimitType::Rolling5h, WindowMode::Fixed) => {
            let bucket = now.timestamp().div_euclid(ROLLING_5H_SECS) * ROLLING_5H_SECS;
            let start = Utc
                .timestamp_opt(bucket, 0)
                .single()
                .unwrap_or(now - Duration::hours(5));
            (start, start + Duration::seconds(ROLLING_5H_SECS))
        }
        (LimitType::Rolling5h, WindowMode::Sliding) => (now - Duration::hours(5), now),
    }
}

/// micro-USD consumed by a subscription inside `[start, end)`:
/// `sum(charges) - sum(refunds)` over its billing events.
pub fn used_in_window(
    conn: &Connection,
    subscription_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> rusqlite::Result<i64> {
    crate::store::billing::subscription_used_between(
        conn,
        subscription_id,
        &fmt_ts(&start),
        &fmt_ts(&end),
    )
}

/// Remaining micro-USD for one limit at `now`.
pub fn limit_remaining(
    conn: &Connection,
    sub: &Subscription,
    limit: &PlanLimit,
    now: DateTime<Utc>,
) -> rusqlite::Result<i64> {
    let starts_at = store::parse_ts(&sub.starts_at).unwrap_or(now);
    let (start, end) = window_bounds(limit.limit_type, limit.window_mode, now, starts_at);
    let used = used_in_window(conn, &sub.id, start, end)?;
    Ok((limit.limit_micros - used).max(0))
}

/// Remaining micro-USD for a subscription: the minimum remaining across its
/// plan limits, zero when the plan declares no limits.
pub fn subscription_remaining(
    conn: &Connection,
    sub: &Subscription,
    now: DateTime<Utc>,
) -> rusqlite::Result<i64> {
    let limits = crate::store::plans::limits_for_plan(conn, &sub.plan_id)?;
    if limits.is_empty() {
        return Ok(0);
    }
    let mut remaining = i64::MAX;
    for limit in &limits {
        remaining = remaining.min(limit_remaining(conn, sub, limit, now)?);
    }
    Ok(remaining)
}

/// Precheck view of a user's funding: `true` when the active subscription
/// has positive remaining. Readers outside settlements may see stale values.
pub fn subscription_has_headroom(
    conn: &Connection,
    sub: &Subscription,
    now: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    Ok(subscription_remaining(conn, sub, now)? > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        store::parse_ts(s).unwrap()
    }

    #[test]
    fn daily_fixed_starts_at_utc_midnight() {
        let now = at("2026-03-15T17:30:00Z");
        let anchor = at("2026-01-01T00:00:00Z");
        let (start, end) = window_bounds(LimitType::Daily, WindowMode::Fixed, now, anchor);
        assert_eq!(start, at("2026-03-15T00:00:00Z"));
        assert_eq!(end, at("2026-03-16T00:00:00Z"));
        assert!(start <= now && now < end);
    }

    #[test]
    fn daily_sliding_trails_now() {
        let now = at("2026-03-15T17:30:00Z");
        let anchor = at("2026-01-01T00:00:00Z");
        let (start, end) = window_bounds(LimitType::Daily, WindowMode::Sliding, now, anchor);
        assert_eq!(start, at("2026-03-14T17:30:00Z"));
        assert_eq!(end, now);
    }

    #[test]
    fn weekly_fixed_starts_on_monday() {
        // 2026-03-15 is a Sunday; its ISO week began Monday 2026-03-09.
        let now = at("2026-03-15T12:00:00Z");
        let anchor = at("2026-01-01T00:00:00Z");
        let (start, end) = window_bounds(LimitType::Weekly, WindowMode::Fixed, now, anchor);
        assert_eq!(start, at("2026-03-09T00:00:00Z"));
        assert_eq!(end - start, Duration::days(7));
    }

    #[test]
    fn monthly_fixed_spans_calendar_month() {
        let now = at("2026-02-10T08:00:00Z");
        let anchor = at("2026-01-01T00:00:00Z");
        let (start, end) = window_bounds(LimitType::Monthly, WindowMode::Fixed, now, anchor);
        assert_eq!(start, at("2026-02-01T00:00:00Z"));
        assert_eq!(end, at("2026-03-01T00:00:00Z"));
    }

    #[test]
    fn rolling_5h_fixed_is_epoch_aligned() {
        let now = at("2026-03-15T12:34:56Z");
        let anchor = at("2026-01-01T00:00:00Z");
        let (start, end) = window_bounds(LimitType::Rolling5h, WindowMode::Fixed, now, anchor);
        assert_eq!(start.timestamp() % ROLLING_5H_SECS, 0);
        assert_eq!(end - start, Duration::seconds(ROLLING_5H_SECS));
        assert!(start <= now && now < end);
    }

    #[test]
    fn total_window_is_anchored_at_subscription_start() {
        let now = at("2026-03-15T12:00:00Z");
        let anchor = at("2025-11-01T00:00:00Z");
        let (start, end) = window_bounds(LimitType::Total, WindowMode::Fixed, now, anchor);
        assert_eq!(start, anchor);
        assert!(end > now + Duration::days(365));
    }

    #[test]
    fn all_windows_contain_now() {
        let now = at("2026-07-31T23:59:59Z");
        let anchor = at("2026-01-01T00:00:00Z");
        for limit_type in [
            LimitType::Daily,
            LimitType::Weekly,
            LimitType::Monthly,
            LimitType::Rolling5h,
            LimitType::Total,
        ] {
            for mode in [WindowMode::Fixed, WindowMode::Sliding] {
                let (start, end) = window_bounds(limit_type, mode, now, anchor);
                assert!(start <= now, "{:?}/{:?} start after now", limit_type, mode);
                // Sliding windows end exactly at now, half-open upper bound.
                assert!(end >= now, "{:?}/{:?} end before now", limit_type, mode);
            }
        }
    }

    #[test]
    fn window_durations_match_limit_type() {
        let now = at("2026-05-20T10:00:00Z");
        let anchor = at("2026-01-01T00:00:00Z");
        let cases = [
            (LimitType::Daily, Duration::hours(24)),
            (LimitType::Weekly, Duration::days(7)),
            (LimitType::Rolling5h, Duration::hours(5)),
        ];
        for (limit_type, expected) in cases {
            for mode in [WindowMode::Fixed, WindowMode::Sliding] {
                let (start, end) = window_bounds(limit_type, mode, now, anchor);
                assert_eq!(end - start, expected, "{:?}/{:?}", limit_type, mode);
            }
        }
        // Monthly varies by calendar; allow the 28..=31 day span.
        for mode in [WindowMode::Fixed, WindowMode::Sliding] {
            let (start, end) = window_bounds(LimitType::Monthly, mode, now, anchor);
            let days = (end - start).num_days();
            assert!((28..=31).contains(&days), "monthly/{:?} spans {} days", mode, days);
        }
    }

    #[tokio::test]
    async fn charges_shrink_remaining_and_refunds_restore_it() {
        use crate::store::billing::{insert_event, BillingEvent, BillingEventType, FundingSource};
        use crate::store::Store;

        let store = Store::open_temp().unwrap();
        let user = store.create_user("quota-user", "h", false, 0).await.unwrap();
        let plan = store.create_plan("metered", "").await.unwrap();
        store
            .upsert_plan_limit(&plan.id, LimitType::Daily, WindowMode::Sliding, 10_000)
            .await
            .unwrap();
        let sub = store.assign_subscription(&user.id, &plan.id, None).await.unwrap();

        let conn = store.conn().await.unwrap();
        let now = chrono::Utc::now();
        let base = subscription_remaining(&conn, &sub, now).unwrap();
        assert_eq!(base, 10_000);

        // Stamped just inside the half-open window; `end` itself is excluded.
        let stamp = store::fmt_ts(&(now - Duration::seconds(10)));
        let event = |id: &str, event_type, amount| BillingEvent {
            id: id.to_string(),
            request_log_id: None,
            user_id: user.id.clone(),
            subscription_id: Some(sub.id.clone()),
            source: FundingSource::Subscription,
            event_type,
            amount_micros: amount,
            created_at: stamp.clone(),
        };

        insert_event(&conn, &event("q1", BillingEventType::Charge, 4_000)).unwrap();
        let after_charge = subscription_remaining(&conn, &sub, now).unwrap();
        assert!(after_charge <= base);
        assert_eq!(after_charge, 6_000);

        insert_event(&conn, &event("q2", BillingEventType::Refund, 1_000)).unwrap();
        let after_refund = subscription_remaining(&conn, &sub, now).unwrap();
        assert!(after_refund >= after_charge);
        assert_eq!(after_refund, 7_000);

        // Remaining floors at zero even when usage exceeds the limit.
        insert_event(&conn, &event("q3", BillingEventType::Charge, 50_000)).unwrap();
        assert_eq!(subscription_remaining(&conn, &sub, now).unwrap(), 0);
    }

    #[tokio::test]
    async fn plan_without_limits_has_zero_remaining() {
        use crate::store::Store;

        let store = Store::open_temp().unwrap();
        let user = store.create_user("no-limits", "h", false, 0).await.unwrap();
        let plan = store.create_plan("unlimited", "").await.unwrap();
        let sub = store.assign_subscription(&user.id, &plan.id, None).await.unwrap();

        let conn = store.conn().await.unwrap();
        assert_eq!(
            subscription_remaining(&conn, &sub, chrono::Utc::now()).unwrap(),
            0
        );
    }

    #[test]
    fn limit_type_round_trip() {
        for lt in [
            LimitType::Daily,
            LimitType::Weekly,
            LimitType::Monthly,
            LimitType::Rolling5h,
            LimitType::Total,
        ] {
            assert_eq!(LimitType::from_str(lt.as_str()), Some(lt));
        }
    }
}
