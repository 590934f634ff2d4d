//! Admin collaborator surface.
//!
//! REST + JSON under `/api/...`; failures return `{"error": msg}`. This is
//! the contracted CRUD layer around the core: it stays thin over the store
//! and applies hot-reload keys as they are written.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config;
use crate::crypto;
use crate::error::{AppError, AppResult};
use crate::logger;
use crate::quota::{LimitType, WindowMode};
use crate::server::AppState;
use crate::store::billing::FundingSource;
use crate::store::channels::ChannelInput;
use crate::store::mappings::ModelMapping;
use crate::store::prices::PriceRow;
use crate::store::request_logs::BillingStatus;
use crate::store::subscriptions::SubscriptionStatus;

/// In-memory admin session tokens; restart invalidates all sessions.
#[derive(Clone, Default)]
pub struct AdminSessions {
    tokens: Arc<Mutex<HashSet<String>>>,
}

impl AdminSessions {
    pub fn issue(&self) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        self.tokens
            .lock()
            .expect("session lock poisoned")
            .insert(token.clone());
        token
    }

    pub fn check(&self, token: &str) -> bool {
        self.tokens
            .lock()
            .expect("session lock poisoned")
            .contains(token)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Gate every `/api` route except login behind a session token.
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if request.uri().path() == "/api/auth/login" {
        return next.run(request).await;
    }
    let authorized = bearer_token(request.headers())
        .map(|token| state.sessions.check(&token))
        .unwrap_or(false);
    if !authorized {
        return AppError::Unauthorized("admin session required".to_string()).into_response();
    }
    next.run(request).await
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> AppResult<Json<Value>> {
    let user = state
        .store
        .get_user_by_username(&req.username)
        .await?
        .filter(|u| u.is_admin)
        .ok_or_else(|| AppError::Unauthorized("invalid credentials".to_string()))?;
    if user.password_hash != crypto::sha256_hex(&req.password) {
        return Err(AppError::Unauthorized("invalid credentials".to_string()));
    }
    let token = state.sessions.issue();
    logger::info("admin", &format!("Admin '{}' logged in", req.username));
    Ok(Json(json!({"token": token})))
}

// ----------------------------------------------------------------------------
// Users
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub balance_micros: i64,
}

pub async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> AppResult<impl IntoResponse> {
    let user = state
        .store
        .create_user(
            &req.username,
            &crypto::sha256_hex(&req.password),
            req.is_admin,
            req.balance_micros.max(0),
        )
        .await?;
    Ok((axum::http::StatusCode::CREATED, Json(user)))
}

pub async fn list_users(State(state): State<AppState>) -> AppResult<Json<Value>> {
    Ok(Json(json!({"users": state.store.list_users().await?})))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let user = state
        .store
        .get_user(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user '{}' not found", id)))?;
    let subscription = state.store.active_subscription(&id).await?;
    let setting = state.store.billing_setting(&id).await?;
    Ok(Json(json!({
        "user": user,
        "active_subscription": subscription,
        "billing_setting": setting
    })))
}

pub async fn delete_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    state.store.delete_user(&id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct BalanceAdjustment {
    pub delta_micros: i64,
}

/// Credit or debit a balance; recorded in the ledger as an adjustment.
pub async fn adjust_balance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<BalanceAdjustment>,
) -> AppResult<Json<Value>> {
    state
        .store
        .get_user(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user '{}' not found", id)))?;
    let event = state
        .store
        .record_adjustment(&id, FundingSource::Balance, None, req.delta_micros)
        .await?;
    let user = state.store.get_user(&id).await?;
    Ok(Json(json!({"event": event, "user": user})))
}

// ----------------------------------------------------------------------------
// API keys
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateKeyRequest {
    #[serde(default)]
    pub name: String,
}

pub async fn create_api_key(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(req): Json<CreateKeyRequest>,
) -> AppResult<impl IntoResponse> {
    state
        .store
        .get_user(&user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user '{}' not found", user_id)))?;
    let (key, raw) = state.store.create_api_key(&user_id, &req.name).await?;
    // The raw key appears in this response and nowhere else.
    Ok((
        axum::http::StatusCode::CREATED,
        Json(json!({"key": key, "raw_key": raw})),
    ))
}

pub async fn list_api_keys(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> AppResult<Json<Value>> {
    Ok(Json(json!({"keys": state.store.list_api_keys(&user_id).await?})))
}

pub async fn revoke_api_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    state.store.revoke_api_key(&id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

// ----------------------------------------------------------------------------
// Groups
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default = "default_multiplier")]
    pub rate_multiplier: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

pub async fn create_group(
    State(state): State<AppState>,
    Json(req): Json<CreateGroupRequest>,
) -> AppResult<impl IntoResponse> {
    let group = state.store.create_group(&req.name, req.rate_multiplier).await?;
    Ok((axum::http::StatusCode::CREATED, Json(group)))
}

pub async fn list_groups(State(state): State<AppState>) -> AppResult<Json<Value>> {
    Ok(Json(json!({"groups": state.store.list_groups().await?})))
}

pub async fn delete_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    state.store.delete_group(&id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct MembershipRequest {
    pub group_id: String,
}

pub async fn add_user_group(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(req): Json<MembershipRequest>,
) -> AppResult<impl IntoResponse> {
    state.store.add_user_to_group(&user_id, &req.group_id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

pub async fn remove_user_group(
    State(state): State<AppState>,
    Path((user_id, group_id)): Path<(String, String)>,
) -> AppResult<impl IntoResponse> {
    state.store.remove_user_from_group(&user_id, &group_id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

// ----------------------------------------------------------------------------
// Channels
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateChannelRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub input: ChannelInput,
}

pub async fn create_channel(
    State(state): State<AppState>,
    Json(req): Json<CreateChannelRequest>,
) -> AppResult<impl IntoResponse> {
    let channel = match req.id {
        Some(id) if !id.trim().is_empty() => {
            state.store.create_channel_with_id(id, req.input).await?
        }
        _ => state.store.create_channel(req.input).await?,
    };
    Ok((axum::http::StatusCode::CREATED, Json(channel)))
}

pub async fn list_channels(State(state): State<AppState>) -> AppResult<Json<Value>> {
    Ok(Json(json!({"channels": state.store.list_channels().await?})))
}

pub async fn get_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let channel = state
        .store
        .get_channel(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("channel '{}' not found", id)))?;
    Ok(Json(serde_json::to_value(channel)?))
}

pub async fn update_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ChannelInput>,
) -> AppResult<Json<Value>> {
    let channel = state.store.update_channel(&id, input).await?;
    Ok(Json(serde_json::to_value(channel)?))
}

pub async fn delete_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    state.store.delete_channel(&id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

// ----------------------------------------------------------------------------
// Plans & limits
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreatePlanRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

pub async fn create_plan(
    State(state): State<AppState>,
    Json(req): Json<CreatePlanRequest>,
) -> AppResult<impl IntoResponse> {
    let plan = state.store.create_plan(&req.name, &req.description).await?;
    Ok((axum::http::StatusCode::CREATED, Json(plan)))
}

pub async fn list_plans(State(state): State<AppState>) -> AppResult<Json<Value>> {
    Ok(Json(json!({"plans": state.store.list_plans().await?})))
}

pub async fn get_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let plan = state
        .store
        .get_plan(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("plan '{}' not found", id)))?;
    let limits = state.store.plan_limits(&id).await?;
    Ok(Json(json!({"plan": plan, "limits": limits})))
}

pub async fn delete_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    state.store.delete_plan(&id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct PlanEnabledRequest {
    pub enabled: bool,
}

pub async fn set_plan_enabled(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PlanEnabledRequest>,
) -> AppResult<impl IntoResponse> {
    state.store.set_plan_enabled(&id, req.enabled).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct PlanLimitRequest {
    pub limit_type: LimitType,
    pub window_mode: WindowMode,
    pub limit_micros: i64,
}

pub async fn upsert_plan_limit(
    State(state): State<AppState>,
    Path(plan_id): Path<String>,
    Json(req): Json<PlanLimitRequest>,
) -> AppResult<Json<Value>> {
    let limit = state
        .store
        .upsert_plan_limit(&plan_id, req.limit_type, req.window_mode, req.limit_micros)
        .await?;
    Ok(Json(serde_json::to_value(limit)?))
}

pub async fn delete_plan_limit(
    State(state): State<AppState>,
    Path((plan_id, limit_type)): Path<(String, String)>,
) -> AppResult<impl IntoResponse> {
    let limit_type = LimitType::from_str(&limit_type)
        .ok_or_else(|| AppError::BadRequest(format!("unknown limit_type '{}'", limit_type)))?;
    state.store.delete_plan_limit(&plan_id, limit_type).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

// ----------------------------------------------------------------------------
// Subscriptions & billing settings
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct AssignSubscriptionRequest {
    pub plan_id: String,
    #[serde(default)]
    pub expires_at: Option<String>,
}

pub async fn assign_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(req): Json<AssignSubscriptionRequest>,
) -> AppResult<impl IntoResponse> {
    state
        .store
        .get_user(&user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user '{}' not found", user_id)))?;
    if let Some(raw) = req.expires_at.as_deref() {
        if crate::store::parse_ts(raw).is_none() {
            return Err(AppError::BadRequest("expires_at must be RFC3339".to_string()));
        }
    }
    let sub = state
        .store
        .assign_subscription(&user_id, &req.plan_id, req.expires_at)
        .await?;
    Ok((axum::http::StatusCode::CREATED, Json(sub)))
}

pub async fn list_subscriptions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> AppResult<Json<Value>> {
    Ok(Json(json!({
        "subscriptions": state.store.list_subscriptions(&user_id).await?
    })))
}

#[derive(Deserialize)]
pub struct SubscriptionStatusRequest {
    pub status: SubscriptionStatus,
}

pub async fn set_subscription_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SubscriptionStatusRequest>,
) -> AppResult<impl IntoResponse> {
    state.store.set_subscription_status(&id, req.status).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct BillingSettingRequest {
    pub primary_source: FundingSource,
}

pub async fn put_billing_setting(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(req): Json<BillingSettingRequest>,
) -> AppResult<Json<Value>> {
    let setting = state
        .store
        .put_billing_setting(&user_id, req.primary_source)
        .await?;
    Ok(Json(serde_json::to_value(setting)?))
}

// ----------------------------------------------------------------------------
// Model mappings
// ----------------------------------------------------------------------------

pub async fn get_model_mappings(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> AppResult<Json<Value>> {
    Ok(Json(json!({
        "mappings": state.store.model_mappings(&user_id).await?
    })))
}

pub async fn put_model_mappings(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(mappings): Json<Vec<ModelMapping>>,
) -> AppResult<Json<Value>> {
    let stored = state.store.put_model_mappings(&user_id, mappings).await?;
    Ok(Json(json!({"mappings": stored})))
}

// ----------------------------------------------------------------------------
// Price overrides
// ----------------------------------------------------------------------------

pub async fn list_prices(State(state): State<AppState>) -> AppResult<Json<Value>> {
    Ok(Json(json!({"overrides": state.store.list_price_overrides().await?})))
}

pub async fn upsert_price(
    State(state): State<AppState>,
    Json(row): Json<PriceRow>,
) -> AppResult<Json<Value>> {
    if row.model.trim().is_empty() {
        return Err(AppError::BadRequest("model must not be empty".to_string()));
    }
    let stored = state.store.upsert_price_override(row).await?;
    // Fold the override into the live snapshot right away.
    state.prices.refresh(&state.store).await;
    Ok(Json(serde_json::to_value(stored)?))
}

pub async fn delete_price(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> AppResult<impl IntoResponse> {
    if !state.store.delete_price_override(&model).await? {
        return Err(AppError::NotFound(format!("no override for '{}'", model)));
    }
    state.prices.refresh(&state.store).await;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

// ----------------------------------------------------------------------------
// Request logs
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct RequestLogQuery {
    pub user_id: Option<String>,
    pub billing_status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_request_logs(
    State(state): State<AppState>,
    Query(q): Query<RequestLogQuery>,
) -> AppResult<Json<Value>> {
    let status = match q.billing_status.as_deref() {
        Some(raw) => Some(
            BillingStatus::from_str(raw)
                .ok_or_else(|| AppError::BadRequest(format!("unknown billing_status '{}'", raw)))?,
        ),
        None => None,
    };
    let logs = state
        .store
        .list_request_logs(
            q.user_id.as_deref(),
            status,
            q.limit.unwrap_or(50),
            q.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(json!({"logs": logs})))
}

pub async fn get_request_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let log = state
        .store
        .get_request_log(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("request log '{}' not found", id)))?;
    let events = state.store.billing_events_for_log(&id).await?;
    Ok(Json(json!({"log": log, "events": events, "cost_usd": crate::pricing::usd_string(log.cost_micros)})))
}

// ----------------------------------------------------------------------------
// System config & status
// ----------------------------------------------------------------------------

pub async fn get_system_config(State(state): State<AppState>) -> AppResult<Json<Value>> {
    Ok(Json(json!({"entries": state.store.system_config_all().await?})))
}

#[derive(Deserialize)]
pub struct SystemConfigRequest {
    pub key: String,
    pub value: String,
}

/// Persist a `system_config` row and apply it to the live snapshots. An
/// invalid value is rejected without touching the store.
pub async fn put_system_config(
    State(state): State<AppState>,
    Json(req): Json<SystemConfigRequest>,
) -> AppResult<Json<Value>> {
    state
        .hot
        .apply(&req.key, &req.value)
        .map_err(AppError::Config)?;
    state.store.system_config_set(&req.key, &req.value).await?;
    logger::info("config", &format!("Hot config '{}' updated", req.key));
    Ok(Json(json!({"key": req.key, "applied": true})))
}

pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.prices.snapshot();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "price_table": {
            "models": snapshot.prices.len(),
            "refreshed_at": snapshot.refreshed_at,
            "stale": snapshot.stale
        },
        "proxy_base_url": config::env_config().proxy_base_url
    }))
}

// ----------------------------------------------------------------------------
// Global logs
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct LogsQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub level: Option<String>,
    pub source: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

pub async fn get_logs(Query(q): Query<LogsQuery>) -> Json<Value> {
    let query = logger::LogQuery {
        limit: q.limit,
        offset: q.offset,
        level: q.level.as_deref().and_then(logger::LogLevel::from_str),
        source: q.source,
        start_time: q.start_time,
        end_time: q.end_time,
    };
    let logs = logger::query_logs(&query);
    let total = logger::logs_count(&query);
    Json(json!({"logs": logs, "total": total}))
}

#[derive(Deserialize)]
pub struct ClearLogsQuery {
    /// Unix-second cutoff; only records older than this are pruned. Absent
    /// means clear everything.
    pub before: Option<i64>,
}

pub async fn clear_logs(Query(q): Query<ClearLogsQuery>) -> Response {
    let result = match q.before {
        Some(cutoff) => logger::delete_logs_before(cutoff),
        None => logger::clear_all_logs(),
    };
    match result {
        Ok(count) => Json(json!({"deleted": count})).into_response(),
        Err(e) => AppError::Internal(e).into_response(),
    }
}
