//! Forward module.
//!
//! The proxy surface of the gateway: three compatibility families that all
//! funnel into the same dispatch pipeline.
//!
//! ```text
//! Request -> middleware -> selector -> transport -> handlers -> client
//!               |                                      |
//!               v                                      v
//!          auth, quota,                      dialect translation,
//!          model mapping                     streaming state machines
//! ```
//!
//! - `POST /v1/chat/completions` — OpenAI chat completions
//! - `POST /v1/messages` — Anthropic messages
//! - `POST /v1beta/models/{model}:generateContent` (+ `:streamGenerateContent`) — Gemini
//! - `GET /v1/models` — models visible through enabled channels

pub mod context;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod transport;

use std::collections::{BTreeSet, HashMap};

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use crate::server::AppState;

pub use context::{Provider, TokenUsage};
pub use error::{ProxyError, ProxyResult};

/// OpenAI-compatible chat completions endpoint.
pub async fn chat_completions(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    dispatch::dispatch(
        state,
        Provider::OpenAI,
        headers,
        query,
        "/v1/chat/completions".to_string(),
        payload,
        None,
        false,
    )
    .await
}

/// Anthropic messages endpoint.
pub async fn messages(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    dispatch::dispatch(
        state,
        Provider::Claude,
        headers,
        query,
        "/v1/messages".to_string(),
        payload,
        None,
        false,
    )
    .await
}

/// Gemini generate-content endpoint. The path segment carries both the
/// model and the action, e.g. `gemini-1.5-pro:streamGenerateContent`.
pub async fn gemini_generate(
    State(state): State<AppState>,
    Path(model_call): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let (model, action) = model_call
        .split_once(':')
        .unwrap_or((model_call.as_str(), "generateContent"));
    let force_streaming = action.eq_ignore_ascii_case("streamGenerateContent");
    let model = model.to_string();
    let path = format!("/v1beta/models/{}", model_call);
    dispatch::dispatch(
        state,
        Provider::Gemini,
        headers,
        query,
        path,
        payload,
        Some(model),
        force_streaming,
    )
    .await
}

/// Models visible through enabled channels, OpenAI list format. Wildcard
/// matchers have no concrete name to advertise and are skipped.
pub async fn list_models(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = middleware::authenticate(&state.store, &headers, &query).await {
        return e.into_response();
    }

    let channels = match state.store.list_enabled_channels().await {
        Ok(channels) => channels,
        Err(e) => return ProxyError::from(e).into_response(),
    };

    let mut names: BTreeSet<(String, &'static str)> = BTreeSet::new();
    for channel in &channels {
        for matcher in &channel.models {
            if !matcher.name().contains('*') {
                names.insert((matcher.name().to_string(), channel.channel_type.as_str()));
            }
            if let Some(alias) = matcher.alias() {
                names.insert((alias.to_string(), channel.channel_type.as_str()));
            }
        }
    }

    let data: Vec<Value> = names
        .into_iter()
        .map(|(id, owner)| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "owned_by": owner
            })
        })
        .collect();

    Json(serde_json::json!({"object": "list", "data": data})).into_response()
}
