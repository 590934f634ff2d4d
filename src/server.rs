//! HTTP server wiring.
//!
//! One router carries the proxy endpoints and the admin surface. Shared
//! state travels through axum `State`; there are no module-level singletons
//! on the request path.

use std::net::SocketAddr;

use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::admin::{self, AdminSessions};
use crate::config::HotConfig;
use crate::forward;
use crate::pricing::PriceTable;
use crate::selector::RoundRobin;
use crate::store::Store;

/// Shared service state; cloning is cheap, all fields are handles.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub prices: PriceTable,
    pub hot: HotConfig,
    pub rr: RoundRobin,
    pub sessions: AdminSessions,
}

impl AppState {
    pub fn new(store: Store, prices: PriceTable, hot: HotConfig) -> Self {
        Self {
            store,
            prices,
            hot,
            rr: RoundRobin::default(),
            sessions: AdminSessions::default(),
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub fn app(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/api/auth/login", post(admin::login))
        .route("/api/users", get(admin::list_users).post(admin::create_user))
        .route("/api/users/:id", get(admin::get_user).delete(admin::delete_user))
        .route("/api/users/:id/balance", post(admin::adjust_balance))
        .route(
            "/api/users/:id/keys",
            get(admin::list_api_keys).post(admin::create_api_key),
        )
        .route("/api/keys/:id", delete(admin::revoke_api_key))
        .route("/api/users/:id/groups", post(admin::add_user_group))
        .route(
            "/api/users/:id/groups/:group_id",
            delete(admin::remove_user_group),
        )
        .route(
            "/api/users/:id/subscriptions",
            get(admin::list_subscriptions).post(admin::assign_subscription),
        )
        .route(
            "/api/subscriptions/:id/status",
            put(admin::set_subscription_status),
        )
        .route(
            "/api/users/:id/billing-setting",
            put(admin::put_billing_setting),
        )
        .route(
            "/api/users/:id/mappings",
            get(admin::get_model_mappings).put(admin::put_model_mappings),
        )
        .route("/api/groups", get(admin::list_groups).post(admin::create_group))
        .route("/api/groups/:id", delete(admin::delete_group))
        .route(
            "/api/channels",
            get(admin::list_channels).post(admin::create_channel),
        )
        .route(
            "/api/channels/:id",
            get(admin::get_channel)
                .put(admin::update_channel)
                .delete(admin::delete_channel),
        )
        .route("/api/plans", get(admin::list_plans).post(admin::create_plan))
        .route("/api/plans/:id", get(admin::get_plan).delete(admin::delete_plan))
        .route("/api/plans/:id/enabled", put(admin::set_plan_enabled))
        .route("/api/plans/:id/limits", put(admin::upsert_plan_limit))
        .route(
            "/api/plans/:id/limits/:limit_type",
            delete(admin::delete_plan_limit),
        )
        .route("/api/prices", get(admin::list_prices).post(admin::upsert_price))
        .route("/api/prices/:model", delete(admin::delete_price))
        .route("/api/request-logs", get(admin::list_request_logs))
        .route("/api/request-logs/:id", get(admin::get_request_log))
        .route(
            "/api/system-config",
            get(admin::get_system_config).put(admin::put_system_config),
        )
        .route("/api/status", get(admin::status))
        .route("/api/logs", get(admin::get_logs).delete(admin::clear_logs))
        .layer(from_fn_with_state(state.clone(), admin::require_admin));

    Router::new()
        .route("/health", get(health))
        // Proxy endpoints
        .route("/v1/chat/completions", post(forward::chat_completions))
        .route("/v1/messages", post(forward::messages))
        .route("/v1/models", get(forward::list_models))
        .route("/v1beta/models/:model_call", post(forward::gemini_generate))
        .merge(admin_routes)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState) {
    let port = crate::config::env_config().server_port;
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let app = app(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind server port");
    crate::logger::info("server", &format!("Listening on {}", addr));
    axum::serve(listener, app).await.expect("server error");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::channels::{ChannelInput, ModelMatcher};
    use crate::forward::context::Provider;
    use std::collections::HashMap;

    async fn spawn_app(state: AppState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app(state);
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{}", addr)
    }

    fn test_state(store: Store) -> AppState {
        AppState::new(store, PriceTable::default(), HotConfig::default())
    }

    #[tokio::test]
    async fn health_ok() {
        let base = spawn_app(test_state(Store::open_temp().unwrap())).await;
        let body: Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn admin_routes_require_session() {
        let base = spawn_app(test_state(Store::open_temp().unwrap())).await;
        let resp = reqwest::get(format!("{}/api/users", base)).await.unwrap();
        assert_eq!(resp.status().as_u16(), 401);
    }

    #[tokio::test]
    async fn login_then_crud_round_trip() {
        let store = Store::open_temp().unwrap();
        store.ensure_admin_user("root", "secret").await.unwrap();
        let base = spawn_app(test_state(store)).await;
        let client = reqwest::Client::new();

        let login: Value = client
            .post(format!("{}/api/auth/login", base))
            .json(&json!({"username": "root", "password": "secret"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let token = login["token"].as_str().unwrap().to_string();

        let created = client
            .post(format!("{}/api/users", base))
            .bearer_auth(&token)
            .json(&json!({"username": "alice", "password": "pw", "balance_micros": 5}))
            .send()
            .await
            .unwrap();
        assert_eq!(created.status().as_u16(), 201);

        let listed: Value = client
            .get(format!("{}/api/users", base))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let usernames: Vec<&str> = listed["users"]
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["username"].as_str().unwrap())
            .collect();
        assert!(usernames.contains(&"alice"));

        // Bad login rejected.
        let bad = client
            .post(format!("{}/api/auth/login", base))
            .json(&json!({"username": "root", "password": "wrong"}))
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status().as_u16(), 401);
    }

    #[tokio::test]
    async fn proxy_rejects_missing_key_with_auth_error() {
        let base = spawn_app(test_state(Store::open_temp().unwrap())).await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/v1/chat/completions", base))
            .json(&json!({"model": "gpt-4o", "messages": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 401);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["type"], "auth");
    }

    #[tokio::test]
    async fn proxy_quota_precheck_rejects_unfunded_user() {
        let store = Store::open_temp().unwrap();
        let user = store.create_user("pat", "h", false, 0).await.unwrap();
        let (_, raw) = store.create_api_key(&user.id, "k").await.unwrap();
        let base = spawn_app(test_state(store.clone())).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/v1/chat/completions", base))
            .bearer_auth(&raw)
            .json(&json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "x"}]}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 402);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["type"], "quota");

        // Precheck failures leave no request log behind.
        let logs = store.list_request_logs(None, None, 10, 0).await.unwrap();
        assert!(logs.is_empty());
    }

    async fn wait_for_settlement(
        store: &Store,
        user_id: &str,
    ) -> crate::store::request_logs::RequestLog {
        use crate::store::request_logs::BillingStatus;
        for _ in 0..100 {
            let logs = store.list_request_logs(Some(user_id), None, 10, 0).await.unwrap();
            if let Some(log) = logs.iter().find(|l| {
                matches!(
                    l.billing_status,
                    BillingStatus::Settled | BillingStatus::Free | BillingStatus::Overuse
                )
            }) {
                return log.clone();
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("settlement never completed");
    }

    /// Mock chat-completions upstream failing `fail_first` times with 502
    /// before answering 200 with fixed usage.
    async fn spawn_upstream(fail_first: u32) -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let hits = Arc::new(AtomicU32::new(0));
        let router = axum::Router::new().route(
            "/v1/chat/completions",
            axum::routing::post(move || {
                let hits = Arc::clone(&hits);
                async move {
                    use axum::response::IntoResponse;
                    if hits.fetch_add(1, Ordering::SeqCst) < fail_first {
                        (axum::http::StatusCode::BAD_GATEWAY, "upstream sad").into_response()
                    } else {
                        Json(json!({
                            "id": "chatcmpl-e2e",
                            "object": "chat.completion",
                            "model": "gpt-4o",
                            "choices": [{
                                "index": 0,
                                "message": {"role": "assistant", "content": "hello back"},
                                "finish_reason": "stop"
                            }],
                            "usage": {"prompt_tokens": 1000, "completion_tokens": 2000}
                        }))
                        .into_response()
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{}", addr)
    }

    async fn funded_user_with_channel(store: &Store, base_url: &str) -> (String, String) {
        let user = store.create_user("e2e", "h", false, 50_000_000).await.unwrap();
        let (_, raw) = store.create_api_key(&user.id, "k").await.unwrap();
        store
            .create_channel_with_id(
                "chan-a".to_string(),
                ChannelInput {
                    channel_type: Provider::OpenAI,
                    name: "primary".to_string(),
                    base_url: base_url.to_string(),
                    api_key: "sk-upstream".to_string(),
                    enabled: true,
                    weight: 1,
                    priority: 0,
                    models: vec![ModelMatcher::Name("gpt-4o".to_string())],
                    headers: HashMap::new(),
                },
            )
            .await
            .unwrap();
        (user.id, raw)
    }

    #[tokio::test]
    async fn full_pipeline_settles_cost_against_balance() {
        let store = Store::open_temp().unwrap();
        let upstream = spawn_upstream(0).await;
        let (user_id, raw_key) = funded_user_with_channel(&store, &upstream).await;

        let state = test_state(store.clone());
        // 1000 input at 2.5/Mtok + 2000 output at 10/Mtok = 22,500 micros.
        let mut snapshot = crate::pricing::PriceSnapshot::default();
        snapshot.prices.insert(
            "gpt-4o".to_string(),
            crate::pricing::ModelPrice {
                input_per_token: 2.5e-6,
                output_per_token: 1e-5,
                ..Default::default()
            },
        );
        state.prices.publish(snapshot);

        let base = spawn_app(state).await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/v1/chat/completions", base))
            .bearer_auth(&raw_key)
            .json(&json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], "hello back");

        let log = wait_for_settlement(&store, &user_id).await;
        assert_eq!(log.status_code, 200);
        assert_eq!(log.input_tokens, 1000);
        assert_eq!(log.output_tokens, 2000);
        assert_eq!(log.cost_micros, 22_500);
        assert_eq!(
            log.charged_subscription_micros + log.charged_balance_micros,
            log.cost_micros
        );

        let user = store.get_user(&user_id).await.unwrap().unwrap();
        assert_eq!(user.balance_micros, 50_000_000 - 22_500);
    }

    #[tokio::test]
    async fn upstream_5xx_retried_behind_closed_gate() {
        let store = Store::open_temp().unwrap();
        let upstream = spawn_upstream(1).await;
        let (user_id, raw_key) = funded_user_with_channel(&store, &upstream).await;

        let state = test_state(store.clone());
        state
            .hot
            .apply(
                crate::config::KEY_RETRY_CONFIG,
                r#"{"max_attempts": 3, "backoff_base_ms": 1, "backoff_max_ms": 5}"#,
            )
            .unwrap();
        let base = spawn_app(state).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/v1/chat/completions", base))
            .bearer_auth(&raw_key)
            .json(&json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}))
            .send()
            .await
            .unwrap();
        // The client only ever sees the 200 from attempt two.
        assert_eq!(resp.status().as_u16(), 200);

        let log = wait_for_settlement(&store, &user_id).await;
        assert_eq!(log.status_code, 200);
    }

    #[tokio::test]
    async fn streaming_pipeline_delivers_sse_and_settles() {
        use axum::response::sse::{Event, Sse};

        let store = Store::open_temp().unwrap();
        let router = axum::Router::new().route(
            "/v1/chat/completions",
            axum::routing::post(|| async {
                let events = futures_util::stream::iter(vec![
                    Ok::<_, std::convert::Infallible>(Event::default().data(
                        r#"{"id":"chatcmpl-s1","choices":[{"index":0,"delta":{"role":"assistant","content":"hel"}}]}"#,
                    )),
                    Ok(Event::default().data(
                        r#"{"id":"chatcmpl-s1","choices":[{"index":0,"delta":{"content":"lo"},"finish_reason":"stop"}],"usage":{"prompt_tokens":40,"completion_tokens":8}}"#,
                    )),
                    Ok(Event::default().data("[DONE]")),
                ]);
                Sse::new(events)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        let (user_id, raw_key) = funded_user_with_channel(&store, &upstream).await;
        let base = spawn_app(test_state(store.clone())).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/v1/chat/completions", base))
            .bearer_auth(&raw_key)
            .json(&json!({
                "model": "gpt-4o",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert!(resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .contains("text/event-stream"));

        let body = resp.text().await.unwrap();
        assert!(body.contains("\"content\":\"hel\""));
        assert!(body.contains("[DONE]"));

        let log = wait_for_settlement(&store, &user_id).await;
        assert_eq!(log.status_code, 200);
        assert!(log.is_streaming);
        assert_eq!(log.input_tokens, 40);
        assert_eq!(log.output_tokens, 8);
        assert_eq!(log.upstream_request_id.as_deref(), Some("chatcmpl-s1"));
    }

    #[tokio::test]
    async fn claude_client_translated_to_openai_upstream() {
        let store = Store::open_temp().unwrap();
        let upstream = spawn_upstream(0).await;
        let (user_id, raw_key) = funded_user_with_channel(&store, &upstream).await;
        // Route the claude-dialect request onto the OpenAI channel.
        store
            .put_model_mappings(
                &user_id,
                vec![crate::store::mappings::ModelMapping {
                    id: String::new(),
                    user_id: String::new(),
                    position: 0,
                    pattern: "claude-3-5-sonnet-latest".to_string(),
                    replacement: "gpt-4o".to_string(),
                    is_regex: false,
                    thinking_level: None,
                }],
            )
            .await
            .unwrap();

        let base = spawn_app(test_state(store.clone())).await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/v1/messages", base))
            .header("x-api-key", &raw_key)
            .json(&json!({
                "model": "claude-3-5-sonnet-latest",
                "max_tokens": 100,
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.unwrap();
        // Response arrives in the client's (Anthropic) dialect.
        assert_eq!(body["type"], "message");
        assert_eq!(body["content"][0]["text"], "hello back");

        let log = wait_for_settlement(&store, &user_id).await;
        assert_eq!(log.original_model, "claude-3-5-sonnet-latest");
        assert_eq!(log.mapped_model, "gpt-4o");
        assert_eq!(log.provider, "openai");
    }

    #[tokio::test]
    async fn proxy_routing_failure_records_log() {
        let store = Store::open_temp().unwrap();
        let user = store.create_user("quinn", "h", false, 1_000).await.unwrap();
        let (_, raw) = store.create_api_key(&user.id, "k").await.unwrap();
        // A claude-only channel cannot serve a gpt model.
        store
            .create_channel(ChannelInput {
                channel_type: Provider::Claude,
                name: "claude-main".to_string(),
                base_url: "https://upstream.invalid".to_string(),
                api_key: String::new(),
                enabled: true,
                weight: 1,
                priority: 0,
                models: vec![ModelMatcher::Name("claude-*".to_string())],
                headers: HashMap::new(),
            })
            .await
            .unwrap();
        let base = spawn_app(test_state(store.clone())).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/v1/chat/completions", base))
            .bearer_auth(&raw)
            .json(&json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "x"}]}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["type"], "routing");

        let logs = store.list_request_logs(Some(&user.id), None, 10, 0).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status_code, 404);
        assert_eq!(logs[0].error_type.as_deref(), Some("routing"));
    }
}
