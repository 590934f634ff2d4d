//! Dispatcher.
//!
//! The admission-to-settlement pipeline: authenticate, precheck funding,
//! rewrite the model, select a channel, persist the request log, translate,
//! forward through the retrying transport, stream back, and finalize. Cost
//! and settlement run after the response has been delivered; their failures
//! are visible only on the request log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::Value;

use crate::billing;
use crate::pricing::{self, PriceTable};
use crate::selector;
use crate::server::AppState;
use crate::store::request_logs::RequestCompletion;
use crate::store::Store;

use super::context::{estimate_tokens, Provider, TokenUsage};
use super::error::{ProxyError, ProxyResult};
use super::handlers::{self, StreamTranslator};
use super::middleware;
use super::transport::{self, UpstreamOutcome, UpstreamRequest};

/// Everything the finalizer needs once the response side is done.
struct FinalizeCtx {
    store: Store,
    prices: PriceTable,
    log_id: String,
    user_id: String,
    pricing_model: String,
    multiplier: f64,
    started: Instant,
    status_code: i64,
}

async fn finalize(
    ctx: FinalizeCtx,
    usage: TokenUsage,
    request_id: Option<String>,
    error_type: Option<String>,
) {
    let completion = RequestCompletion {
        status_code: ctx.status_code,
        latency_ms: ctx.started.elapsed().as_millis() as i64,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_read_tokens: usage.cache_read_tokens,
        cache_creation_tokens: usage.cache_creation_tokens,
        error_type,
        upstream_request_id: request_id,
    };
    if let Err(e) = ctx.store.complete_request_log(&ctx.log_id, &completion).await {
        crate::logger::error(
            "dispatch",
            &format!("Request log completion failed for {}: {}", ctx.log_id, e),
        );
    }

    let result = ctx.prices.cost(&ctx.pricing_model, &usage);
    if !result.price_found && usage.total() > 0 {
        crate::logger::warn(
            "pricing",
            &format!("No price for model '{}'; cost recorded as 0", ctx.pricing_model),
        );
    }
    let cost = pricing::apply_multiplier(result.cost_micros, ctx.multiplier);

    // One retry; idempotency makes the second attempt safe. A permanent
    // failure leaves the log pending for manual reconciliation.
    for attempt in 1..=2 {
        match billing::settle(&ctx.store, &ctx.log_id, &ctx.user_id, cost).await {
            Ok(_) => break,
            Err(e) if attempt == 1 => {
                crate::logger::warn(
                    "billing",
                    &format!("Settlement attempt failed for {}: {}; retrying", ctx.log_id, e),
                );
            }
            Err(e) => {
                crate::logger::error(
                    "billing",
                    &format!("Settlement failed for {}; left pending: {}", ctx.log_id, e),
                );
            }
        }
    }
}

fn spawn_finalize(
    ctx: FinalizeCtx,
    usage: TokenUsage,
    request_id: Option<String>,
    error_type: Option<String>,
) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(finalize(ctx, usage, request_id, error_type));
    }
}

/// Single-shot guard held from request-log admission until the response
/// side has a definite outcome. If the task is cancelled first (client
/// disconnect while the upstream call or body translation is in flight),
/// `Drop` finalizes the log as `client_closed` instead of leaving it
/// `pending` forever.
struct FinalizeGuard {
    ctx: Option<FinalizeCtx>,
}

impl FinalizeGuard {
    fn new(ctx: FinalizeCtx) -> Self {
        Self { ctx: Some(ctx) }
    }

    fn complete(
        &mut self,
        status_code: i64,
        usage: TokenUsage,
        request_id: Option<String>,
        error_type: Option<String>,
    ) {
        if let Some(mut ctx) = self.ctx.take() {
            ctx.status_code = status_code;
            spawn_finalize(ctx, usage, request_id, error_type);
        }
    }

    /// Hand the context over to the streaming finalizer; the guard becomes
    /// inert.
    fn into_ctx(mut self) -> Option<FinalizeCtx> {
        self.ctx.take()
    }
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            spawn_finalize(
                ctx,
                TokenUsage::default(),
                None,
                Some("client_closed".to_string()),
            );
        }
    }
}

/// Shared between the response stream and its completion tail. If the
/// stream is dropped before completion (client disconnect), `Drop` still
/// finalizes the log with `client_closed` and whatever usage was observed.
struct StreamFinalizer {
    ctx: Mutex<Option<FinalizeCtx>>,
    translator: Mutex<StreamTranslator>,
}

impl StreamFinalizer {
    fn complete(&self, error_type: Option<String>) {
        let Some(ctx) = self.ctx.lock().expect("finalizer lock").take() else {
            return;
        };
        let (usage, request_id) = {
            let translator = self.translator.lock().expect("translator lock");
            (translator.usage(), translator.request_id())
        };
        spawn_finalize(ctx, usage, request_id, error_type);
    }
}

impl Drop for StreamFinalizer {
    fn drop(&mut self) {
        // No-op when the tail already completed.
        self.complete(Some("client_closed".to_string()));
    }
}

fn extract_model(payload: &Value, model_hint: Option<&str>) -> ProxyResult<String> {
    if let Some(model) = payload
        .get("model")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
    {
        return Ok(model.to_string());
    }
    if let Some(hint) = model_hint.filter(|s| !s.is_empty()) {
        return Ok(hint.to_string());
    }
    Err(ProxyError::Routing("missing 'model' field".to_string()))
}

fn is_streaming_payload(payload: &Value) -> bool {
    match payload.get("stream") {
        Some(Value::Bool(stream)) => *stream,
        Some(Value::Number(value)) => value.as_i64().map(|v| v != 0).unwrap_or(false),
        Some(Value::String(value)) => {
            matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
        }
        _ => false,
    }
}

fn prompt_estimate(payload: &Value) -> i64 {
    let text = payload
        .get("messages")
        .or_else(|| payload.get("contents"))
        .map(|m| m.to_string())
        .unwrap_or_default();
    estimate_tokens(&text)
}

/// Headers copied verbatim when proxying an upstream error; hop-by-hop and
/// framing headers are recomputed by axum.
fn sanitized_headers(headers: &reqwest::header::HeaderMap) -> Vec<(String, Vec<u8>)> {
    const DROP: &[&str] = &[
        "connection",
        "keep-alive",
        "transfer-encoding",
        "content-length",
        "content-encoding",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "upgrade",
        "set-cookie",
    ];
    headers
        .iter()
        .filter(|(name, _)| !DROP.contains(&name.as_str().to_ascii_lowercase().as_str()))
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect()
}

/// Inject the recorded thinking level into the upstream request where the
/// provider has a knob for it.
fn apply_thinking_level(body: &mut Value, upstream: Provider, level: &str) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    match upstream {
        Provider::Claude => {
            let budget = match level {
                "low" => 1024,
                "high" => 16384,
                _ => 4096,
            };
            obj.insert(
                "thinking".to_string(),
                serde_json::json!({"type": "enabled", "budget_tokens": budget}),
            );
        }
        Provider::OpenAI => {
            obj.insert(
                "reasoning_effort".to_string(),
                Value::String(level.to_string()),
            );
        }
        Provider::Gemini => {}
    }
}

/// Run the full pipeline for one inbound request.
pub async fn dispatch(
    state: AppState,
    client_dialect: Provider,
    headers: HeaderMap,
    query: HashMap<String, String>,
    path: String,
    payload: Value,
    model_hint: Option<String>,
    force_streaming: bool,
) -> Response {
    match dispatch_inner(
        state,
        client_dialect,
        headers,
        query,
        path,
        payload,
        model_hint,
        force_streaming,
    )
    .await
    {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_inner(
    state: AppState,
    client_dialect: Provider,
    headers: HeaderMap,
    query: HashMap<String, String>,
    path: String,
    payload: Value,
    model_hint: Option<String>,
    force_streaming: bool,
) -> ProxyResult<Response> {
    let started = Instant::now();

    // 1-2. Authenticate and precheck; failures leave no trace in the store.
    let (user, api_key) = middleware::authenticate(&state.store, &headers, &query).await?;
    middleware::precheck_funding(&state.store, &user).await?;

    // 3. Model mapping rewrite.
    let original_model = extract_model(&payload, model_hint.as_deref())?;
    let (mapped_model, thinking_level) =
        middleware::apply_model_mapping(&state.store, &user.id, &original_model).await?;
    let is_streaming = force_streaming || is_streaming_payload(&payload);

    // 4. Channel selection.
    let channels = state.store.list_enabled_channels().await?;
    let Some(channel) = selector::select(&channels, &state.rr, &mapped_model) else {
        state
            .store
            .insert_routing_failure(&user.id, &api_key.id, &original_model, &mapped_model, &path)
            .await?;
        return Err(ProxyError::Routing(format!(
            "no channel serves model '{}'",
            mapped_model
        )));
    };
    let upstream = channel.channel_type;

    let multiplier = state.store.user_rate_multiplier(&user.id).await?;

    // 5. Request log before the outbound call.
    let request_detail = if state.hot.request_detail_enabled() {
        serde_json::to_string(&payload).ok()
    } else {
        None
    };
    let log_id = state
        .store
        .insert_request_log(crate::store::request_logs::NewRequestLog {
            user_id: user.id.clone(),
            api_key_id: api_key.id.clone(),
            original_model: original_model.clone(),
            mapped_model: mapped_model.clone(),
            provider: upstream.as_str().to_string(),
            channel_id: channel.id.clone(),
            endpoint: channel.base_url.clone(),
            method: "POST".to_string(),
            path: path.clone(),
            is_streaming,
            rate_multiplier: multiplier,
            request_detail,
        })
        .await?;

    // The log exists now; from here every exit, including task
    // cancellation, must finalize it.
    let mut guard = FinalizeGuard::new(FinalizeCtx {
        store: state.store.clone(),
        prices: state.prices.clone(),
        log_id: log_id.clone(),
        user_id: user.id.clone(),
        pricing_model: mapped_model.clone(),
        multiplier,
        started,
        status_code: 0,
    });

    // 6. Translate into the upstream dialect.
    let mut body =
        handlers::translate_request(client_dialect, upstream, &payload, &mapped_model, is_streaming);
    if let Some(level) = thinking_level.as_deref() {
        apply_thinking_level(&mut body, upstream, level);
    }
    let body_bytes = match serde_json::to_vec(&body) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            guard.complete(0, TokenUsage::default(), None, Some("translation".to_string()));
            return Err(ProxyError::Translation(format!(
                "failed to serialize upstream request: {}",
                e
            )));
        }
    };

    let url = format!(
        "{}{}",
        channel.base_url,
        handlers::chat_path(upstream, &mapped_model, is_streaming)
    );
    let upstream_headers = handlers::build_headers(upstream, &channel);

    // 7. Forward through the retrying transport.
    let request = UpstreamRequest {
        method: reqwest::Method::POST,
        url,
        headers: upstream_headers,
        body: body_bytes,
        expect_stream: is_streaming,
        idempotent: true,
    };
    let retry_cfg = state.hot.retry();
    let timeout_cfg = state.hot.timeouts();
    let outcome = match transport::send_with_retry(&request, &retry_cfg, &timeout_cfg).await {
        Ok(outcome) => outcome,
        Err(e) => {
            guard.complete(
                e.status().as_u16() as i64,
                TokenUsage::default(),
                None,
                Some(e.error_type().to_string()),
            );
            return Err(e);
        }
    };

    // 8-9. Stream or buffer back, then finalize.
    match outcome {
        UpstreamOutcome::Buffered(resp) => {
            if (200..300).contains(&(resp.status as i32)) {
                let parsed: Value = match serde_json::from_slice(&resp.body) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        guard.complete(
                            resp.status as i64,
                            TokenUsage::default(),
                            None,
                            Some("translation".to_string()),
                        );
                        return Err(ProxyError::Translation(format!(
                            "unparsable upstream body: {}",
                            e
                        )));
                    }
                };

                let mut usage = handlers::extract_usage(upstream, &parsed);
                if usage.input_tokens == 0 && usage.cache_read_tokens == 0 {
                    usage.input_tokens = prompt_estimate(&payload);
                }
                let request_id = handlers::extract_request_id(upstream, &parsed);
                let translated =
                    handlers::translate_response(upstream, client_dialect, &parsed, &mapped_model);

                crate::logger::info(
                    "dispatch",
                    &format!(
                        "Request completed: model={} channel={} attempts={} tokens={}/{}",
                        mapped_model,
                        channel.id,
                        resp.attempts,
                        usage.input_tokens,
                        usage.output_tokens
                    ),
                );
                guard.complete(resp.status as i64, usage, request_id, None);
                Ok(axum::Json(translated).into_response())
            } else {
                // Upstream error: surface it verbatim after sanitizing.
                guard.complete(
                    resp.status as i64,
                    TokenUsage::default(),
                    None,
                    Some("upstream".to_string()),
                );
                let mut builder = Response::builder()
                    .status(StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY));
                for (name, value) in sanitized_headers(&resp.headers) {
                    builder = builder.header(name, value);
                }
                builder.body(Body::from(resp.body)).map_err(|e| {
                    ProxyError::Upstream(format!("failed to build error response: {}", e))
                })
            }
        }

        UpstreamOutcome::Streaming(streaming) => {
            let translator = StreamTranslator::new(
                upstream,
                client_dialect,
                &mapped_model,
                prompt_estimate(&payload),
            );
            // The gate is committed; ownership of finalization moves from
            // the admission guard to the stream's own drop guard.
            let mut ctx = guard.into_ctx();
            if let Some(ctx) = ctx.as_mut() {
                ctx.status_code = streaming.status as i64;
            }
            let finalizer = Arc::new(StreamFinalizer {
                ctx: Mutex::new(ctx),
                translator: Mutex::new(translator),
            });

            // Bytes probed while the gate was deciding.
            let mut head_out = Vec::new();
            {
                let mut translator = finalizer.translator.lock().expect("translator lock");
                for chunk in &streaming.head {
                    let out = translator.feed(chunk);
                    if !out.is_empty() {
                        head_out.push(Ok::<Bytes, std::io::Error>(out));
                    }
                }
            }

            let map_finalizer = Arc::clone(&finalizer);
            let mapped = streaming.rest.map(move |result| match result {
                Ok(bytes) => {
                    let out = map_finalizer
                        .translator
                        .lock()
                        .expect("translator lock")
                        .feed(&bytes);
                    Ok::<Bytes, std::io::Error>(out)
                }
                Err(e) => {
                    crate::logger::warn("dispatch", &format!("Upstream stream error: {}", e));
                    Err(std::io::Error::other(e.to_string()))
                }
            });

            let tail_finalizer = Arc::clone(&finalizer);
            let tail = futures_util::stream::once(async move {
                let out = tail_finalizer
                    .translator
                    .lock()
                    .expect("translator lock")
                    .finish();
                tail_finalizer.complete(None);
                Ok::<Bytes, std::io::Error>(out)
            });

            let body_stream = futures_util::stream::iter(head_out)
                .chain(mapped)
                .chain(tail)
                .filter(|item| {
                    let keep = match item {
                        Ok(bytes) => !bytes.is_empty(),
                        Err(_) => true,
                    };
                    async move { keep }
                });

            crate::logger::info(
                "dispatch",
                &format!(
                    "Stream committed: model={} channel={} attempts={}",
                    mapped_model, channel.id, streaming.attempts
                ),
            );

            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/event-stream")
                .header("cache-control", "no-cache")
                .body(Body::from_stream(body_stream))
                .map_err(|e| ProxyError::Upstream(format!("failed to build stream response: {}", e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::request_logs::{BillingStatus, NewRequestLog};

    fn pending_log(user_id: &str) -> NewRequestLog {
        NewRequestLog {
            user_id: user_id.to_string(),
            api_key_id: "k1".to_string(),
            original_model: "gpt-4o".to_string(),
            mapped_model: "gpt-4o".to_string(),
            provider: "openai".to_string(),
            channel_id: "c1".to_string(),
            endpoint: "https://upstream.invalid".to_string(),
            method: "POST".to_string(),
            path: "/v1/chat/completions".to_string(),
            is_streaming: false,
            rate_multiplier: 1.0,
            request_detail: None,
        }
    }

    fn guard_for(store: &Store, log_id: &str, user_id: &str) -> FinalizeGuard {
        FinalizeGuard::new(FinalizeCtx {
            store: store.clone(),
            prices: PriceTable::default(),
            log_id: log_id.to_string(),
            user_id: user_id.to_string(),
            pricing_model: "gpt-4o".to_string(),
            multiplier: 1.0,
            started: Instant::now(),
            status_code: 0,
        })
    }

    async fn wait_for_error_type(store: &Store, log_id: &str) -> Option<String> {
        for _ in 0..100 {
            let log = store.get_request_log(log_id).await.unwrap().unwrap();
            if log.billing_status != BillingStatus::Pending {
                return log.error_type;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("log never finalized");
    }

    #[tokio::test]
    async fn dropped_guard_finalizes_log_as_client_closed() {
        let store = Store::open_temp().unwrap();
        let user = store.create_user("drop-user", "h", false, 0).await.unwrap();
        let log_id = store.insert_request_log(pending_log(&user.id)).await.unwrap();

        // Simulates task cancellation before an outcome was reached.
        drop(guard_for(&store, &log_id, &user.id));

        let error_type = wait_for_error_type(&store, &log_id).await;
        assert_eq!(error_type.as_deref(), Some("client_closed"));
        let log = store.get_request_log(&log_id).await.unwrap().unwrap();
        assert_eq!(log.billing_status, BillingStatus::Free);
    }

    #[tokio::test]
    async fn completed_guard_does_not_finalize_again_on_drop() {
        let store = Store::open_temp().unwrap();
        let user = store.create_user("done-user", "h", false, 0).await.unwrap();
        let log_id = store.insert_request_log(pending_log(&user.id)).await.unwrap();

        let mut guard = guard_for(&store, &log_id, &user.id);
        guard.complete(200, TokenUsage::default(), Some("req-1".to_string()), None);
        drop(guard);

        let error_type = wait_for_error_type(&store, &log_id).await;
        assert!(error_type.is_none());
        let log = store.get_request_log(&log_id).await.unwrap().unwrap();
        assert_eq!(log.status_code, 200);
        assert_eq!(log.upstream_request_id.as_deref(), Some("req-1"));
    }

    #[test]
    fn model_extraction_prefers_payload() {
        let payload = serde_json::json!({"model": "gpt-4o"});
        assert_eq!(extract_model(&payload, Some("hint")).unwrap(), "gpt-4o");
        let empty = serde_json::json!({});
        assert_eq!(extract_model(&empty, Some("hint")).unwrap(), "hint");
        assert!(extract_model(&empty, None).is_err());
    }

    #[test]
    fn streaming_flag_parsing() {
        assert!(is_streaming_payload(&serde_json::json!({"stream": true})));
        assert!(is_streaming_payload(&serde_json::json!({"stream": "yes"})));
        assert!(is_streaming_payload(&serde_json::json!({"stream": 1})));
        assert!(!is_streaming_payload(&serde_json::json!({"stream": false})));
        assert!(!is_streaming_payload(&serde_json::json!({})));
    }

    #[test]
    fn sanitizer_drops_hop_by_hop_headers() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("set-cookie", "a=b".parse().unwrap());
        headers.insert("x-request-id", "r1".parse().unwrap());
        let kept = sanitized_headers(&headers);
        let names: Vec<&str> = kept.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"content-type"));
        assert!(names.contains(&"x-request-id"));
        assert!(!names.contains(&"transfer-encoding"));
        assert!(!names.contains(&"set-cookie"));
    }

    #[test]
    fn thinking_level_maps_per_provider() {
        let mut body = serde_json::json!({});
        apply_thinking_level(&mut body, Provider::Claude, "high");
        assert_eq!(body["thinking"]["budget_tokens"], 16384);

        let mut body = serde_json::json!({});
        apply_thinking_level(&mut body, Provider::OpenAI, "low");
        assert_eq!(body["reasoning_effort"], "low");
    }
}
