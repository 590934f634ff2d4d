//! OpenAI dialect handling.
//!
//! OpenAI chat completions are the normal form every other dialect
//! translates through, so this module is mostly field hygiene, header
//! injection, and usage extraction.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use crate::forward::context::TokenUsage;
use crate::store::channels::Channel;

/// Fields accepted by chat-completions upstreams; everything else is
/// dropped before forwarding.
const ALLOWED_FIELDS: &[&str] = &[
    "model",
    "messages",
    "max_tokens",
    "max_completion_tokens",
    "temperature",
    "top_p",
    "n",
    "stream",
    "stream_options",
    "stop",
    "presence_penalty",
    "frequency_penalty",
    "logit_bias",
    "user",
    "tools",
    "tool_choice",
    "parallel_tool_calls",
    "response_format",
    "seed",
    "logprobs",
    "top_logprobs",
    "service_tier",
    "store",
    "reasoning_effort",
    "metadata",
];

pub fn chat_path(_model: &str, _streaming: bool) -> &'static str {
    "/v1/chat/completions"
}

/// Bearer auth plus any operator-configured extra headers.
pub fn build_headers(channel: &Channel) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if !channel.api_key.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", channel.api_key)) {
            headers.insert("authorization", value);
        }
    }
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    append_channel_headers(&mut headers, channel);
    headers
}

pub fn append_channel_headers(headers: &mut HeaderMap, channel: &Channel) {
    for (name, value) in &channel.headers {
        let Ok(name) = name.parse::<HeaderName>() else {
            continue;
        };
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }
}

/// Keep only the allowed fields, pin the model, and normalize `stream` to a
/// boolean.
pub fn prepare_request(payload: &Value, model: &str, streaming: bool) -> Value {
    let mut out = serde_json::Map::new();
    if let Some(obj) = payload.as_object() {
        for (key, value) in obj {
            if ALLOWED_FIELDS.contains(&key.as_str()) {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out.insert("model".to_string(), Value::String(model.to_string()));
    if streaming {
        out.insert("stream".to_string(), Value::Bool(true));
        out.insert(
            "stream_options".to_string(),
            serde_json::json!({"include_usage": true}),
        );
    } else {
        out.remove("stream");
        out.remove("stream_options");
    }
    Value::Object(out)
}

/// Usage counts from a chat-completions response or stream chunk.
pub fn extract_usage(body: &Value) -> TokenUsage {
    let usage = body.get("usage").cloned().unwrap_or(Value::Null);
    let get = |key: &str| usage.get(key).and_then(|v| v.as_i64()).unwrap_or(0);
    let cached = usage
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    TokenUsage {
        input_tokens: (get("prompt_tokens") - cached).max(0),
        output_tokens: get("completion_tokens"),
        cache_read_tokens: cached,
        cache_creation_tokens: 0,
    }
}

pub fn usage_from_stream_frame(frame: &Value, usage: &mut TokenUsage) {
    if frame.get("usage").map(|u| !u.is_null()).unwrap_or(false) {
        usage.absorb(&extract_usage(frame));
    }
}

/// Concatenated text deltas of a stream chunk, for estimate fallback.
pub fn chunk_delta_text(frame: &Value) -> String {
    let mut text = String::new();
    if let Some(choices) = frame.get("choices").and_then(|c| c.as_array()) {
        for choice in choices {
            if let Some(delta) = choice.get("delta") {
                if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
                    text.push_str(content);
                }
                if let Some(reasoning) = delta.get("reasoning_content").and_then(|c| c.as_str()) {
                    text.push_str(reasoning);
                }
            }
        }
    }
    text
}

pub fn request_id(body: &Value) -> Option<String> {
    body.get("id").and_then(|v| v.as_str()).map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_filters_unknown_fields_and_pins_model() {
        let payload = serde_json::json!({
            "model": "client-alias",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.5,
            "x_custom_junk": true,
            "stream": "yes"
        });
        let out = prepare_request(&payload, "gpt-4o", false);
        assert_eq!(out["model"], "gpt-4o");
        assert_eq!(out["temperature"], 0.5);
        assert!(out.get("x_custom_junk").is_none());
        assert!(out.get("stream").is_none());

        let streaming = prepare_request(&payload, "gpt-4o", true);
        assert_eq!(streaming["stream"], true);
        assert_eq!(streaming["stream_options"]["include_usage"], true);
    }

    #[test]
    fn usage_extraction_with_cached_tokens() {
        let body = serde_json::json!({
            "usage": {
                "prompt_tokens": 120,
                "completion_tokens": 30,
                "prompt_tokens_details": {"cached_tokens": 100}
            }
        });
        let usage = extract_usage(&body);
        assert_eq!(usage.input_tokens, 20);
        assert_eq!(usage.cache_read_tokens, 100);
        assert_eq!(usage.output_tokens, 30);
    }

    #[test]
    fn delta_text_accumulates_content_and_reasoning() {
        let frame = serde_json::json!({
            "choices": [{"delta": {"content": "Hello ", "reasoning_content": "hmm"}}]
        });
        assert_eq!(chunk_delta_text(&frame), "Hello hmm");
    }
}
