//! Gemini dialect handling.
//!
//! Translation between generate-content payloads and the OpenAI normal
//! form. The model and the streaming mode ride in the URL, not the body.

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Map, Value};

use crate::forward::context::TokenUsage;
use crate::store::channels::Channel;

use super::openai::append_channel_headers;

pub fn chat_path(model: &str, streaming: bool) -> String {
    if streaming {
        format!("/v1beta/models/{}:streamGenerateContent?alt=sse", model)
    } else {
        format!("/v1beta/models/{}:generateContent", model)
    }
}

/// `x-goog-api-key` auth; `?key=` also works upstream but the header keeps
/// the key out of logged URLs.
pub fn build_headers(channel: &Channel) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if !channel.api_key.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&channel.api_key) {
            headers.insert("x-goog-api-key", value);
        }
    }
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    append_channel_headers(&mut headers, channel);
    headers
}

pub fn extract_usage(body: &Value) -> TokenUsage {
    let usage = body.get("usageMetadata").cloned().unwrap_or(Value::Null);
    let get = |key: &str| usage.get(key).and_then(|v| v.as_i64()).unwrap_or(0);
    let cached = get("cachedContentTokenCount");
    TokenUsage {
        input_tokens: (get("promptTokenCount") - cached).max(0),
        output_tokens: get("candidatesTokenCount"),
        cache_read_tokens: cached,
        cache_creation_tokens: 0,
    }
}

pub fn usage_from_stream_frame(frame: &Value, usage: &mut TokenUsage) {
    if frame.get("usageMetadata").is_some() {
        usage.absorb(&extract_usage(frame));
    }
}

pub fn request_id(body: &Value) -> Option<String> {
    body.get("responseId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn map_finish_reason_to_openai(reason: &str) -> &'static str {
    match reason {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => "content_filter",
        _ => "stop",
    }
}

fn map_finish_reason_to_gemini(reason: &str) -> &'static str {
    match reason {
        "stop" => "STOP",
        "length" => "MAX_TOKENS",
        "content_filter" => "SAFETY",
        _ => "STOP",
    }
}

fn parts_text(content: &Value) -> String {
    let mut text = String::new();
    if let Some(parts) = content.get("parts").and_then(|p| p.as_array()) {
        for part in parts {
            if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                text.push_str(t);
            }
        }
    }
    text
}

fn openai_content_to_parts(content: &Value) -> Vec<Value> {
    let mut parts = Vec::new();
    match content {
        Value::String(text) => {
            if !text.is_empty() {
                parts.push(json!({"text": text}));
            }
        }
        Value::Array(items) => {
            for item in items {
                match item.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                            parts.push(json!({"text": text}));
                        }
                    }
                    Some("image_url") => {
                        let url = item
                            .get("image_url")
                            .and_then(|i| i.get("url"))
                            .and_then(|u| u.as_str())
                            .unwrap_or("");
                        if let Some((media_type, data)) = url
                            .strip_prefix("data:")
                            .and_then(|rest| rest.split_once(";base64,"))
                        {
                            parts.push(json!({
                                "inlineData": {"mimeType": media_type, "data": data}
                            }));
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    parts
}

/// Chat-completions form -> generate-content request.
pub fn request_from_openai(payload: &Value, _model: &str) -> Value {
    let mut out = Map::new();
    let mut contents = Vec::new();
    let mut system_parts = Vec::new();

    if let Some(messages) = payload.get("messages").and_then(|v| v.as_array()) {
        for msg in messages {
            let role = msg.get("role").and_then(|v| v.as_str()).unwrap_or("user");
            let content = msg.get("content").cloned().unwrap_or(Value::Null);

            if role.eq_ignore_ascii_case("system") {
                if let Value::String(text) = &content {
                    if !text.is_empty() {
                        system_parts.push(json!({"text": text}));
                    }
                }
                continue;
            }

            let parts = openai_content_to_parts(&content);
            if parts.is_empty() {
                continue;
            }
            let gemini_role = if role.eq_ignore_ascii_case("assistant") {
                "model"
            } else {
                "user"
            };
            contents.push(json!({"role": gemini_role, "parts": parts}));
        }
    }

    out.insert("contents".to_string(), Value::Array(contents));
    if !system_parts.is_empty() {
        out.insert(
            "systemInstruction".to_string(),
            json!({"parts": system_parts}),
        );
    }

    let mut generation = Map::new();
    if let Some(v) = payload
        .get("max_tokens")
        .or_else(|| payload.get("max_completion_tokens"))
    {
        generation.insert("maxOutputTokens".to_string(), v.clone());
    }
    if let Some(v) = payload.get("temperature") {
        generation.insert("temperature".to_string(), v.clone());
    }
    if let Some(v) = payload.get("top_p") {
        generation.insert("topP".to_string(), v.clone());
    }
    if let Some(stop) = payload.get("stop") {
        let sequences = match stop {
            Value::String(s) => json!([s]),
            other => other.clone(),
        };
        generation.insert("stopSequences".to_string(), sequences);
    }
    if !generation.is_empty() {
        out.insert("generationConfig".to_string(), Value::Object(generation));
    }

    Value::Object(out)
}

/// Generate-content request -> chat-completions form.
pub fn request_to_openai(payload: &Value, model: &str) -> Value {
    let mut messages = Vec::new();

    if let Some(system) = payload.get("systemInstruction") {
        let text = parts_text(system);
        if !text.is_empty() {
            messages.push(json!({"role": "system", "content": text}));
        }
    }

    if let Some(contents) = payload.get("contents").and_then(|v| v.as_array()) {
        for content in contents {
            let role = match content.get("role").and_then(|v| v.as_str()) {
                Some("model") => "assistant",
                _ => "user",
            };
            let text = parts_text(content);
            messages.push(json!({"role": role, "content": text}));
        }
    }

    let mut out = Map::new();
    out.insert("model".to_string(), Value::String(model.to_string()));
    out.insert("messages".to_string(), Value::Array(messages));

    if let Some(config) = payload.get("generationConfig") {
        if let Some(v) = config.get("maxOutputTokens") {
            out.insert("max_tokens".to_string(), v.clone());
        }
        if let Some(v) = config.get("temperature") {
            out.insert("temperature".to_string(), v.clone());
        }
        if let Some(v) = config.get("topP") {
            out.insert("top_p".to_string(), v.clone());
        }
        if let Some(v) = config.get("stopSequences") {
            out.insert("stop".to_string(), v.clone());
        }
    }

    Value::Object(out)
}

/// Generate-content response -> chat-completions response.
pub fn response_to_openai(body: &Value, model: &str) -> Value {
    let candidate = body
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .cloned()
        .unwrap_or(Value::Null);
    let text = candidate
        .get("content")
        .map(parts_text)
        .unwrap_or_default();
    let finish = candidate
        .get("finishReason")
        .and_then(|v| v.as_str())
        .map(map_finish_reason_to_openai)
        .unwrap_or("stop");
    let usage = extract_usage(body);

    json!({
        "id": body.get("responseId").cloned()
            .unwrap_or(Value::String("chatcmpl-unknown".to_string())),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": finish
        }],
        "usage": {
            "prompt_tokens": usage.input_tokens + usage.cache_read_tokens,
            "completion_tokens": usage.output_tokens,
            "total_tokens": usage.total()
        }
    })
}

/// Chat-completions response -> generate-content response.
pub fn response_from_openai(body: &Value, _model: &str) -> Value {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .cloned()
        .unwrap_or(Value::Null);
    let text = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("");
    let finish = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(map_finish_reason_to_gemini)
        .unwrap_or("STOP");

    let usage = body.get("usage").cloned().unwrap_or(Value::Null);
    let prompt = usage.get("prompt_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
    let completion = usage
        .get("completion_tokens")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": text}]},
            "finishReason": finish,
            "index": 0
        }],
        "usageMetadata": {
            "promptTokenCount": prompt,
            "candidatesTokenCount": completion,
            "totalTokenCount": prompt + completion
        }
    })
}

// ----------------------------------------------------------------------------
// Streaming state machines
// ----------------------------------------------------------------------------

/// Consumes generate-content stream chunks, emits chat-completions chunks.
pub struct StreamToOpenAI {
    model: String,
    id: String,
    created: i64,
    sent_role: bool,
}

impl StreamToOpenAI {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: Utc::now().timestamp(),
            sent_role: false,
        }
    }

    pub fn feed(&mut self, frame: &Value) -> Vec<Value> {
        let mut out = Vec::new();
        let candidate = frame
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .cloned()
            .unwrap_or(Value::Null);

        let mut delta = Map::new();
        if !self.sent_role {
            self.sent_role = true;
            delta.insert("role".to_string(), json!("assistant"));
        }
        let text = candidate.get("content").map(parts_text).unwrap_or_default();
        if !text.is_empty() {
            delta.insert("content".to_string(), json!(text));
        }

        let finish = candidate
            .get("finishReason")
            .and_then(|v| v.as_str())
            .map(|r| Value::String(map_finish_reason_to_openai(r).to_string()))
            .unwrap_or(Value::Null);

        if delta.is_empty() && finish.is_null() {
            return out;
        }

        let mut chunk = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{"index": 0, "delta": Value::Object(delta), "finish_reason": finish}]
        });
        if frame.get("usageMetadata").is_some() {
            let usage = extract_usage(frame);
            chunk["usage"] = json!({
                "prompt_tokens": usage.input_tokens + usage.cache_read_tokens,
                "completion_tokens": usage.output_tokens,
                "total_tokens": usage.total()
            });
        }
        out.push(chunk);
        out
    }
}

/// Consumes chat-completions chunks, emits generate-content stream frames.
pub struct StreamFromOpenAI {
    finished: bool,
}

impl StreamFromOpenAI {
    pub fn new() -> Self {
        Self { finished: false }
    }

    pub fn feed(&mut self, chunk: &Value) -> Vec<Value> {
        if self.finished {
            return Vec::new();
        }
        let Some(choice) = chunk
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        else {
            return Vec::new();
        };

        let text = choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or("");
        let finish = choice.get("finish_reason").and_then(|v| v.as_str());

        if text.is_empty() && finish.is_none() {
            return Vec::new();
        }

        let mut candidate = json!({
            "content": {"role": "model", "parts": [{"text": text}]},
            "index": 0
        });
        if let Some(reason) = finish {
            self.finished = true;
            candidate["finishReason"] = json!(map_finish_reason_to_gemini(reason));
        }

        let mut frame = json!({"candidates": [candidate]});
        if let Some(usage) = chunk.get("usage") {
            let prompt = usage.get("prompt_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
            let completion = usage
                .get("completion_tokens")
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            frame["usageMetadata"] = json!({
                "promptTokenCount": prompt,
                "candidatesTokenCount": completion,
                "totalTokenCount": prompt + completion
            });
        }
        vec![frame]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_selects_stream_action() {
        assert_eq!(
            chat_path("gemini-1.5-pro", false),
            "/v1beta/models/gemini-1.5-pro:generateContent"
        );
        assert!(chat_path("gemini-1.5-pro", true).contains(":streamGenerateContent?alt=sse"));
    }

    #[test]
    fn request_translation_moves_system_and_params() {
        let openai = json!({
            "model": "x",
            "messages": [
                {"role": "system", "content": "terse"},
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "hi"}
            ],
            "max_tokens": 64,
            "temperature": 0.2,
            "stop": "END"
        });
        let gemini = request_from_openai(&openai, "gemini-1.5-pro");
        assert_eq!(gemini["systemInstruction"]["parts"][0]["text"], "terse");
        assert_eq!(gemini["contents"][0]["role"], "user");
        assert_eq!(gemini["contents"][1]["role"], "model");
        assert_eq!(gemini["generationConfig"]["maxOutputTokens"], 64);
        assert_eq!(gemini["generationConfig"]["stopSequences"], json!(["END"]));

        let back = request_to_openai(&gemini, "gpt-4o");
        assert_eq!(back["messages"][0]["role"], "system");
        assert_eq!(back["messages"][1]["content"], "hello");
        assert_eq!(back["max_tokens"], 64);
    }

    #[test]
    fn response_translation_and_usage() {
        let gemini = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "answer"}]},
                "finishReason": "MAX_TOKENS"
            }],
            "usageMetadata": {
                "promptTokenCount": 12,
                "candidatesTokenCount": 7,
                "cachedContentTokenCount": 2
            }
        });
        let openai = response_to_openai(&gemini, "gemini-1.5-pro");
        assert_eq!(openai["choices"][0]["message"]["content"], "answer");
        assert_eq!(openai["choices"][0]["finish_reason"], "length");
        let usage = extract_usage(&gemini);
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.cache_read_tokens, 2);

        let back = response_from_openai(&openai, "gemini-1.5-pro");
        assert_eq!(back["candidates"][0]["finishReason"], "MAX_TOKENS");
        assert_eq!(back["candidates"][0]["content"]["parts"][0]["text"], "answer");
    }

    #[test]
    fn stream_to_openai_sends_role_once() {
        let mut state = StreamToOpenAI::new("gemini-1.5-pro");
        let first = state.feed(&json!({
            "candidates": [{"content": {"parts": [{"text": "He"}]}}]
        }));
        assert_eq!(first[0]["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(first[0]["choices"][0]["delta"]["content"], "He");

        let second = state.feed(&json!({
            "candidates": [{"content": {"parts": [{"text": "llo"}]}, "finishReason": "STOP"}]
        }));
        assert!(second[0]["choices"][0]["delta"].get("role").is_none());
        assert_eq!(second[0]["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn stream_from_openai_stops_after_finish() {
        let mut state = StreamFromOpenAI::new();
        let frames = state.feed(&json!({
            "choices": [{"delta": {"content": "hi"}, "finish_reason": "stop"}]
        }));
        assert_eq!(frames[0]["candidates"][0]["finishReason"], "STOP");
        assert!(state
            .feed(&json!({"choices": [{"delta": {"content": "late"}}]}))
            .is_empty());
    }
}
