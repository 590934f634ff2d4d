//! Claude (Anthropic messages) dialect handling.
//!
//! Bidirectional translation between the messages dialect and the OpenAI
//! chat-completions normal form, including the streaming event mapping in
//! both directions.

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Map, Value};

use crate::forward::context::TokenUsage;
use crate::store::channels::Channel;

use super::openai::append_channel_headers;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub fn chat_path(_model: &str, _streaming: bool) -> &'static str {
    "/v1/messages"
}

/// `x-api-key` auth plus the pinned API version.
pub fn build_headers(channel: &Channel) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if !channel.api_key.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&channel.api_key) {
            headers.insert("x-api-key", value);
        }
    }
    headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    append_channel_headers(&mut headers, channel);
    headers
}

/// Usage from a messages response; cache buckets stay separate so the cost
/// calculator can price them independently.
pub fn extract_usage(body: &Value) -> TokenUsage {
    let usage = body.get("usage").cloned().unwrap_or(Value::Null);
    let get = |key: &str| usage.get(key).and_then(|v| v.as_i64()).unwrap_or(0);
    TokenUsage {
        input_tokens: get("input_tokens"),
        output_tokens: get("output_tokens"),
        cache_read_tokens: get("cache_read_input_tokens"),
        cache_creation_tokens: get("cache_creation_input_tokens"),
    }
}

/// Usage fields scattered across stream events: `message_start` carries the
/// input side, `message_delta` the running output count.
pub fn usage_from_stream_frame(frame: &Value, usage: &mut TokenUsage) {
    match frame.get("type").and_then(|v| v.as_str()) {
        Some("message_start") => {
            if let Some(message) = frame.get("message") {
                usage.absorb(&extract_usage(message));
            }
        }
        Some("message_delta") => {
            if let Some(output) = frame
                .get("usage")
                .and_then(|u| u.get("output_tokens"))
                .and_then(|v| v.as_i64())
            {
                if output > 0 {
                    usage.output_tokens = output;
                }
            }
        }
        _ => {}
    }
}

pub fn request_id(body: &Value) -> Option<String> {
    body.get("id").and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn map_stop_reason_to_openai(reason: &str) -> &'static str {
    match reason {
        "end_turn" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        "stop_sequence" => "stop",
        _ => "stop",
    }
}

fn map_finish_reason_to_anthropic(reason: &str) -> &'static str {
    match reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        _ => "end_turn",
    }
}

fn openai_content_to_text(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let joined: Vec<&str> = parts
                .iter()
                .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect();
            Some(joined.join("\n"))
        }
        _ => None,
    }
}

fn openai_content_to_blocks(content: &Value) -> Vec<Value> {
    let mut blocks = Vec::new();
    match content {
        Value::String(text) => {
            if !text.is_empty() {
                blocks.push(json!({"type": "text", "text": text}));
            }
        }
        Value::Array(parts) => {
            for part in parts {
                match part.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                            blocks.push(json!({"type": "text", "text": text}));
                        }
                    }
                    Some("image_url") => {
                        let url = part
                            .get("image_url")
                            .and_then(|i| i.get("url"))
                            .and_then(|u| u.as_str())
                            .unwrap_or("");
                        if let Some(block) = data_url_to_image_block(url) {
                            blocks.push(block);
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    blocks
}

fn data_url_to_image_block(url: &str) -> Option<Value> {
    let rest = url.strip_prefix("data:")?;
    let (media_type, data) = rest.split_once(";base64,")?;
    Some(json!({
        "type": "image",
        "source": {"type": "base64", "media_type": media_type, "data": data}
    }))
}

fn image_block_to_openai_part(block: &Value) -> Value {
    let source = block.get("source");
    let media_type = source
        .and_then(|s| s.get("media_type"))
        .and_then(|v| v.as_str())
        .unwrap_or("application/octet-stream");
    let data = source
        .and_then(|s| s.get("data"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    json!({
        "type": "image_url",
        "image_url": {"url": format!("data:{};base64,{}", media_type, data)}
    })
}

/// Messages-dialect request -> chat-completions form.
pub fn request_to_openai(payload: &Value, model: &str) -> Value {
    let mut out = Map::new();
    out.insert("model".to_string(), Value::String(model.to_string()));

    let mut messages = Vec::new();
    if let Some(system) = payload.get("system") {
        let text = match system {
            Value::String(text) => Some(text.clone()),
            Value::Array(blocks) => Some(
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            ),
            _ => None,
        };
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            messages.push(json!({"role": "system", "content": text}));
        }
    }

    if let Some(inbound) = payload.get("messages").and_then(|v| v.as_array()) {
        for msg in inbound {
            let role = msg.get("role").and_then(|v| v.as_str()).unwrap_or("user");
            let mut parts = Vec::new();
            let mut tool_calls = Vec::new();
            let mut tool_messages = Vec::new();

            match msg.get("content") {
                Some(Value::String(text)) => {
                    if !text.is_empty() {
                        parts.push(json!({"type": "text", "text": text}));
                    }
                }
                Some(Value::Array(blocks)) => {
                    for block in blocks {
                        match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                            "text" => {
                                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                                    parts.push(json!({"type": "text", "text": text}));
                                }
                            }
                            "thinking" => {
                                if let Some(text) = block.get("thinking").and_then(|t| t.as_str()) {
                                    parts.push(json!({"type": "text", "text": text}));
                                }
                            }
                            "image" => parts.push(image_block_to_openai_part(block)),
                            "tool_use" => {
                                let args = serde_json::to_string(
                                    block.get("input").unwrap_or(&Value::Null),
                                )
                                .unwrap_or_else(|_| "{}".to_string());
                                tool_calls.push(json!({
                                    "id": block.get("id").and_then(|v| v.as_str()).unwrap_or("tool_call"),
                                    "type": "function",
                                    "function": {
                                        "name": block.get("name").and_then(|v| v.as_str()).unwrap_or("tool"),
                                        "arguments": args
                                    }
                                }));
                            }
                            "tool_result" => {
                                let content = match block.get("content") {
                                    Some(Value::String(text)) => text.clone(),
                                    Some(Value::Array(inner)) => inner
                                        .iter()
                                        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                                        .collect::<Vec<_>>()
                                        .join("\n"),
                                    Some(other) => other.to_string(),
                                    None => String::new(),
                                };
                                tool_messages.push(json!({
                                    "role": "tool",
                                    "tool_call_id": block
                                        .get("tool_use_id")
                                        .and_then(|v| v.as_str())
                                        .unwrap_or("tool_call"),
                                    "content": content
                                }));
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }

            let mut out_msg = Map::new();
            out_msg.insert("role".to_string(), Value::String(role.to_string()));
            out_msg.insert(
                "content".to_string(),
                match parts.len() {
                    0 => Value::String(String::new()),
                    1 if parts[0].get("type").and_then(|t| t.as_str()) == Some("text") => {
                        parts[0]["text"].clone()
                    }
                    _ => Value::Array(parts),
                },
            );
            if !tool_calls.is_empty() {
                out_msg.insert("tool_calls".to_string(), Value::Array(tool_calls));
            }
            messages.push(Value::Object(out_msg));
            messages.extend(tool_messages);
        }
    }
    out.insert("messages".to_string(), Value::Array(messages));

    if let Some(max_tokens) = payload.get("max_tokens") {
        out.insert("max_tokens".to_string(), max_tokens.clone());
    }
    for key in ["temperature", "top_p", "stream", "metadata"] {
        if let Some(value) = payload.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }
    if let Some(stop) = payload.get("stop_sequences") {
        out.insert("stop".to_string(), stop.clone());
    }
    if let Some(tools) = payload.get("tools").and_then(|t| t.as_array()) {
        let mapped: Vec<Value> = tools
            .iter()
            .filter_map(|tool| {
                let name = tool.get("name")?.as_str()?;
                Some(json!({
                    "type": "function",
                    "function": {
                        "name": name,
                        "description": tool.get("description").cloned().unwrap_or(Value::String(String::new())),
                        "parameters": tool.get("input_schema").cloned().unwrap_or(json!({}))
                    }
                }))
            })
            .collect();
        if !mapped.is_empty() {
            out.insert("tools".to_string(), Value::Array(mapped));
        }
    }

    Value::Object(out)
}

/// Chat-completions form -> messages-dialect request.
pub fn request_from_openai(payload: &Value, model: &str) -> Value {
    let mut out = Map::new();
    out.insert("model".to_string(), Value::String(model.to_string()));

    let mut system_parts = Vec::new();
    let mut messages = Vec::new();

    if let Some(inbound) = payload.get("messages").and_then(|v| v.as_array()) {
        for msg in inbound {
            let role = msg.get("role").and_then(|v| v.as_str()).unwrap_or("user");

            if role.eq_ignore_ascii_case("system") {
                if let Some(text) = msg.get("content").and_then(openai_content_to_text) {
                    if !text.is_empty() {
                        system_parts.push(text);
                    }
                }
                continue;
            }
            if role.eq_ignore_ascii_case("tool") {
                let content = msg
                    .get("content")
                    .and_then(openai_content_to_text)
                    .unwrap_or_default();
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": msg
                            .get("tool_call_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("tool_call"),
                        "content": content
                    }]
                }));
                continue;
            }

            let mut blocks = msg
                .get("content")
                .map(openai_content_to_blocks)
                .unwrap_or_default();
            if let Some(tool_calls) = msg.get("tool_calls").and_then(|v| v.as_array()) {
                for call in tool_calls {
                    let function = call.get("function").cloned().unwrap_or(Value::Null);
                    let input: Value = function
                        .get("arguments")
                        .and_then(|a| a.as_str())
                        .and_then(|a| serde_json::from_str(a).ok())
                        .unwrap_or(json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.get("id").and_then(|v| v.as_str()).unwrap_or("tool_call"),
                        "name": function.get("name").and_then(|v| v.as_str()).unwrap_or("tool"),
                        "input": input
                    }));
                }
            }
            if blocks.is_empty() {
                blocks.push(json!({"type": "text", "text": ""}));
            }

            let role = if role.eq_ignore_ascii_case("assistant") {
                "assistant"
            } else {
                "user"
            };
            messages.push(json!({"role": role, "content": blocks}));
        }
    }
    out.insert("messages".to_string(), Value::Array(messages));

    if !system_parts.is_empty() {
        out.insert("system".to_string(), Value::String(system_parts.join("\n\n")));
    }

    let max_tokens = payload
        .get("max_tokens")
        .or_else(|| payload.get("max_completion_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(4096);
    out.insert("max_tokens".to_string(), json!(max_tokens));

    for key in ["temperature", "top_p", "stream", "metadata"] {
        if let Some(value) = payload.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }
    if let Some(stop) = payload.get("stop") {
        let mapped = match stop {
            Value::String(text) => json!([text]),
            other => other.clone(),
        };
        out.insert("stop_sequences".to_string(), mapped);
    }
    if let Some(tools) = payload.get("tools").and_then(|t| t.as_array()) {
        let mapped: Vec<Value> = tools
            .iter()
            .filter_map(|tool| {
                let function = tool.get("function")?;
                Some(json!({
                    "name": function.get("name").and_then(|v| v.as_str())?,
                    "description": function.get("description").cloned().unwrap_or(Value::String(String::new())),
                    "input_schema": function.get("parameters").cloned().unwrap_or(json!({}))
                }))
            })
            .collect();
        if !mapped.is_empty() {
            out.insert("tools".to_string(), Value::Array(mapped));
        }
    }

    Value::Object(out)
}

/// Messages response -> chat-completions response.
pub fn response_to_openai(body: &Value, model: &str) -> Value {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    if let Some(blocks) = body.get("content").and_then(|c| c.as_array()) {
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                "text" => {
                    if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                        text.push_str(t);
                    }
                }
                "tool_use" => {
                    let args = serde_json::to_string(block.get("input").unwrap_or(&Value::Null))
                        .unwrap_or_else(|_| "{}".to_string());
                    tool_calls.push(json!({
                        "id": block.get("id").and_then(|v| v.as_str()).unwrap_or("tool_call"),
                        "type": "function",
                        "function": {
                            "name": block.get("name").and_then(|v| v.as_str()).unwrap_or("tool"),
                            "arguments": args
                        }
                    }));
                }
                _ => {}
            }
        }
    }

    let stop_reason = body
        .get("stop_reason")
        .and_then(|v| v.as_str())
        .map(map_stop_reason_to_openai)
        .unwrap_or("stop");

    let usage = extract_usage(body);
    let mut message = json!({"role": "assistant", "content": text});
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    json!({
        "id": body.get("id").cloned().unwrap_or(Value::String("chatcmpl-unknown".to_string())),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": stop_reason
        }],
        "usage": {
            "prompt_tokens": usage.input_tokens + usage.cache_read_tokens + usage.cache_creation_tokens,
            "completion_tokens": usage.output_tokens,
            "total_tokens": usage.total()
        }
    })
}

/// Chat-completions response -> messages response.
pub fn response_from_openai(body: &Value, model: &str) -> Value {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .cloned()
        .unwrap_or(Value::Null);
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    let mut blocks = Vec::new();
    if let Some(text) = message.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            blocks.push(json!({"type": "text", "text": text}));
        }
    }
    if let Some(tool_calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
        for call in tool_calls {
            let function = call.get("function").cloned().unwrap_or(Value::Null);
            let input: Value = function
                .get("arguments")
                .and_then(|a| a.as_str())
                .and_then(|a| serde_json::from_str(a).ok())
                .unwrap_or(json!({}));
            blocks.push(json!({
                "type": "tool_use",
                "id": call.get("id").and_then(|v| v.as_str()).unwrap_or("tool_call"),
                "name": function.get("name").and_then(|v| v.as_str()).unwrap_or("tool"),
                "input": input
            }));
        }
    }
    if blocks.is_empty() {
        blocks.push(json!({"type": "text", "text": ""}));
    }

    let finish = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(map_finish_reason_to_anthropic)
        .unwrap_or("end_turn");

    let usage = body.get("usage").cloned().unwrap_or(Value::Null);
    let prompt = usage.get("prompt_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
    let completion = usage
        .get("completion_tokens")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    let id_raw = body.get("id").and_then(|v| v.as_str()).unwrap_or("msg_unknown");
    let id = if id_raw.starts_with("msg_") {
        id_raw.to_string()
    } else {
        format!("msg_{}", id_raw)
    };

    json!({
        "id": id,
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": blocks,
        "stop_reason": finish,
        "stop_sequence": null,
        "usage": {"input_tokens": prompt, "output_tokens": completion}
    })
}

// ----------------------------------------------------------------------------
// Streaming state machines
// ----------------------------------------------------------------------------

/// Consumes messages-dialect stream events, emits chat-completions chunks.
pub struct StreamToOpenAI {
    model: String,
    id: String,
    created: i64,
    input_tokens: i64,
}

impl StreamToOpenAI {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: Utc::now().timestamp(),
            input_tokens: 0,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Value, usage: Value) -> Value {
        let mut out = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]
        });
        if !usage.is_null() {
            out["usage"] = usage;
        }
        out
    }

    /// One upstream event in, zero or more chunks out.
    pub fn feed(&mut self, event: &Value) -> Vec<Value> {
        match event.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "message_start" => {
                if let Some(message) = event.get("message") {
                    if let Some(id) = message.get("id").and_then(|v| v.as_str()) {
                        self.id = format!("chatcmpl-{}", id.trim_start_matches("msg_"));
                    }
                    self.input_tokens = extract_usage(message).input_tokens;
                }
                vec![self.chunk(json!({"role": "assistant", "content": ""}), Value::Null, Value::Null)]
            }
            "content_block_delta" => {
                let delta = event.get("delta").cloned().unwrap_or(Value::Null);
                match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "text_delta" => {
                        let text = delta.get("text").and_then(|v| v.as_str()).unwrap_or("");
                        vec![self.chunk(json!({"content": text}), Value::Null, Value::Null)]
                    }
                    "thinking_delta" => {
                        let text = delta.get("thinking").and_then(|v| v.as_str()).unwrap_or("");
                        vec![self.chunk(json!({"reasoning_content": text}), Value::Null, Value::Null)]
                    }
                    "input_json_delta" => {
                        let partial = delta.get("partial_json").and_then(|v| v.as_str()).unwrap_or("");
                        vec![self.chunk(
                            json!({"tool_calls": [{"index": 0, "function": {"arguments": partial}}]}),
                            Value::Null,
                            Value::Null,
                        )]
                    }
                    _ => Vec::new(),
                }
            }
            "content_block_start" => {
                let block = event.get("content_block").cloned().unwrap_or(Value::Null);
                if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                    vec![self.chunk(
                        json!({"tool_calls": [{
                            "index": 0,
                            "id": block.get("id").cloned().unwrap_or(Value::Null),
                            "type": "function",
                            "function": {
                                "name": block.get("name").cloned().unwrap_or(Value::Null),
                                "arguments": ""
                            }
                        }]}),
                        Value::Null,
                        Value::Null,
                    )]
                } else {
                    Vec::new()
                }
            }
            "message_delta" => {
                let stop = event
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|v| v.as_str());
                let output = event
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                let usage = json!({
                    "prompt_tokens": self.input_tokens,
                    "completion_tokens": output,
                    "total_tokens": self.input_tokens + output
                });
                match stop {
                    Some(reason) => vec![self.chunk(
                        json!({}),
                        Value::String(map_stop_reason_to_openai(reason).to_string()),
                        usage,
                    )],
                    None => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }
}

/// Consumes chat-completions chunks, emits messages-dialect events as
/// `(event_name, payload)` pairs.
pub struct StreamFromOpenAI {
    model: String,
    prompt_estimate: i64,
    started: bool,
    block_open: bool,
    stopped: bool,
    output_tokens: i64,
}

impl StreamFromOpenAI {
    pub fn new(model: &str, prompt_estimate: i64) -> Self {
        Self {
            model: model.to_string(),
            prompt_estimate,
            started: false,
            block_open: false,
            stopped: false,
            output_tokens: 0,
        }
    }

    pub fn feed(&mut self, chunk: &Value) -> Vec<(&'static str, Value)> {
        let mut events = Vec::new();

        if !self.started {
            self.started = true;
            let id_raw = chunk.get("id").and_then(|v| v.as_str()).unwrap_or("unknown");
            let id = if id_raw.starts_with("msg_") {
                id_raw.to_string()
            } else {
                format!("msg_{}", id_raw)
            };
            let input = chunk
                .get("usage")
                .and_then(|u| u.get("prompt_tokens"))
                .and_then(|v| v.as_i64())
                .unwrap_or(self.prompt_estimate);
            events.push((
                "message_start",
                json!({
                    "type": "message_start",
                    "message": {
                        "id": id,
                        "type": "message",
                        "role": "assistant",
                        "model": self.model,
                        "content": [],
                        "stop_reason": null,
                        "stop_sequence": null,
                        "usage": {"input_tokens": input, "output_tokens": 0}
                    }
                }),
            ));
        }

        if let Some(usage) = chunk.get("usage") {
            if let Some(output) = usage.get("completion_tokens").and_then(|v| v.as_i64()) {
                if output > 0 {
                    self.output_tokens = output;
                }
            }
        }

        let Some(choice) = chunk
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        else {
            return events;
        };

        if let Some(delta) = choice.get("delta") {
            let text = delta.get("content").and_then(|c| c.as_str()).unwrap_or("");
            let thinking = delta
                .get("reasoning_content")
                .and_then(|c| c.as_str())
                .unwrap_or("");
            if !text.is_empty() || !thinking.is_empty() {
                if !self.block_open {
                    self.block_open = true;
                    events.push((
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": 0,
                            "content_block": {"type": "text", "text": ""}
                        }),
                    ));
                }
                if !text.is_empty() {
                    events.push((
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": 0,
                            "delta": {"type": "text_delta", "text": text}
                        }),
                    ));
                }
                if !thinking.is_empty() {
                    events.push((
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": 0,
                            "delta": {"type": "thinking_delta", "thinking": thinking}
                        }),
                    ));
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            if !self.stopped {
                self.stopped = true;
                if self.block_open {
                    self.block_open = false;
                    events.push((
                        "content_block_stop",
                        json!({"type": "content_block_stop", "index": 0}),
                    ));
                }
                events.push((
                    "message_delta",
                    json!({
                        "type": "message_delta",
                        "delta": {
                            "stop_reason": map_finish_reason_to_anthropic(reason),
                            "stop_sequence": null
                        },
                        "usage": {"output_tokens": self.output_tokens}
                    }),
                ));
                events.push(("message_stop", json!({"type": "message_stop"})));
            }
        }

        events
    }

    /// Close the message if the upstream stream ended without a stop.
    pub fn finish(&mut self) -> Vec<(&'static str, Value)> {
        if !self.started || self.stopped {
            return Vec::new();
        }
        self.stopped = true;
        let mut events = Vec::new();
        if self.block_open {
            self.block_open = false;
            events.push((
                "content_block_stop",
                json!({"type": "content_block_stop", "index": 0}),
            ));
        }
        events.push((
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                "usage": {"output_tokens": self.output_tokens}
            }),
        ));
        events.push(("message_stop", json!({"type": "message_stop"})));
        events
    }
}
