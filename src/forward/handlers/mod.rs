//! Provider handlers.
//!
//! Per-provider URL building, auth-header injection, and wire-format
//! translation. OpenAI chat completions are the normal form: every pair of
//! dialects translates through it, both for buffered bodies and for the
//! streaming event mapping.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use axum::body::Bytes;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::store::channels::Channel;

use super::context::{Provider, TokenUsage};
use super::transport::{drain_sse_lines, is_sse_done, parse_sse_data};

/// Upstream path for a chat request. Gemini carries the model and stream
/// action in the URL.
pub fn chat_path(provider: Provider, model: &str, streaming: bool) -> String {
    match provider {
        Provider::OpenAI => openai::chat_path(model, streaming).to_string(),
        Provider::Claude => anthropic::chat_path(model, streaming).to_string(),
        Provider::Gemini => gemini::chat_path(model, streaming),
    }
}

/// Auth headers for the channel's provider family.
pub fn build_headers(provider: Provider, channel: &Channel) -> HeaderMap {
    match provider {
        Provider::OpenAI => openai::build_headers(channel),
        Provider::Claude => anthropic::build_headers(channel),
        Provider::Gemini => gemini::build_headers(channel),
    }
}

fn request_to_normal_form(client: Provider, payload: &Value, model: &str) -> Value {
    match client {
        Provider::OpenAI => payload.clone(),
        Provider::Claude => anthropic::request_to_openai(payload, model),
        Provider::Gemini => gemini::request_to_openai(payload, model),
    }
}

/// Translate an inbound request into the upstream provider's dialect, with
/// the mapped model pinned and the stream flag normalized.
pub fn translate_request(
    client: Provider,
    upstream: Provider,
    payload: &Value,
    model: &str,
    streaming: bool,
) -> Value {
    if client == upstream {
        return match upstream {
            Provider::OpenAI => openai::prepare_request(payload, model, streaming),
            Provider::Claude => {
                let mut out = payload.clone();
                if let Some(obj) = out.as_object_mut() {
                    obj.insert("model".to_string(), Value::String(model.to_string()));
                    obj.insert("stream".to_string(), Value::Bool(streaming));
                }
                out
            }
            // Model and stream action live in the URL.
            Provider::Gemini => payload.clone(),
        };
    }

    let normal = request_to_normal_form(client, payload, model);
    match upstream {
        Provider::OpenAI => openai::prepare_request(&normal, model, streaming),
        Provider::Claude => {
            let mut out = anthropic::request_from_openai(&normal, model);
            if let Some(obj) = out.as_object_mut() {
                obj.insert("stream".to_string(), Value::Bool(streaming));
            }
            out
        }
        Provider::Gemini => gemini::request_from_openai(&normal, model),
    }
}

/// Translate a buffered upstream response body into the client's dialect.
pub fn translate_response(
    upstream: Provider,
    client: Provider,
    body: &Value,
    model: &str,
) -> Value {
    if upstream == client {
        return body.clone();
    }
    let normal = match upstream {
        Provider::OpenAI => body.clone(),
        Provider::Claude => anthropic::response_to_openai(body, model),
        Provider::Gemini => gemini::response_to_openai(body, model),
    };
    match client {
        Provider::OpenAI => normal,
        Provider::Claude => anthropic::response_from_openai(&normal, model),
        Provider::Gemini => gemini::response_from_openai(&normal, model),
    }
}

/// Usage counts from a buffered response in the upstream's dialect.
pub fn extract_usage(provider: Provider, body: &Value) -> TokenUsage {
    match provider {
        Provider::OpenAI => openai::extract_usage(body),
        Provider::Claude => anthropic::extract_usage(body),
        Provider::Gemini => gemini::extract_usage(body),
    }
}

pub fn extract_request_id(provider: Provider, body: &Value) -> Option<String> {
    match provider {
        Provider::OpenAI => openai::request_id(body),
        Provider::Claude => anthropic::request_id(body),
        Provider::Gemini => gemini::request_id(body),
    }
}

enum Normalizer {
    Pass,
    Claude(anthropic::StreamToOpenAI),
    Gemini(gemini::StreamToOpenAI),
}

enum Emitter {
    OpenAI,
    Claude(anthropic::StreamFromOpenAI),
    Gemini(gemini::StreamFromOpenAI),
}

/// Streaming translation state machine.
///
/// Consumes raw upstream SSE bytes one chunk at a time and emits bytes in
/// the client's dialect, buffering only what is needed to reassemble split
/// lines. Usage is tracked from upstream frames as they pass through, with
/// a character-count estimate as the fallback when the upstream never
/// reports counts.
pub struct StreamTranslator {
    upstream: Provider,
    client: Provider,
    passthrough: bool,
    buffer: Vec<u8>,
    normalizer: Normalizer,
    emitter: Emitter,
    usage: TokenUsage,
    prompt_estimate: i64,
    output_chars: usize,
    request_id: Option<String>,
}

impl StreamTranslator {
    pub fn new(upstream: Provider, client: Provider, model: &str, prompt_estimate: i64) -> Self {
        let normalizer = match upstream {
            Provider::OpenAI => Normalizer::Pass,
            Provider::Claude => Normalizer::Claude(anthropic::StreamToOpenAI::new(model)),
            Provider::Gemini => Normalizer::Gemini(gemini::StreamToOpenAI::new(model)),
        };
        let emitter = match client {
            Provider::OpenAI => Emitter::OpenAI,
            Provider::Claude => {
                Emitter::Claude(anthropic::StreamFromOpenAI::new(model, prompt_estimate))
            }
            Provider::Gemini => Emitter::Gemini(gemini::StreamFromOpenAI::new()),
        };
        Self {
            upstream,
            client,
            passthrough: upstream == client,
            buffer: Vec::new(),
            normalizer,
            emitter,
            usage: TokenUsage::default(),
            prompt_estimate,
            output_chars: 0,
            request_id: None,
        }
    }

    fn track_upstream_frame(&mut self, frame: &Value) {
        match self.upstream {
            Provider::OpenAI => {
                openai::usage_from_stream_frame(frame, &mut self.usage);
                if self.request_id.is_none() {
                    self.request_id = openai::request_id(frame);
                }
            }
            Provider::Claude => {
                anthropic::usage_from_stream_frame(frame, &mut self.usage);
                if self.request_id.is_none() {
                    if let Some(message) = frame.get("message") {
                        self.request_id = anthropic::request_id(message);
                    }
                }
            }
            Provider::Gemini => {
                gemini::usage_from_stream_frame(frame, &mut self.usage);
                if self.request_id.is_none() {
                    self.request_id = gemini::request_id(frame);
                }
            }
        }
    }

    fn normalize(&mut self, frame: &Value) -> Vec<Value> {
        match &mut self.normalizer {
            Normalizer::Pass => vec![frame.clone()],
            Normalizer::Claude(state) => state.feed(frame),
            Normalizer::Gemini(state) => state.feed(frame),
        }
    }

    fn emit(&mut self, chunks: Vec<Value>, out: &mut Vec<u8>) {
        for chunk in chunks {
            self.output_chars += openai::chunk_delta_text(&chunk).chars().count();
            match &mut self.emitter {
                Emitter::OpenAI => {
                    out.extend_from_slice(format!("data: {}\n\n", chunk).as_bytes());
                }
                Emitter::Claude(state) => {
                    for (name, payload) in state.feed(&chunk) {
                        out.extend_from_slice(
                            format!("event: {}\ndata: {}\n\n", name, payload).as_bytes(),
                        );
                    }
                }
                Emitter::Gemini(state) => {
                    for frame in state.feed(&chunk) {
                        out.extend_from_slice(format!("data: {}\n\n", frame).as_bytes());
                    }
                }
            }
        }
    }

    /// Translate one chunk of upstream bytes.
    pub fn feed(&mut self, chunk: &[u8]) -> Bytes {
        let lines = drain_sse_lines(&mut self.buffer, chunk);
        let mut out: Vec<u8> = Vec::new();

        for line in lines {
            if self.passthrough {
                // Verbatim copy; frames are still parsed for accounting.
                out.extend_from_slice(line.as_bytes());
                out.push(b'\n');
            }
            let Some(data) = parse_sse_data(&line) else {
                continue;
            };
            if data.trim().is_empty() || is_sse_done(data) {
                continue;
            }
            let Ok(frame) = serde_json::from_str::<Value>(data) else {
                crate::logger::warn(
                    "dispatch",
                    &format!("Unparsable stream frame: {}", &data[..data.len().min(200)]),
                );
                continue;
            };
            self.track_upstream_frame(&frame);
            if self.passthrough {
                // Count output text for the estimate fallback.
                let chunks = self.normalize(&frame);
                for chunk in &chunks {
                    self.output_chars += openai::chunk_delta_text(chunk).chars().count();
                }
            } else {
                let chunks = self.normalize(&frame);
                self.emit(chunks, &mut out);
            }
        }

        Bytes::from(out)
    }

    /// Trailing frames once the upstream stream ends.
    pub fn finish(&mut self) -> Bytes {
        let mut out: Vec<u8> = Vec::new();
        if self.passthrough {
            if !self.buffer.is_empty() {
                out.extend_from_slice(&self.buffer);
                self.buffer.clear();
            }
            return Bytes::from(out);
        }
        match &mut self.emitter {
            Emitter::OpenAI => out.extend_from_slice(b"data: [DONE]\n\n"),
            Emitter::Claude(state) => {
                for (name, payload) in state.finish() {
                    out.extend_from_slice(
                        format!("event: {}\ndata: {}\n\n", name, payload).as_bytes(),
                    );
                }
            }
            Emitter::Gemini(_) => {}
        }
        Bytes::from(out)
    }

    /// Final usage: upstream-reported counts, with the character estimate
    /// filling in whatever the upstream never reported.
    pub fn usage(&self) -> TokenUsage {
        let mut usage = self.usage;
        if usage.input_tokens == 0 && usage.cache_read_tokens == 0 {
            usage.input_tokens = self.prompt_estimate;
        }
        if usage.output_tokens == 0 && self.output_chars > 0 {
            usage.output_tokens = (self.output_chars as f64 / 3.5).round() as i64;
        }
        usage
    }

    pub fn request_id(&self) -> Option<String> {
        self.request_id.clone()
    }

    pub fn client_dialect(&self) -> Provider {
        self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_translation_same_dialect_pins_model() {
        let payload = json!({"model": "alias", "messages": [{"role": "user", "content": "x"}]});
        let out = translate_request(Provider::OpenAI, Provider::OpenAI, &payload, "gpt-4o", false);
        assert_eq!(out["model"], "gpt-4o");
    }

    #[test]
    fn request_translation_openai_to_claude() {
        let payload = json!({
            "model": "alias",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hello"}
            ],
            "stream": true
        });
        let out = translate_request(
            Provider::OpenAI,
            Provider::Claude,
            &payload,
            "claude-3-5-sonnet-20241022",
            true,
        );
        assert_eq!(out["model"], "claude-3-5-sonnet-20241022");
        assert_eq!(out["system"], "be brief");
        assert_eq!(out["stream"], true);
    }

    #[test]
    fn request_translation_claude_to_gemini_composes() {
        let payload = json!({
            "model": "alias",
            "system": "be brief",
            "messages": [{"role": "user", "content": [{"type": "text", "text": "hello"}]}],
            "max_tokens": 32
        });
        let out = translate_request(
            Provider::Claude,
            Provider::Gemini,
            &payload,
            "gemini-1.5-pro",
            false,
        );
        assert_eq!(out["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(out["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(out["generationConfig"]["maxOutputTokens"], 32);
    }

    #[test]
    fn response_translation_gemini_to_claude() {
        let body = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "hi"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 1}
        });
        let out = translate_response(Provider::Gemini, Provider::Claude, &body, "m");
        assert_eq!(out["type"], "message");
        assert_eq!(out["content"][0]["text"], "hi");
        assert_eq!(out["stop_reason"], "end_turn");
    }

    #[test]
    fn passthrough_stream_copies_and_tracks_usage() {
        let mut translator = StreamTranslator::new(Provider::OpenAI, Provider::OpenAI, "gpt-4o", 5);
        let chunk = b"data: {\"id\":\"abc\",\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: {\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":2}}\n\ndata: [DONE]\n\n";
        let out = translator.feed(chunk);
        assert_eq!(&out[..], &chunk[..]);
        let usage = translator.usage();
        assert_eq!(usage.input_tokens, 9);
        assert_eq!(usage.output_tokens, 2);
        assert_eq!(translator.request_id().as_deref(), Some("abc"));
        assert!(translator.finish().is_empty());
    }

    #[test]
    fn claude_upstream_to_openai_client_stream() {
        let mut translator =
            StreamTranslator::new(Provider::Claude, Provider::OpenAI, "claude-3-5-sonnet", 5);

        let input = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_9\",\"usage\":{\"input_tokens\":11,\"output_tokens\":0}}}\n",
            "\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hey\"}}\n",
            "\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":1}}\n",
            "\n"
        );
        let out = translator.feed(input.as_bytes());
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("\"role\":\"assistant\""));
        assert!(text.contains("\"content\":\"Hey\""));
        assert!(text.contains("\"finish_reason\":\"stop\""));

        let tail = translator.finish();
        assert_eq!(&tail[..], b"data: [DONE]\n\n");

        let usage = translator.usage();
        assert_eq!(usage.input_tokens, 11);
        assert_eq!(usage.output_tokens, 1);
        assert_eq!(translator.request_id().as_deref(), Some("msg_9"));
    }

    #[test]
    fn openai_upstream_to_claude_client_stream() {
        let mut translator =
            StreamTranslator::new(Provider::OpenAI, Provider::Claude, "claude-3-5-sonnet", 7);
        let input = concat!(
            "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hi\"}}]}\n\n",
            "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":1}}\n\n",
            "data: [DONE]\n\n"
        );
        let out = translator.feed(input.as_bytes());
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("event: message_start"));
        assert!(text.contains("event: content_block_delta"));
        assert!(text.contains("event: message_stop"));
        assert!(translator.finish().is_empty());
    }

    #[test]
    fn estimate_fallback_when_no_usage_reported() {
        let mut translator = StreamTranslator::new(Provider::OpenAI, Provider::OpenAI, "gpt-4o", 5);
        translator.feed(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"a seven char run\"}}]}\n\n",
        );
        let usage = translator.usage();
        assert_eq!(usage.input_tokens, 5);
        assert!(usage.output_tokens > 0);
    }
}
