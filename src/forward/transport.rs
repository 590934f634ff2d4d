//! Retrying transport.
//!
//! Wraps the outbound HTTP client with idempotent retry attempts and the
//! gate invariant: a response may be retried only while zero bytes have
//! been handed to the downstream writer. Buffered responses keep the gate
//! closed until success is confirmed; streamed responses commit the gate on
//! the first useful SSE event.

use std::pin::Pin;
use std::time::Duration;

use axum::body::Bytes;
use futures_util::{Stream, StreamExt};
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method};

use crate::config::{RetrySettings, TimeoutSettings};
use crate::logger;

use super::error::{ProxyError, ProxyResult};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// One outbound request, replayable as long as the body stays under the
/// configured cap and the caller declared it idempotent.
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub expect_stream: bool,
    pub idempotent: bool,
}

/// Fully buffered upstream response; the gate never opened while retrying.
pub struct BufferedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub attempts: u32,
}

/// Committed streaming response: `head` holds the bytes consumed while
/// probing for the first event, `rest` the live remainder.
pub struct StreamingResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub head: Vec<Bytes>,
    pub rest: ByteStream,
    pub attempts: u32,
}

pub enum UpstreamOutcome {
    Buffered(BufferedResponse),
    Streaming(StreamingResponse),
}

pub fn build_client(timeouts: &TimeoutSettings, streaming: bool) -> ProxyResult<Client> {
    let total = if streaming {
        timeouts.streaming_timeout_secs
    } else {
        timeouts.request_timeout_secs
    };
    Client::builder()
        .timeout(Duration::from_secs(total))
        .connect_timeout(Duration::from_secs(timeouts.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(timeouts.pool_idle_timeout_secs))
        .build()
        .map_err(|e| ProxyError::Upstream(format!("failed to build HTTP client: {}", e)))
}

/// `min(backoff_max, backoff_base * 2^(attempt-1))` with ±25% jitter.
pub fn backoff_delay(attempt: u32, cfg: &RetrySettings) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let exp = cfg.backoff_base_ms.saturating_mul(1u64 << shift);
    let base = exp.min(cfg.backoff_max_ms).max(1);

    let jitter_span = base / 4;
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    let roll = u64::from_le_bytes(bytes) % (2 * jitter_span + 1);
    Duration::from_millis(base - jitter_span + roll)
}

fn retry_after_hint(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.to_ascii_lowercase().contains("text/event-stream"))
        .unwrap_or(false)
}

/// Does the accumulated buffer contain a complete, non-empty, non-comment
/// SSE line? Only complete lines count; a partial frame keeps the gate shut.
fn has_useful_event(buf: &[u8]) -> bool {
    let mut start = 0usize;
    for (i, b) in buf.iter().enumerate() {
        if *b != b'\n' {
            continue;
        }
        let mut line = &buf[start..i];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        start = i + 1;
        if line.is_empty() || line[0] == b':' {
            continue;
        }
        return true;
    }
    false
}

enum ProbeResult {
    /// First useful event arrived in time; the gate is committed.
    Committed { head: Vec<Bytes>, rest: ByteStream },
    /// Gate timer expired before a useful event.
    TimedOut { head: Vec<Bytes>, rest: ByteStream },
    /// Stream ended (or errored) before a useful event.
    Ended { head: Vec<Bytes> },
}

async fn probe_first_event(
    mut stream: ByteStream,
    deadline: tokio::time::Instant,
) -> ProbeResult {
    let mut head: Vec<Bytes> = Vec::new();
    let mut scan: Vec<u8> = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(Some(Ok(bytes))) => {
                scan.extend_from_slice(&bytes);
                head.push(bytes);
                if has_useful_event(&scan) {
                    return ProbeResult::Committed { head, rest: stream };
                }
            }
            Ok(Some(Err(e))) => {
                logger::warn("transport", &format!("Stream error before first event: {}", e));
                return ProbeResult::Ended { head };
            }
            Ok(None) => return ProbeResult::Ended { head },
            Err(_) => return ProbeResult::TimedOut { head, rest: stream },
        }
    }
}

fn concat(head: Vec<Bytes>) -> Bytes {
    let mut out = Vec::new();
    for chunk in head {
        out.extend_from_slice(&chunk);
    }
    Bytes::from(out)
}

/// Issue the request with retry-capable attempts per the configuration.
///
/// Upstream error statuses that exhaust their retries are returned as
/// `Buffered` so the caller can proxy them verbatim; `Err` means the
/// transport itself failed on the final attempt.
pub async fn send_with_retry(
    req: &UpstreamRequest,
    cfg: &RetrySettings,
    timeouts: &TimeoutSettings,
) -> ProxyResult<UpstreamOutcome> {
    let client = build_client(timeouts, req.expect_stream)?;
    let replayable = req.idempotent && req.body.len() <= cfg.max_body_bytes;
    let max_attempts = if cfg.enabled && replayable {
        cfg.max_attempts.max(1)
    } else {
        1
    };
    let gate = Duration::from_secs(cfg.gate_timeout_secs);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let deadline = tokio::time::Instant::now() + gate;

        let send = client
            .request(req.method.clone(), &req.url)
            .headers(req.headers.clone())
            .body(req.body.clone())
            .send();

        let response = match tokio::time::timeout_at(deadline, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                if attempt < max_attempts {
                    tokio::time::sleep(backoff_delay(attempt, cfg)).await;
                    continue;
                }
                return Err(ProxyError::Upstream(format!("transport error: {}", e)));
            }
            Err(_) => {
                if attempt < max_attempts {
                    tokio::time::sleep(backoff_delay(attempt, cfg)).await;
                    continue;
                }
                return Err(ProxyError::Upstream(format!(
                    "no response headers within {}s",
                    cfg.gate_timeout_secs
                )));
            }
        };

        let status = response.status();
        let headers = response.headers().clone();

        if status.is_success() {
            if req.expect_stream && is_event_stream(&headers) {
                let stream: ByteStream = response.bytes_stream().boxed();
                match probe_first_event(stream, deadline).await {
                    ProbeResult::Committed { head, rest } => {
                        return Ok(UpstreamOutcome::Streaming(StreamingResponse {
                            status: status.as_u16(),
                            headers,
                            head,
                            rest,
                            attempts: attempt,
                        }));
                    }
                    ProbeResult::TimedOut { head, rest } => {
                        // No useful event inside the gate window: empty body.
                        if cfg.retry_on_empty_body && attempt < max_attempts {
                            logger::warn(
                                "transport",
                                &format!("Gate timeout on attempt {}; retrying", attempt),
                            );
                            tokio::time::sleep(backoff_delay(attempt, cfg)).await;
                            continue;
                        }
                        // Out of retries: open the gate and ride it out.
                        return Ok(UpstreamOutcome::Streaming(StreamingResponse {
                            status: status.as_u16(),
                            headers,
                            head,
                            rest,
                            attempts: attempt,
                        }));
                    }
                    ProbeResult::Ended { head } => {
                        if cfg.retry_on_empty_body && attempt < max_attempts {
                            logger::warn(
                                "transport",
                                &format!("Empty stream on attempt {}; retrying", attempt),
                            );
                            tokio::time::sleep(backoff_delay(attempt, cfg)).await;
                            continue;
                        }
                        return Ok(UpstreamOutcome::Buffered(BufferedResponse {
                            status: status.as_u16(),
                            headers,
                            body: concat(head),
                            attempts: attempt,
                        }));
                    }
                }
            }

            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    if attempt < max_attempts {
                        tokio::time::sleep(backoff_delay(attempt, cfg)).await;
                        continue;
                    }
                    return Err(ProxyError::Upstream(format!(
                        "failed to read response body: {}",
                        e
                    )));
                }
            };
            if body.is_empty() && cfg.retry_on_empty_body && attempt < max_attempts {
                logger::warn(
                    "transport",
                    &format!("Empty body on attempt {}; retrying", attempt),
                );
                tokio::time::sleep(backoff_delay(attempt, cfg)).await;
                continue;
            }
            return Ok(UpstreamOutcome::Buffered(BufferedResponse {
                status: status.as_u16(),
                headers,
                body,
                attempts: attempt,
            }));
        }

        let code = status.as_u16();
        let retryable =
            (code == 429 && cfg.retry_on_429) || (code >= 500 && cfg.retry_on_5xx);
        if retryable && attempt < max_attempts {
            let mut delay = backoff_delay(attempt, cfg);
            if cfg.respect_retry_after {
                if let Some(hint) = retry_after_hint(&headers) {
                    delay = delay.max(hint);
                }
            }
            logger::warn(
                "transport",
                &format!("Attempt {} got {}; backing off {:?}", attempt, code, delay),
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        // Final failure status: surface it verbatim to the caller.
        let body = response.bytes().await.unwrap_or_default();
        return Ok(UpstreamOutcome::Buffered(BufferedResponse {
            status: code,
            headers,
            body,
            attempts: attempt,
        }));
    }
}

/// Split complete SSE lines out of a byte buffer; line breaks may split
/// across reads.
pub fn drain_sse_lines(buffer: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    if !chunk.is_empty() {
        buffer.extend_from_slice(chunk);
    }
    let mut lines = Vec::new();
    loop {
        let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
            break;
        };
        let mut line = buffer.drain(..=pos).collect::<Vec<u8>>();
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(String::from_utf8_lossy(&line).to_string());
    }
    lines
}

/// Payload of a `data:` SSE line.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

pub fn is_sse_done(data: &str) -> bool {
    data.trim() == "[DONE]"
}
