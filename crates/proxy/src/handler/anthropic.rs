//! Pass-through handler for Anthropic Messages upstreams.
//!
//! Covers the native API and the Anthropic-compatible aggregators (MiniMax,
//! Moonshot), which differ only in base URL, path, and credential. The
//! request body is forwarded byte-exact and the upstream SSE stream is piped
//! straight back; the only processing is a usage scan for token accounting.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    http::header,
    response::Response,
};
use futures::StreamExt;
use secrecy::ExposeSecret;
use serde_json::Value;

use super::{Handler, HandlerContext, credential, upstream_error};
use crate::{
    adapter,
    detect::DEFAULT_CONTEXT_WINDOW,
    error::{ProxyError, ProxyResult},
    http_client::http_client,
    protocol::anthropic::{CountTokensResponse, MessagesRequest, Usage},
    registry::{ProviderDescriptor, Route},
    retry,
    stream::{StreamUsage, estimate_tokens},
    tracker::SessionTracker,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicHandler {
    provider: ProviderDescriptor,
    model: String,
    client: reqwest::Client,
    tracker: Arc<SessionTracker>,
}

impl AnthropicHandler {
    pub fn new(route: Route, ctx: &Arc<HandlerContext>) -> Self {
        let tracker = Arc::new(SessionTracker::new(
            route.provider.name,
            &route.model_name,
            false,
            ctx.config.context_window_override.unwrap_or(DEFAULT_CONTEXT_WINDOW),
            &ctx.status_dir,
            ctx.port,
        ));

        Self {
            provider: route.provider,
            model: route.model_name,
            client: http_client(),
            tracker,
        }
    }

    fn post(&self, url: &str, body: Bytes, key: &secrecy::SecretString) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-api-key", key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
    }
}

#[async_trait]
impl Handler for AnthropicHandler {
    async fn handle(&self, _request: MessagesRequest, raw_body: Bytes) -> ProxyResult<Response> {
        let key = credential(&self.provider)?.ok_or_else(|| ProxyError::Internal(None))?;

        // Same-dialect upstreams still get their family quirks: MiniMax
        // takes reasoning_split on the Messages body. The native API never
        // matches a family adapter and keeps the body byte-exact.
        let body = match adapter::select(&self.model).prepare_anthropic(&raw_body) {
            Some(rewritten) => Bytes::from(rewritten),
            None => raw_body,
        };

        let url = format!("{}{}", self.provider.base_url, self.provider.api_path);
        let builder = self.post(&url, body, &key);

        let response = retry::send_with_retry(builder, &url).await?;
        if !response.status().is_success() {
            return Err(upstream_error(&self.provider, &self.model, response).await);
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("text/event-stream")
            .to_string();

        let mut scanner = UsageScanner::new(self.tracker.clone());
        let piped = response.bytes_stream().map(move |chunk| {
            if let Ok(bytes) = &chunk {
                scanner.feed(bytes);
            }
            chunk
        });

        let response = Response::builder()
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from_stream(piped))
            .map_err(|e| {
                log::error!("Failed to build pass-through response: {e}");
                ProxyError::Internal(None)
            })?;

        Ok(response)
    }

    async fn count_tokens(&self, raw_body: Bytes) -> ProxyResult<CountTokensResponse> {
        let key = credential(&self.provider)?.ok_or_else(|| ProxyError::Internal(None))?;

        let url = format!("{}{}/count_tokens", self.provider.base_url, self.provider.api_path);
        let builder = self.post(&url, raw_body.clone(), &key);

        match retry::send_with_retry(builder, &url).await {
            Ok(response) if response.status().is_success() => response.json().await.map_err(|e| {
                log::error!("Failed to parse count_tokens response: {e}");
                ProxyError::Internal(None)
            }),
            Ok(response) => {
                log::debug!("count_tokens upstream returned {}, falling back to estimate", response.status());
                Ok(estimate(&raw_body))
            }
            Err(_) => Ok(estimate(&raw_body)),
        }
    }

    fn descriptor(&self) -> &ProviderDescriptor {
        &self.provider
    }

    fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }
}

fn estimate(raw_body: &Bytes) -> CountTokensResponse {
    CountTokensResponse {
        input_tokens: u64::from(estimate_tokens(std::str::from_utf8(raw_body).unwrap_or_default())),
    }
}

/// Scans pass-through SSE bytes for usage counters without altering them.
struct UsageScanner {
    tracker: Arc<SessionTracker>,
    line_buffer: String,
    input_tokens: u32,
    recorded: bool,
}

impl UsageScanner {
    fn new(tracker: Arc<SessionTracker>) -> Self {
        Self {
            tracker,
            line_buffer: String::new(),
            input_tokens: 0,
            recorded: false,
        }
    }

    fn feed(&mut self, bytes: &Bytes) {
        self.line_buffer.push_str(&String::from_utf8_lossy(bytes));

        while let Some(newline) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=newline).collect();
            self.scan_line(line.trim());
        }
    }

    fn scan_line(&mut self, line: &str) {
        let Some(data) = line.strip_prefix("data: ") else {
            return;
        };

        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return;
        };

        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(input) = event
                    .pointer("/message/usage/input_tokens")
                    .and_then(Value::as_u64)
                {
                    self.input_tokens = input as u32;
                }
            }
            Some("message_delta") if !self.recorded => {
                if let Some(output) = event.pointer("/usage/output_tokens").and_then(Value::as_u64) {
                    self.recorded = true;
                    self.tracker.record(StreamUsage {
                        usage: Usage {
                            input_tokens: self.input_tokens,
                            output_tokens: output as u32,
                        },
                        estimated: false,
                    });
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_scanner_records_once_from_sse_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = Arc::new(SessionTracker::new("anthropic", "claude-sonnet-4", false, 200_000, dir.path(), 9999));
        let mut scanner = UsageScanner::new(tracker.clone());

        let sse = indoc::indoc! {r#"
            event: message_start
            data: {"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":42,"output_tokens":1}}}

            event: content_block_delta
            data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}

            event: message_delta
            data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":12}}

        "#};

        // Feed in awkward chunk sizes to exercise line reassembly.
        for chunk in sse.as_bytes().chunks(17) {
            scanner.feed(&Bytes::copy_from_slice(chunk));
        }

        let snapshot = tracker.current();
        assert_eq!(snapshot.input_tokens, 42);
        assert_eq!(snapshot.output_tokens, 12);
    }

    #[test]
    fn estimate_rounds_up() {
        let body = Bytes::from_static(b"12345");
        assert_eq!(estimate(&body).input_tokens, 2);
    }

    #[test]
    fn minimax_bodies_are_rewritten_native_claude_stays_byte_exact() {
        let raw = serde_json::json!({
            "model": "MiniMax-M2",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "hi"}]
        })
        .to_string();

        let rewritten = adapter::select("minimax-m2")
            .prepare_anthropic(raw.as_bytes())
            .expect("minimax body must be amended");
        let body: Value = serde_json::from_slice(&rewritten).expect("valid json");
        assert_eq!(body["reasoning_split"], true);

        assert!(adapter::select("claude-sonnet-4").prepare_anthropic(raw.as_bytes()).is_none());
    }
}
