//! Handler for every OpenAI-compatible upstream: the cloud aggregator,
//! direct OpenAI, GLM, and all local servers.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{body::Bytes, response::Response};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use secrecy::ExposeSecret;
use serde_json::json;
use tokio::sync::mpsc;

use super::{Handler, HandlerContext, check_capabilities, credential, input_estimate, sse_response, upstream_error};
use crate::{
    adapter,
    detect::{self, DEFAULT_CONTEXT_WINDOW},
    error::{ProxyError, ProxyResult},
    http_client::http_client,
    middleware::{MiddlewareChain, ReasoningReplay},
    protocol::{
        anthropic::MessagesRequest,
        openai::{ChatChunk, ChunkDelta},
    },
    prune,
    registry::{ProviderDescriptor, Route},
    retry,
    stream::{PING_INTERVAL, StreamMachine, UpstreamDelta},
    tracker::SessionTracker,
    translate::{self, ToolSummarization},
};

const DEFAULT_KEEP_ALIVE: &str = "30m";

pub struct OpenAiHandler {
    provider: ProviderDescriptor,
    model: String,
    client: reqwest::Client,
    ctx: Arc<HandlerContext>,
    middleware: MiddlewareChain,
    tracker: Arc<SessionTracker>,
    window: tokio::sync::OnceCell<u32>,
}

impl OpenAiHandler {
    pub fn new(route: Route, ctx: &Arc<HandlerContext>) -> Self {
        let middleware = MiddlewareChain::new(vec![Arc::new(ReasoningReplay::new(ctx.replay_cache.clone()))]);

        let tracker = Arc::new(SessionTracker::new(
            route.provider.name,
            &route.model_name,
            route.provider.local,
            DEFAULT_CONTEXT_WINDOW,
            &ctx.status_dir,
            ctx.port,
        ));

        Self {
            provider: route.provider,
            model: route.model_name,
            client: http_client(),
            ctx: ctx.clone(),
            middleware,
            tracker,
            window: tokio::sync::OnceCell::new(),
        }
    }

    async fn context_window(&self) -> u32 {
        *self
            .window
            .get_or_init(|| async {
                let (window, source) = detect::detect_context_window(
                    &self.client,
                    &self.provider,
                    &self.model,
                    self.ctx.config.context_window_override,
                    &self.ctx.model_cache,
                )
                .await;

                log::info!(
                    "Context window for {}/{}: {window} ({source:?})",
                    self.provider.name,
                    self.model
                );
                self.tracker.set_context_window(window);
                window
            })
            .await
    }

    fn translation_options(&self) -> translate::openai::TranslationOptions {
        translate::openai::TranslationOptions {
            simple_format: self.provider.capabilities.simple_format,
            summarization: ToolSummarization::Off,
            no_think: self.ctx.config.qwen_no_think && self.model.to_ascii_lowercase().contains("qwen"),
        }
    }

    fn apply_sampling(&self, chat: &mut crate::protocol::openai::ChatRequest) {
        let sampling = &self.ctx.config.sampling;

        if let Some(temperature) = sampling.temperature {
            chat.temperature = Some(temperature);
        }
        if let Some(top_p) = sampling.top_p {
            chat.top_p = Some(top_p);
        }
        if let Some(top_k) = sampling.top_k {
            chat.top_k = Some(top_k);
        }
        if let Some(min_p) = sampling.min_p {
            chat.min_p = Some(min_p);
        }
        if let Some(penalty) = sampling.repetition_penalty {
            chat.repetition_penalty = Some(penalty);
        }
    }
}

#[async_trait]
impl Handler for OpenAiHandler {
    async fn handle(&self, mut request: MessagesRequest, raw_body: Bytes) -> ProxyResult<Response> {
        let key = credential(&self.provider)?;
        check_capabilities(&self.provider, &request, &self.model)?;

        if self.provider.local && !detect::check_health(&self.client, &self.provider.base_url, &self.ctx.health_cache).await
        {
            return Err(ProxyError::Connection {
                url: self.provider.base_url.clone(),
                reason: format!("server is not responding; is it running? ({})", self.provider.hint_url),
            });
        }

        let window = self.context_window().await;
        prune::maybe_prune(&mut request, self.tracker.context_used(), window);

        let adapter = adapter::select(&self.model);
        let mut chat = translate::openai::to_chat_request(&request, &self.model, &self.translation_options());
        chat.stream = true;

        adapter.prepare_openai(&mut chat, &request);
        self.apply_sampling(&mut chat);

        if self.provider.ollama_options {
            let keep_alive = self
                .ctx
                .config
                .ollama_keep_alive
                .clone()
                .unwrap_or_else(|| DEFAULT_KEEP_ALIVE.to_string());

            chat.options = Some(json!({
                "num_ctx": window.max(DEFAULT_CONTEXT_WINDOW),
                "keep_alive": keep_alive,
            }));
        }

        self.middleware.before_request(&mut chat);

        let url = format!("{}{}", self.provider.base_url, self.provider.api_path);
        let mut builder = self.client.post(&url).json(&chat);
        if let Some(key) = &key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = retry::send_with_retry(builder, &url).await?;
        if !response.status().is_success() {
            return Err(upstream_error(&self.provider, &self.model, response).await);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let tools = request.tools.clone().unwrap_or_default();
        let tracker = self.tracker.clone();

        let mut machine = StreamMachine::new(
            Box::new(sender.clone()),
            adapter,
            tools,
            self.middleware.clone(),
            request.model.clone(),
            input_estimate(&raw_body),
            Box::new(move |usage| {
                tracker.record(usage);
            }),
        );
        machine.start();

        let url_for_errors = url.clone();
        tokio::spawn(async move {
            let mut events = response.bytes_stream().eventsource();
            let mut ping = tokio::time::interval(PING_INTERVAL);
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    maybe_event = events.next() => match maybe_event {
                        Some(Ok(event)) => {
                            if event.data.trim() == "[DONE]" {
                                machine.finalize(None);
                                break;
                            }

                            match serde_json::from_str::<ChatChunk>(&event.data) {
                                Ok(chunk) => feed_chunk(&mut machine, chunk),
                                // A malformed chunk must not tear down the stream.
                                Err(e) => log::debug!("Skipping malformed upstream chunk: {e}"),
                            }

                            if machine.is_finalized() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            let error = ProxyError::Connection {
                                url: url_for_errors.clone(),
                                reason: e.to_string(),
                            };
                            machine.finalize(Some(&error));
                            break;
                        }
                        None => {
                            machine.finalize(None);
                            break;
                        }
                    },
                    _ = ping.tick() => {
                        if sender.is_closed() {
                            log::debug!("Client disconnected, cancelling upstream read");
                            let error = ProxyError::Internal(Some("client disconnected".to_string()));
                            machine.finalize(Some(&error));
                            break;
                        }
                        machine.maybe_ping();
                    }
                }
            }
        });

        Ok(sse_response(receiver))
    }

    fn descriptor(&self) -> &ProviderDescriptor {
        &self.provider
    }

    fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }
}

/// Translates one parsed chunk into machine deltas.
fn feed_chunk(machine: &mut StreamMachine, chunk: ChatChunk) {
    if let Some(usage) = chunk.usage {
        machine.process(UpstreamDelta::Usage {
            input: usage.prompt_tokens,
            output: usage.completion_tokens,
        });
    }

    for choice in chunk.choices {
        machine.observe_chunk(&choice.delta);
        feed_delta(machine, choice.delta);

        if let Some(reason) = choice.finish_reason {
            machine.process(UpstreamDelta::Finish(reason));
        }
    }
}

fn feed_delta(machine: &mut StreamMachine, delta: ChunkDelta) {
    // Reasoning first: upstreams emit it before answer text, and the
    // interlock needs the thinking block closed before text opens.
    if let Some(reasoning) = delta.reasoning {
        machine.process(UpstreamDelta::Reasoning(reasoning));
    }
    if let Some(reasoning) = delta.reasoning_content {
        machine.process(UpstreamDelta::Reasoning(reasoning));
    }
    for detail in delta.reasoning_details.into_iter().flatten() {
        machine.process(UpstreamDelta::ReasoningDetail(detail));
    }

    if let Some(content) = delta.content
        && !content.is_empty()
    {
        machine.process(UpstreamDelta::Text(content));
    }

    for (position, call) in delta.tool_calls.into_iter().flatten().enumerate() {
        let index = call.index.unwrap_or(position);

        if let Some(function) = call.function {
            if let Some(name) = function.name {
                machine.process(UpstreamDelta::ToolCallStart {
                    index,
                    id: call.id,
                    name,
                });
            }

            if let Some(args) = function.arguments
                && !args.is_empty()
            {
                machine.process(UpstreamDelta::ToolCallArgs { index, args });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        middleware::MiddlewareChain,
        protocol::anthropic::{BlockStart, StreamEvent},
        stream::EventSink,
    };
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<StreamEvent>>>);

    impl EventSink for SharedSink {
        fn send(&mut self, event: StreamEvent) {
            self.0.lock().expect("sink lock").push(event);
        }
    }

    fn machine(sink: SharedSink) -> StreamMachine {
        StreamMachine::new(
            Box::new(sink),
            Box::new(crate::adapter::DefaultAdapter),
            vec![],
            MiddlewareChain::default(),
            "test",
            0,
            Box::new(|_| {}),
        )
    }

    #[test]
    fn chunk_with_text_and_finish_feeds_through() {
        let sink = SharedSink::default();
        let mut machine = machine(sink.clone());
        machine.start();

        let chunk: ChatChunk = serde_json::from_value(json!({
            "choices": [{"delta": {"content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 2}
        }))
        .unwrap();

        feed_chunk(&mut machine, chunk);
        machine.finalize(None);

        let events = sink.0.lock().expect("sink lock");
        assert!(events.iter().any(|event| matches!(
            event,
            StreamEvent::ContentBlockStart {
                content_block: BlockStart::Text { .. },
                ..
            }
        )));
    }

    #[test]
    fn tool_call_deltas_use_upstream_index() {
        let sink = SharedSink::default();
        let mut machine = machine(sink.clone());
        machine.start();

        for data in [
            json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "id": "call_1", "function": {"name": "Read", "arguments": ""}}]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": "{\"file_path\":\"/tmp/a\"}"}}]}}]}),
            json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
        ] {
            feed_chunk(&mut machine, serde_json::from_value(data).unwrap());
        }
        machine.finalize(None);

        let events = sink.0.lock().expect("sink lock");
        let started = events.iter().any(|event| {
            matches!(
                event,
                StreamEvent::ContentBlockStart {
                    content_block: BlockStart::ToolUse { name, .. },
                    ..
                } if name == "Read"
            )
        });
        assert!(started, "tool block must be emitted");
    }
}
