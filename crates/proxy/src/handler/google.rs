//! Handler for the native Gemini API.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{body::Bytes, response::Response};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use secrecy::ExposeSecret;
use tokio::sync::mpsc;

use super::{Handler, HandlerContext, check_capabilities, credential, input_estimate, sse_response, upstream_error};
use crate::{
    adapter,
    detect::DEFAULT_CONTEXT_WINDOW,
    error::{ProxyError, ProxyResult},
    http_client::http_client,
    middleware::MiddlewareChain,
    protocol::{anthropic::MessagesRequest, google::GenerateChunk},
    prune, recovery,
    registry::{ProviderDescriptor, Route},
    retry,
    stream::{PING_INTERVAL, StreamMachine, UpstreamDelta},
    tracker::SessionTracker,
    translate::{self, ToolSummarization, google::ToolNameMap},
};

pub struct GoogleHandler {
    provider: ProviderDescriptor,
    model: String,
    client: reqwest::Client,
    ctx: Arc<HandlerContext>,
    tracker: Arc<SessionTracker>,
    /// Session-lifetime map from tool-use ids to function names and thought
    /// signatures. Required for the functionResponse round trip.
    tool_names: Arc<Mutex<ToolNameMap>>,
}

impl GoogleHandler {
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
            ctx: ctx.clone(),
            tracker,
            tool_names: Arc::new(Mutex::new(ToolNameMap::default())),
        }
    }
}

#[async_trait]
impl Handler for GoogleHandler {
    async fn handle(&self, mut request: MessagesRequest, raw_body: Bytes) -> ProxyResult<Response> {
        let key = credential(&self.provider)?.ok_or_else(|| ProxyError::MissingCredential {
            env: "GEMINI_API_KEY".to_string(),
            hint_url: self.provider.hint_url.to_string(),
        })?;
        check_capabilities(&self.provider, &request, &self.model)?;

        prune::maybe_prune(&mut request, self.tracker.context_used(), self.tracker.context_window());

        let adapter = adapter::select(&self.model);

        let mut generate = {
            let mut names = self.tool_names.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            translate::google::to_generate_request(&request, &self.model, &mut names, ToolSummarization::Off)
        };

        if let Some(config) = generate.generation_config.as_mut() {
            adapter.prepare_google(config, &request, &self.model);
        }

        let url = format!(
            "{}{}/{}:streamGenerateContent?alt=sse",
            self.provider.base_url, self.provider.api_path, self.model
        );

        let builder = self
            .client
            .post(&url)
            .header("x-goog-api-key", key.expose_secret())
            .json(&generate);

        let response = retry::send_with_retry(builder, &url).await?;
        if !response.status().is_success() {
            return Err(upstream_error(&self.provider, &self.model, response).await);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let tracker = self.tracker.clone();
        let tool_names = self.tool_names.clone();
        let tools = request.tools.clone().unwrap_or_default();

        let mut machine = StreamMachine::new(
            Box::new(sender.clone()),
            adapter,
            tools,
            MiddlewareChain::default(),
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
            let mut call_counter = 0usize;

            loop {
                tokio::select! {
                    maybe_event = events.next() => match maybe_event {
                        Some(Ok(event)) => {
                            match serde_json::from_str::<GenerateChunk>(&event.data) {
                                Ok(chunk) => feed_chunk(&mut machine, chunk, &tool_names, &mut call_counter),
                                Err(e) => log::debug!("Skipping malformed Gemini chunk: {e}"),
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
                            log::debug!("Client disconnected, cancelling Gemini read");
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

/// Converts one Gemini chunk into machine deltas, recording every function
/// call in the tool-name map for the later functionResponse round trip.
fn feed_chunk(
    machine: &mut StreamMachine,
    chunk: GenerateChunk,
    tool_names: &Arc<Mutex<ToolNameMap>>,
    call_counter: &mut usize,
) {
    if let Some(usage) = chunk.usage_metadata {
        machine.process(UpstreamDelta::Usage {
            input: usage.prompt_token_count,
            output: usage.candidates_token_count,
        });
    }

    for candidate in chunk.candidates {
        if let Some(content) = candidate.content {
            for part in content.parts {
                if let Some(call) = part.function_call {
                    let id = recovery::mint_tool_id();

                    tool_names
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .record(id.clone(), call.name.clone(), part.thought_signature.clone());

                    machine.process(UpstreamDelta::ToolCallComplete {
                        index: *call_counter,
                        id: Some(id),
                        name: call.name,
                        args: call.args.to_string(),
                    });
                    *call_counter += 1;
                    continue;
                }

                if let Some(text) = part.text {
                    if part.thought == Some(true) {
                        machine.process(UpstreamDelta::Reasoning(text));
                    } else {
                        machine.process(UpstreamDelta::Text(text));
                    }
                }
            }
        }

        if let Some(reason) = candidate.finish_reason {
            let mapped = match reason.as_str() {
                "MAX_TOKENS" => "max_tokens",
                _ => "stop",
            };
            machine.process(UpstreamDelta::Finish(mapped.to_string()));
        }
    }
}
