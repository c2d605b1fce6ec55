//! The streaming state machine.
//!
//! Consumes upstream deltas (already parsed out of provider SSE by the
//! handler) and emits a well-formed Anthropic event stream: `message_start`,
//! `ping`, interleaved content-block lifecycles, `message_delta`,
//! `message_stop`. A single machine instance is the sole writer for its
//! stream, which is what enforces the block interlock.
//!
//! Interlock rules: opening text closes any open thinking block; opening a
//! tool-use block closes both; thinking never re-opens once answer text has
//! started. Every block gets a fresh monotonic index.

use std::collections::BTreeMap;

use tokio::time::Instant;

use crate::{
    adapter::Adapter,
    error::ProxyError,
    middleware::{MiddlewareChain, StreamMetadata},
    protocol::{
        anthropic::{BlockStart, Delta, MessageDeltaBody, MessageStart, StopReason, StreamEvent, Tool, Usage},
        openai::ChunkDelta,
    },
    recovery::{self, ExtractedToolCall},
};

/// Text withholding kicks in only while the suspect buffer is small;
/// anything larger is almost certainly prose that merely mentions a tool.
const WITHHOLD_LIMIT: usize = 1_000;

/// Keep-alive interval.
pub const PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Where emitted events go. Implemented by the SSE channel in production and
/// by a plain `Vec` in tests.
pub trait EventSink: Send {
    fn send(&mut self, event: StreamEvent);
}

impl EventSink for tokio::sync::mpsc::UnboundedSender<StreamEvent> {
    fn send(&mut self, event: StreamEvent) {
        // A closed receiver means the client went away; the handler notices
        // separately and finalizes.
        let _ = tokio::sync::mpsc::UnboundedSender::send(self, event);
    }
}

impl EventSink for Vec<StreamEvent> {
    fn send(&mut self, event: StreamEvent) {
        self.push(event);
    }
}

/// Upstream deltas in provider-neutral form.
#[derive(Debug, Clone)]
pub enum UpstreamDelta {
    /// Answer text.
    Text(String),
    /// Plain-text reasoning (OpenRouter `reasoning`, DeepSeek
    /// `reasoning_content`, Gemini thought parts).
    Reasoning(String),
    /// A structured `reasoning_details` entry.
    ReasoningDetail(serde_json::Value),
    /// A new structured tool call began at the given upstream index.
    ToolCallStart {
        index: usize,
        id: Option<String>,
        name: String,
    },
    /// Argument fragment for the tool call at the given upstream index.
    ToolCallArgs { index: usize, args: String },
    /// A complete tool call delivered in one piece (Gemini).
    ToolCallComplete {
        index: usize,
        id: Option<String>,
        name: String,
        args: String,
    },
    /// Upstream finish reason.
    Finish(String),
    /// Usage counters.
    Usage { input: u32, output: u32 },
}

/// Final accounting handed to the token tracker exactly once per stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamUsage {
    pub usage: Usage,
    /// True when output tokens were estimated rather than reported.
    pub estimated: bool,
}

type TokenSink = Box<dyn FnMut(StreamUsage) + Send>;

struct ToolEntry {
    id: String,
    name: String,
    /// Anthropic block index once the block has been started.
    block_index: Option<usize>,
    args: String,
    /// Buffered entries hold their args for validation at finish time
    /// instead of streaming them.
    buffered: bool,
    closed: bool,
}

/// Per-stream translation state. One instance per `/v1/messages` call.
pub struct StreamMachine {
    sink: Box<dyn EventSink>,
    adapter: Box<dyn Adapter>,
    tools: Vec<Tool>,
    middleware: MiddlewareChain,
    meta: StreamMetadata,
    tokens: TokenSink,

    model: String,
    input_token_estimate: u32,

    current_index: usize,
    text_open: Option<usize>,
    reasoning_open: Option<usize>,
    /// Set once answer text has been emitted; thinking may not re-open.
    text_seen: bool,
    tool_entries: BTreeMap<usize, ToolEntry>,

    accumulated_text: String,
    /// Bytes of `accumulated_text` already emitted to the client.
    emitted_len: usize,
    withholding: bool,

    usage: Option<Usage>,
    finish_reason: Option<String>,
    any_tool_block: bool,
    started: bool,
    finalized: bool,
    last_activity: Instant,
}

impl StreamMachine {
    pub fn new(
        sink: Box<dyn EventSink>,
        adapter: Box<dyn Adapter>,
        tools: Vec<Tool>,
        middleware: MiddlewareChain,
        model: impl Into<String>,
        input_token_estimate: u32,
        tokens: TokenSink,
    ) -> Self {
        Self {
            sink,
            adapter,
            tools,
            middleware,
            meta: StreamMetadata::default(),
            tokens,
            model: model.into(),
            input_token_estimate,
            current_index: 0,
            text_open: None,
            reasoning_open: None,
            text_seen: false,
            tool_entries: BTreeMap::new(),
            accumulated_text: String::new(),
            emitted_len: 0,
            withholding: false,
            usage: None,
            finish_reason: None,
            any_tool_block: false,
            started: false,
            finalized: false,
            last_activity: Instant::now(),
        }
    }

    /// Emits `message_start` and the initial `ping`.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.adapter.reset();

        let mut message = MessageStart::new(self.model.clone());
        message.usage.input_tokens = self.input_token_estimate;

        self.emit(StreamEvent::MessageStart { message });
        self.emit(StreamEvent::Ping);
    }

    /// Runs the middleware chunk hook over a raw OpenAI-style delta.
    pub fn observe_chunk(&mut self, delta: &ChunkDelta) {
        self.middleware.after_stream_chunk(delta, &mut self.meta);
    }

    /// Feeds one upstream delta through the machine.
    pub fn process(&mut self, delta: UpstreamDelta) {
        if self.finalized {
            return;
        }

        match delta {
            UpstreamDelta::Text(chunk) => self.on_text(&chunk),
            UpstreamDelta::Reasoning(chunk) => self.on_reasoning(&chunk),
            UpstreamDelta::ReasoningDetail(detail) => self.on_reasoning_detail(&detail),
            UpstreamDelta::ToolCallStart { index, id, name } => self.on_tool_start(index, id, name),
            UpstreamDelta::ToolCallArgs { index, args } => self.on_tool_args(index, &args),
            UpstreamDelta::ToolCallComplete { index, id, name, args } => {
                self.on_tool_start(index, id, name);
                self.on_tool_args(index, &args);
            }
            UpstreamDelta::Finish(reason) => self.on_finish(reason),
            UpstreamDelta::Usage { input, output } => {
                self.usage = Some(Usage {
                    input_tokens: input,
                    output_tokens: output,
                });
            }
        }
    }

    /// Emits a keep-alive ping if the stream has been idle past the interval.
    ///
    /// Pings only fire between block lifecycles so the emitted sequence
    /// stays within the documented event grammar.
    pub fn maybe_ping(&mut self) {
        if self.finalized || !self.started {
            return;
        }

        if self.block_open() {
            return;
        }

        if self.last_activity.elapsed() > PING_INTERVAL {
            self.emit(StreamEvent::Ping);
        }
    }

    /// True when finalize has already run.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Closes the stream. Idempotent; every exit path funnels through here.
    pub fn finalize(&mut self, error: Option<&ProxyError>) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        if !self.started {
            self.started = true;
            let mut message = MessageStart::new(self.model.clone());
            message.usage.input_tokens = self.input_token_estimate;
            self.emit(StreamEvent::MessageStart { message });
            self.emit(StreamEvent::Ping);
        }

        // Drain whatever the adapter was still holding.
        if let Some(tail) = self.adapter.flush()
            && !tail.is_empty()
        {
            self.accumulated_text.push_str(&tail);
        }

        // Tool calls hidden in the text become real tool blocks.
        let extracted = if self.tools.is_empty() {
            Vec::new()
        } else {
            recovery::extract_embedded_calls(&self.accumulated_text, &self.tools)
        };

        if extracted.is_empty() {
            self.release_withheld_text();
        } else {
            for call in extracted {
                self.emit_extracted(call);
            }
        }

        // Settling also closes entries whose stream was cut mid-call.
        self.settle_tool_entries();
        self.close_text();
        self.close_reasoning();

        self.middleware.after_stream_complete(&self.meta);

        if let Some(error) = error {
            self.emit(StreamEvent::Error {
                error: error.to_error_body(),
            });
        }

        let stop_reason = if error.is_some() {
            StopReason::Error
        } else if self.any_tool_block {
            StopReason::ToolUse
        } else {
            match self.finish_reason.as_deref() {
                Some("length") | Some("max_tokens") | Some("MAX_TOKENS") => StopReason::MaxTokens,
                _ => StopReason::EndTurn,
            }
        };

        let (usage, estimated) = match self.usage {
            Some(usage) => (usage, false),
            None => (
                Usage {
                    input_tokens: self.input_token_estimate,
                    output_tokens: estimate_tokens(&self.accumulated_text),
                },
                true,
            ),
        };

        self.emit(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: Some(usage),
        });
        self.emit(StreamEvent::MessageStop);

        (self.tokens)(StreamUsage { usage, estimated });
    }

    fn on_text(&mut self, chunk: &str) {
        let accumulated = self.accumulated_text.clone();
        let processed = self.adapter.process_text(chunk, &accumulated);

        for call in processed.extracted_tool_calls {
            self.emit_extracted(call);
        }

        if processed.cleaned.is_empty() {
            return;
        }

        self.accumulated_text.push_str(&processed.cleaned);

        // Structured signature detection is authoritative: matching text is
        // withheld and converted at finalize time instead of being shown.
        if !self.tools.is_empty()
            && self.accumulated_text.len() < WITHHOLD_LIMIT
            && recovery::detect_structured_signature(&self.accumulated_text, &self.tools)
        {
            self.withholding = true;
            return;
        }

        if self.withholding && self.accumulated_text.len() >= WITHHOLD_LIMIT {
            // Too large to be a signature after all; let it all out.
            self.withholding = false;
        }

        if self.withholding {
            return;
        }

        let pending = self.accumulated_text[self.emitted_len..].to_string();
        if pending.is_empty() {
            return;
        }

        self.open_text();
        let index = self.text_open.unwrap_or_default();
        self.emitted_len = self.accumulated_text.len();
        self.emit(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::TextDelta { text: pending },
        });
    }

    fn on_reasoning(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }

        // Thinking never re-opens once answer text has started.
        if self.text_seen && self.reasoning_open.is_none() {
            log::debug!("Dropping late reasoning delta after answer text began");
            return;
        }

        self.open_reasoning();
        let index = self.reasoning_open.unwrap_or_default();
        self.emit(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::ThinkingDelta {
                thinking: chunk.to_string(),
            },
        });
    }

    fn on_reasoning_detail(&mut self, detail: &serde_json::Value) {
        use crate::protocol::openai::{reasoning_detail_kind, reasoning_detail_text};

        match reasoning_detail_kind(detail) {
            Some("reasoning.text") | Some("reasoning.summary") => {
                if let Some(text) = reasoning_detail_text(detail) {
                    let text = text.to_string();
                    self.on_reasoning(&text);
                }
            }
            // Encrypted entries never reach the client; the middleware has
            // already captured them for replay.
            Some("reasoning.encrypted") => {}
            other => {
                log::debug!("Ignoring reasoning detail of kind {other:?}");
            }
        }
    }

    fn on_tool_start(&mut self, index: usize, id: Option<String>, name: String) {
        if self.tool_entries.contains_key(&index) {
            return;
        }

        self.close_text();
        self.close_reasoning();

        let buffered = !self.tools.is_empty();
        let id = id.unwrap_or_else(recovery::mint_tool_id);

        let mut entry = ToolEntry {
            id,
            name,
            block_index: None,
            args: String::new(),
            buffered,
            closed: false,
        };

        if !buffered {
            // No schema to validate against: stream the block live.
            let block_index = self.next_index();
            entry.block_index = Some(block_index);
            self.any_tool_block = true;
            let event = StreamEvent::ContentBlockStart {
                index: block_index,
                content_block: BlockStart::ToolUse {
                    id: entry.id.clone(),
                    name: entry.name.clone(),
                    input: serde_json::json!({}),
                },
            };
            self.emit(event);
        }

        self.tool_entries.insert(index, entry);
    }

    fn on_tool_args(&mut self, index: usize, args: &str) {
        let Some(entry) = self.tool_entries.get_mut(&index) else {
            log::debug!("Arguments for unknown tool call index {index}, ignoring");
            return;
        };

        entry.args.push_str(args);
        let live_block = (!entry.buffered).then_some(entry.block_index).flatten();

        if let Some(block_index) = live_block {
            self.emit(StreamEvent::ContentBlockDelta {
                index: block_index,
                delta: Delta::InputJsonDelta {
                    partial_json: args.to_string(),
                },
            });
        }
    }

    fn on_finish(&mut self, reason: String) {
        if reason == "tool_calls" || reason == "tool_use" {
            self.settle_tool_entries();
        }
        self.finish_reason = Some(reason);
    }

    /// Validates and closes every open tool entry (rule: finish-reason
    /// `tool_calls`). Also invoked from finalize for streams that end
    /// without a finish reason.
    fn settle_tool_entries(&mut self) {
        let indices: Vec<usize> = self
            .tool_entries
            .iter()
            .filter(|(_, entry)| !entry.closed)
            .map(|(&index, _)| index)
            .collect();

        for index in indices {
            self.settle_tool_entry(index);
        }
    }

    fn settle_tool_entry(&mut self, index: usize) {
        let Some(entry) = self.tool_entries.get(&index) else {
            return;
        };

        let name = entry.name.clone();
        let id = entry.id.clone();
        let args = entry.args.clone();
        let buffered = entry.buffered;
        let block_index = entry.block_index;

        let outcome = recovery::validate_and_repair(&name, &args, &self.tools, &self.accumulated_text);

        if !outcome.valid {
            // A broken call is never forwarded; the client sees a text block
            // naming what was missing instead.
            let message = format!(
                "Tool call {name} was dropped: missing required parameters: {}",
                outcome.missing_params.join(", ")
            );
            log::warn!("{message}");

            self.close_text();
            self.close_reasoning();
            let text_index = self.next_index();
            self.emit(StreamEvent::ContentBlockStart {
                index: text_index,
                content_block: BlockStart::Text { text: String::new() },
            });
            self.emit(StreamEvent::ContentBlockDelta {
                index: text_index,
                delta: Delta::TextDelta { text: message },
            });
            self.emit(StreamEvent::ContentBlockStop { index: text_index });

            if let Some(block_index) = block_index {
                // The broken call had already started streaming; close it.
                self.emit(StreamEvent::ContentBlockStop { index: block_index });
            }

            if let Some(entry) = self.tool_entries.get_mut(&index) {
                entry.closed = true;
            }
            return;
        }

        let payload = serde_json::to_string(&outcome.args).unwrap_or_else(|_| "{}".to_string());

        match block_index {
            Some(block_index) => {
                // Live-streamed entry: arguments already went out.
                self.emit(StreamEvent::ContentBlockStop { index: block_index });
            }
            None => {
                self.close_text();
                self.close_reasoning();
                let block_index = self.next_index();
                self.any_tool_block = true;

                self.emit(StreamEvent::ContentBlockStart {
                    index: block_index,
                    content_block: BlockStart::ToolUse {
                        id,
                        name,
                        input: serde_json::json!({}),
                    },
                });
                if buffered && !payload.is_empty() {
                    self.emit(StreamEvent::ContentBlockDelta {
                        index: block_index,
                        delta: Delta::InputJsonDelta { partial_json: payload },
                    });
                }
                self.emit(StreamEvent::ContentBlockStop { index: block_index });
            }
        }

        if let Some(entry) = self.tool_entries.get_mut(&index) {
            entry.closed = true;
        }
    }

    /// Emits an adapter- or extractor-recovered call as a complete block.
    fn emit_extracted(&mut self, call: ExtractedToolCall) {
        self.close_text();
        self.close_reasoning();

        let index = self.next_index();
        self.any_tool_block = true;

        self.emit(StreamEvent::ContentBlockStart {
            index,
            content_block: BlockStart::ToolUse {
                id: call.id,
                name: call.name,
                input: serde_json::json!({}),
            },
        });
        self.emit(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::InputJsonDelta {
                partial_json: call.input.to_string(),
            },
        });
        self.emit(StreamEvent::ContentBlockStop { index });
    }

    /// Flushes text that was withheld for a signature that never completed.
    fn release_withheld_text(&mut self) {
        if self.emitted_len >= self.accumulated_text.len() {
            return;
        }

        let pending = self.accumulated_text[self.emitted_len..].to_string();
        self.emitted_len = self.accumulated_text.len();

        self.open_text();
        let index = self.text_open.unwrap_or_default();
        self.emit(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::TextDelta { text: pending },
        });
    }

    fn open_text(&mut self) {
        if self.text_open.is_some() {
            return;
        }

        self.close_reasoning();

        let index = self.next_index();
        self.text_open = Some(index);
        self.text_seen = true;
        self.emit(StreamEvent::ContentBlockStart {
            index,
            content_block: BlockStart::Text { text: String::new() },
        });
    }

    fn close_text(&mut self) {
        if let Some(index) = self.text_open.take() {
            self.emit(StreamEvent::ContentBlockStop { index });
        }
    }

    fn open_reasoning(&mut self) {
        if self.reasoning_open.is_some() {
            return;
        }

        let index = self.next_index();
        self.reasoning_open = Some(index);
        self.emit(StreamEvent::ContentBlockStart {
            index,
            content_block: BlockStart::Thinking {
                thinking: String::new(),
            },
        });
    }

    fn close_reasoning(&mut self) {
        if let Some(index) = self.reasoning_open.take() {
            self.emit(StreamEvent::ContentBlockStop { index });
        }
    }

    fn block_open(&self) -> bool {
        self.text_open.is_some()
            || self.reasoning_open.is_some()
            || self
                .tool_entries
                .values()
                .any(|entry| entry.block_index.is_some() && !entry.closed)
    }

    fn next_index(&mut self) -> usize {
        let index = self.current_index;
        self.current_index += 1;
        index
    }

    fn emit(&mut self, event: StreamEvent) {
        self.last_activity = Instant::now();
        self.sink.send(event);
    }
}

/// Rough token estimate used when upstream omits usage.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len().div_ceil(4)) as u32
}
