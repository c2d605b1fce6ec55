//! Anthropic Messages API types.
//!
//! Request side follows the [Messages API reference](https://docs.anthropic.com/en/api/messages):
//! content is an array of tagged blocks, the system prompt lives outside the
//! messages array, and tool use flows as `tool_use` / `tool_result` blocks.
//! The streaming side models the full SSE event surface the proxy emits back
//! to the client.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Request body for `POST /v1/messages`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessagesRequest {
    /// Requested model. May carry a provider prefix (`ollama/qwen3`) or be a
    /// full URL pinning a local server.
    pub model: String,

    /// Conversation turns, alternating user and assistant.
    pub messages: Vec<Message>,

    /// Maximum number of tokens to generate. The count_tokens body omits
    /// it, so a default stands in there.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// System prompt, either a bare string or an array of text blocks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,

    /// When true, the response is an SSE stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Tools the model may call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    /// Extended thinking configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,

    /// Opaque request metadata, passed through untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl MessagesRequest {
    /// Flattened system prompt text, blocks joined with blank lines.
    pub fn system_text(&self) -> Option<String> {
        self.system.as_ref().map(SystemPrompt::flatten)
    }

    /// Thinking budget in tokens, when extended thinking is enabled.
    pub fn thinking_budget(&self) -> Option<u32> {
        self.thinking.as_ref().and_then(|t| t.budget_tokens)
    }
}

/// System prompt: the API accepts either a string or text blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    /// Bare string form.
    Text(String),
    /// Block array form.
    Blocks(Vec<SystemBlock>),
}

impl SystemPrompt {
    /// Joins block text with blank lines; identity for the string form.
    pub fn flatten(&self) -> String {
        match self {
            SystemPrompt::Text(text) => text.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .map(|block| block.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }
}

/// A single text block inside an array-form system prompt.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemBlock {
    #[serde(rename = "type", default = "text_type")]
    pub block_type: String,
    pub text: String,
}

fn text_type() -> String {
    "text".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

/// A conversation turn.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub role: Role,

    /// Content blocks. A bare string on the wire is normalised to a single
    /// text block at deserialization time.
    #[serde(deserialize_with = "string_or_blocks")]
    pub content: Vec<ContentBlock>,
}

impl Message {
    /// Builds a user turn from plain text.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Builds an assistant turn from plain text.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// True when any block is a tool use.
    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|block| matches!(block, ContentBlock::ToolUse { .. }))
    }

    /// Ids of the tool-use blocks in this turn.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Ids referenced by the tool-result blocks in this turn.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }
}

fn string_or_blocks<'de, D>(deserializer: D) -> Result<Vec<ContentBlock>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrBlocks {
        Text(String),
        Blocks(Vec<ContentBlock>),
    }

    Ok(match StringOrBlocks::deserialize(deserializer)? {
        StringOrBlocks::Text(text) => vec![ContentBlock::Text { text }],
        StringOrBlocks::Blocks(blocks) => blocks,
    })
}

/// Message sender role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A tagged content block.
///
/// Tool results only appear in user turns; tool use and thinking only in
/// assistant turns.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },

    Image {
        source: ImageSource,
    },

    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: ToolResultContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },

    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

/// Base64-encoded image source.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageSource {
    #[serde(rename = "type", default = "base64_type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

fn base64_type() -> String {
    "base64".to_string()
}

/// Tool result payload: a string, nested blocks, or arbitrary JSON.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ToolResultBlock>),
    Json(Value),
}

impl Default for ToolResultContent {
    fn default() -> Self {
        ToolResultContent::Text(String::new())
    }
}

impl ToolResultContent {
    /// Flattens the payload into plain text for backends without structured
    /// tool-result support.
    pub fn flatten(&self) -> String {
        match self {
            ToolResultContent::Text(text) => text.clone(),
            ToolResultContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| block.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
            ToolResultContent::Json(value) => match value.as_str() {
                Some(text) => text.to_string(),
                None => value.to_string(),
            },
        }
    }
}

/// A nested block inside a structured tool result.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolResultBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// A tool the model may call.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

impl Tool {
    /// Names listed under `input_schema.required`.
    pub fn required_params(&self) -> Vec<String> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Controls how the model uses tools.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolChoice {
    Auto,
    None,
    Any,
    Tool { name: String },
}

/// Extended thinking configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type", default = "enabled_type")]
    pub config_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
}

fn enabled_type() -> String {
    "enabled".to_string()
}

/// Response body for `POST /v1/messages/count_tokens`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CountTokensResponse {
    pub input_tokens: u64,
}

/// Token usage counters carried in `message_start` and `message_delta`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

/// Why the model stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    /// The stream was torn down before the model finished.
    Error,
}

/// Server-sent events emitted on the `/v1/messages` stream.
///
/// Streams begin with `message_start`, carry one or more content block
/// lifecycles (`content_block_start` → `content_block_delta*` →
/// `content_block_stop`), and finish with `message_delta`, `message_stop`
/// and a `data: [DONE]` sentinel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: MessageStart,
    },
    Ping,
    ContentBlockStart {
        index: usize,
        content_block: BlockStart,
    },
    ContentBlockDelta {
        index: usize,
        delta: Delta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    MessageStop,
    Error {
        error: ErrorBody,
    },
}

impl StreamEvent {
    /// SSE `event:` name for this payload.
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::Ping => "ping",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// Serializes to a complete SSE frame.
    pub fn to_frame(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|e| {
            log::error!("Failed to serialize stream event: {e}");
            r#"{"type":"error","error":{"type":"api_error","message":"serialization failed"}}"#.to_string()
        });

        format!("event: {}\ndata: {}\n\n", self.event_name(), data)
    }
}

/// Metadata announced by `message_start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStart {
    pub id: String,
    #[serde(rename = "type", default = "message_type")]
    pub message_type: String,
    pub role: String,
    pub content: Vec<Value>,
    pub model: String,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

fn message_type() -> String {
    "message".to_string()
}

impl MessageStart {
    /// Fresh message announcement with a minted id.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            message_type: message_type(),
            role: "assistant".to_string(),
            content: Vec::new(),
            model: model.into(),
            stop_reason: None,
            stop_sequence: None,
            usage: Usage::default(),
        }
    }
}

/// Shape of a block at `content_block_start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockStart {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { id: String, name: String, input: Value },
}

/// Incremental update for an open block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
}

/// Top-level changes carried by `message_delta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDeltaBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
}

/// Error payload, both for HTTP error responses and in-stream `error` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}
