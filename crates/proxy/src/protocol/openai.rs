//! OpenAI chat/completions wire types.
//!
//! Used for the direct OpenAI API, OpenAI-compatible cloud aggregators, and
//! every local inference server (Ollama, LM Studio, vLLM, MLX). Adapter
//! dialect fields (`reasoning_effort`, `enable_thinking`, …) ride in the
//! flattened `extra` map so each family can attach its own parameters.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request body for `POST <base>/v1/chat/completions`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,

    pub stream: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,

    /// Ollama-dialect server options (`num_ctx`, `keep_alive`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,

    /// Family-specific parameters attached by adapters.
    #[serde(flatten, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

/// A chat message in OpenAI format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,

    /// `None` is serialized as `null`, which OpenAI requires for assistant
    /// messages that carry only tool calls.
    pub content: Option<ChatContent>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// Present on `tool` role messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Opaque reasoning blobs replayed for providers that require them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_details: Option<Vec<Value>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::plain(ChatRole::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::plain(ChatRole::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::plain(ChatRole::Assistant, text)
    }

    pub fn tool(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(ChatContent::Text(text.into())),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            reasoning_details: None,
        }
    }

    fn plain(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(ChatContent::Text(text.into())),
            tool_calls: None,
            tool_call_id: None,
            reasoning_details: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Message content: plain text or multi-modal parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    /// `data:<mime>;base64,<data>` URL.
    pub url: String,
}

/// A completed tool call on an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments object.
    pub arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

/// A tool declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type", default = "function_type")]
    pub def_type: String,
    pub function: FunctionDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

/// A streamed chunk of a chat completion.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<ChunkUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Incremental delta inside a chunk choice.
///
/// `reasoning` / `reasoning_content` cover the plain-text reasoning dialects
/// (OpenRouter and DeepSeek respectively); `reasoning_details` carries the
/// structured entries some aggregators emit, including encrypted signatures.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub reasoning_details: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChunkUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

/// Reads the `type` discriminator of a `reasoning_details` entry.
pub fn reasoning_detail_kind(detail: &Value) -> Option<&str> {
    detail.get("type").and_then(Value::as_str)
}

/// Extracts the display text of a `reasoning.text` / `reasoning.summary` entry.
pub fn reasoning_detail_text(detail: &Value) -> Option<&str> {
    detail
        .get("text")
        .or_else(|| detail.get("summary"))
        .and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assistant_with_tool_calls_serializes_null_content() {
        let message = ChatMessage {
            role: ChatRole::Assistant,
            content: None,
            tool_calls: Some(vec![ToolCall {
                id: "call_1".to_string(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: "Read".to_string(),
                    arguments: r#"{"file_path":"/tmp/a"}"#.to_string(),
                },
            }]),
            tool_call_id: None,
            reasoning_details: None,
        };

        let json = serde_json::to_value(&message).unwrap();
        assert!(json["content"].is_null());
        assert_eq!(json["tool_calls"][0]["function"]["name"], "Read");
    }

    #[test]
    fn extra_fields_flatten_onto_request_body() {
        let mut request = ChatRequest {
            model: "o3-mini".to_string(),
            stream: true,
            ..Default::default()
        };
        request
            .extra
            .insert("reasoning_effort".to_string(), json!("medium"));

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["reasoning_effort"], "medium");
        assert!(json.get("thinking").is_none());
    }

    #[test]
    fn chunk_parses_tool_call_delta() {
        let chunk: ChatChunk = serde_json::from_value(json!({
            "choices": [{
                "delta": {
                    "tool_calls": [{
                        "index": 0,
                        "id": "call_abc",
                        "function": {"name": "Bash", "arguments": ""}
                    }]
                },
                "finish_reason": null
            }]
        }))
        .unwrap();

        let calls = chunk.choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id.as_deref(), Some("call_abc"));
        assert_eq!(
            calls[0].function.as_ref().unwrap().name.as_deref(),
            Some("Bash")
        );
    }

    #[test]
    fn reasoning_detail_helpers() {
        let detail = json!({"type": "reasoning.text", "text": "thinking hard"});
        assert_eq!(reasoning_detail_kind(&detail), Some("reasoning.text"));
        assert_eq!(reasoning_detail_text(&detail), Some("thinking hard"));

        let encrypted = json!({"type": "reasoning.encrypted", "data": "opaque"});
        assert_eq!(reasoning_detail_kind(&encrypted), Some("reasoning.encrypted"));
        assert_eq!(reasoning_detail_text(&encrypted), None);
    }
}
