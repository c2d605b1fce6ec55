//! Anthropic Messages → Gemini generateContent translation.

use std::collections::HashMap;

use serde_json::{Value, json};

use super::{ToolSummarization, identity, tools};
use crate::protocol::{
    anthropic::{ContentBlock, MessagesRequest, Role},
    google::{Content, GenerateRequest, GenerationConfig, Part},
};

/// Tool-call-id → (name, thought signature) map.
///
/// Gemini's `functionResponse` requires the function *name*, which the
/// Anthropic `tool_result` block does not carry. The handler owns one map
/// per session and records every function call it emits; rewound
/// conversations that reference unknown ids lose the block with a warning.
#[derive(Debug, Default)]
pub struct ToolNameMap {
    entries: HashMap<String, ToolNameEntry>,
}

#[derive(Debug, Clone)]
struct ToolNameEntry {
    name: String,
    thought_signature: Option<String>,
}

impl ToolNameMap {
    pub fn record(&mut self, tool_use_id: impl Into<String>, name: impl Into<String>, signature: Option<String>) {
        self.entries.insert(
            tool_use_id.into(),
            ToolNameEntry {
                name: name.into(),
                thought_signature: signature,
            },
        );
    }

    pub fn name_for(&self, tool_use_id: &str) -> Option<&str> {
        self.entries.get(tool_use_id).map(|entry| entry.name.as_str())
    }

    pub fn signature_for(&self, tool_use_id: &str) -> Option<&str> {
        self.entries
            .get(tool_use_id)
            .and_then(|entry| entry.thought_signature.as_deref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builds the outbound Gemini request body.
///
/// `generation_config.thinking_config` is left unset; the Gemini adapter
/// fills it during request prep.
pub fn to_generate_request(
    request: &MessagesRequest,
    model_id: &str,
    map: &mut ToolNameMap,
    summarization: ToolSummarization,
) -> GenerateRequest {
    let system = request.system_text();
    let system_instruction = Some(Content::system(identity::decorate_system(system.as_deref(), model_id)));

    let mut contents = Vec::with_capacity(request.messages.len());

    for message in &request.messages {
        let parts = match message.role {
            Role::User => user_parts(message.content.as_slice(), map),
            Role::Assistant => assistant_parts(message.content.as_slice(), map),
        };

        if parts.is_empty() {
            continue;
        }

        contents.push(match message.role {
            Role::User => Content::user(parts),
            Role::Assistant => Content::model(parts),
        });
    }

    GenerateRequest {
        contents,
        system_instruction,
        tools: request
            .tools
            .as_deref()
            .and_then(|declared| tools::to_google_tools(declared, summarization)),
        generation_config: Some(GenerationConfig {
            temperature: request.temperature,
            top_p: request.top_p,
            max_output_tokens: Some(request.max_tokens),
            thinking_config: None,
        }),
    }
}

fn user_parts(blocks: &[ContentBlock], map: &ToolNameMap) -> Vec<Part> {
    let mut parts = Vec::with_capacity(blocks.len());

    for block in blocks {
        match block {
            ContentBlock::Text { text } => parts.push(Part::text(text)),
            ContentBlock::Image { source } => {
                parts.push(Part::inline_data(source.media_type.clone(), source.data.clone()));
            }
            ContentBlock::ToolResult {
                tool_use_id, content, ..
            } => match map.name_for(tool_use_id) {
                Some(name) => {
                    parts.push(Part::function_response(name, json!({"content": content.flatten()})));
                }
                None => {
                    log::warn!(
                        "No recorded function name for tool result {tool_use_id}; dropping block \
                         (conversation may have been rewound)"
                    );
                }
            },
            _ => log::warn!("Ignoring assistant-only block in user turn"),
        }
    }

    parts
}

fn assistant_parts(blocks: &[ContentBlock], map: &mut ToolNameMap) -> Vec<Part> {
    let mut parts = Vec::with_capacity(blocks.len());

    for block in blocks {
        match block {
            ContentBlock::Text { text } => parts.push(Part::text(text)),
            ContentBlock::ToolUse { id, name, input } => {
                let signature = map.signature_for(id).map(str::to_string);

                // Re-record so lookups survive even when history arrived
                // from the client rather than from our own stream.
                map.record(id.clone(), name.clone(), signature.clone());

                let mut part = Part::function_call(name, normalize_args(input));
                part.thought_signature = signature;
                parts.push(part);
            }
            // Thinking stays on our side of the wire.
            ContentBlock::Thinking { .. } => {}
            _ => log::warn!("Ignoring user-only block in assistant turn"),
        }
    }

    parts
}

fn normalize_args(input: &Value) -> Value {
    if input.is_object() { input.clone() } else { json!({}) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(messages: serde_json::Value) -> MessagesRequest {
        serde_json::from_value(json!({
            "model": "g/gemini-2.5-pro",
            "max_tokens": 2048,
            "system": "Be useful.",
            "messages": messages,
            "tools": [{
                "name": "Read",
                "description": "Reads a file",
                "input_schema": {"type": "object", "properties": {"file_path": {"type": "string"}}, "required": ["file_path"]}
            }]
        }))
        .unwrap()
    }

    #[test]
    fn roles_are_user_and_model() {
        let request = request(json!([
            {"role": "user", "content": "hello"},
            {"role": "assistant", "content": "hi there"}
        ]));

        let mut map = ToolNameMap::default();
        let generate = to_generate_request(&request, "gemini-2.5-pro", &mut map, ToolSummarization::Off);

        assert_eq!(generate.contents[0].role.as_deref(), Some("user"));
        assert_eq!(generate.contents[1].role.as_deref(), Some("model"));
    }

    #[test]
    fn tool_round_trip_restores_function_name() {
        let request = request(json!([
            {"role": "assistant", "content": [
                {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {"file_path": "/tmp/a"}}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": "file data"}
            ]}
        ]));

        let mut map = ToolNameMap::default();
        let generate = to_generate_request(&request, "gemini-2.5-pro", &mut map, ToolSummarization::Off);

        let call = generate.contents[0].parts[0].function_call.as_ref().unwrap();
        assert_eq!(call.name, "Read");

        let response = generate.contents[1].parts[0].function_response.as_ref().unwrap();
        assert_eq!(response.name, "Read");
        assert_eq!(response.response["content"], "file data");
    }

    #[test]
    fn unknown_tool_result_is_dropped_not_fatal() {
        let request = request(json!([
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_ghost", "content": "orphaned"}
            ]}
        ]));

        let mut map = ToolNameMap::default();
        let generate = to_generate_request(&request, "gemini-2.5-pro", &mut map, ToolSummarization::Off);

        // The whole turn vanished because its only block was undeliverable.
        assert!(generate.contents.is_empty());
    }

    #[test]
    fn recorded_signature_is_replayed_on_the_call_part() {
        let mut map = ToolNameMap::default();
        map.record("toolu_1", "Read", Some("sig==".to_string()));

        let request = request(json!([
            {"role": "assistant", "content": [
                {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {"file_path": "/tmp/a"}}
            ]}
        ]));

        let generate = to_generate_request(&request, "gemini-2.5-pro", &mut map, ToolSummarization::Off);
        assert_eq!(generate.contents[0].parts[0].thought_signature.as_deref(), Some("sig=="));
    }

    #[test]
    fn system_instruction_is_decorated() {
        let request = request(json!([{"role": "user", "content": "hello"}]));
        let mut map = ToolNameMap::default();

        let generate = to_generate_request(&request, "gemini-2.5-pro", &mut map, ToolSummarization::Off);
        let system = generate.system_instruction.unwrap();
        let text = system.parts[0].text.as_deref().unwrap();

        assert!(text.contains("NOT Gemini"));
        assert!(text.contains("Be useful."));
    }

    #[test]
    fn tools_become_function_declarations() {
        let request = request(json!([{"role": "user", "content": "hello"}]));
        let mut map = ToolNameMap::default();

        let generate = to_generate_request(&request, "gemini-2.5-pro", &mut map, ToolSummarization::Off);
        let declarations = &generate.tools.unwrap()[0].function_declarations;

        assert_eq!(declarations[0].name, "Read");
    }
}
