//! Anthropic Messages → OpenAI chat/completions translation.

use itertools::Itertools;

use super::{ToolSummarization, identity, tools};
use crate::protocol::{
    anthropic::{ContentBlock, Message, MessagesRequest, Role, ToolChoice},
    openai::{
        ChatContent, ChatMessage, ChatRequest, ChatRole, ContentPart, FunctionCall, ImageUrl, StreamOptions, ToolCall,
    },
};

/// Per-backend translation switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranslationOptions {
    /// Degrade to single plain-text user messages: no image parts, no `tool`
    /// role. For minimalist local servers.
    pub simple_format: bool,
    pub summarization: ToolSummarization,
    /// Prepend `/no_think` to the system prompt (Qwen).
    pub no_think: bool,
}

/// Builds the complete outbound request body.
///
/// `stream` is left `false`; the handler flips it and attaches sampling
/// overrides before sending.
pub fn to_chat_request(request: &MessagesRequest, model_id: &str, options: &TranslationOptions) -> ChatRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    let system = request.system_text();
    let mut system_prompt = identity::decorate_system(system.as_deref(), model_id);
    if options.no_think {
        system_prompt = format!("/no_think\n{system_prompt}");
    }
    messages.push(ChatMessage::system(system_prompt));

    for message in &request.messages {
        match message.role {
            Role::User => translate_user_turn(message, options, &mut messages),
            Role::Assistant => {
                if let Some(translated) = translate_assistant_turn(message) {
                    messages.push(translated);
                }
            }
        }
    }

    ChatRequest {
        model: model_id.to_string(),
        messages,
        tools: request
            .tools
            .as_deref()
            .filter(|tools| !tools.is_empty())
            .map(|declared| tools::to_openai_tools(declared, options.summarization)),
        tool_choice: request.tool_choice.as_ref().map(tool_choice_value),
        max_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        min_p: None,
        repetition_penalty: None,
        stream: false,
        stream_options: Some(StreamOptions { include_usage: true }),
        options: None,
        extra: serde_json::Map::new(),
    }
}

/// One Anthropic user turn becomes a `user` message plus zero or more `tool`
/// messages, one per distinct tool result.
fn translate_user_turn(message: &Message, options: &TranslationOptions, out: &mut Vec<ChatMessage>) {
    if options.simple_format {
        out.push(simple_user_message(message));
        return;
    }

    let mut parts = Vec::new();
    let mut tool_messages = Vec::new();
    let mut seen_results = Vec::new();

    for block in &message.content {
        match block {
            ContentBlock::Text { text } => parts.push(ContentPart::Text { text: text.clone() }),
            ContentBlock::Image { source } => parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{};base64,{}", source.media_type, source.data),
                },
            }),
            ContentBlock::ToolResult {
                tool_use_id, content, ..
            } => {
                if seen_results.contains(tool_use_id) {
                    log::debug!("Dropping duplicate tool result for {tool_use_id}");
                    continue;
                }
                seen_results.push(tool_use_id.clone());
                tool_messages.push(ChatMessage::tool(tool_use_id.clone(), content.flatten()));
            }
            ContentBlock::ToolUse { .. } | ContentBlock::Thinking { .. } => {
                log::warn!("Ignoring assistant-only block in user turn");
            }
        }
    }

    // Tool results precede the user text: the upstream expects `tool` role
    // messages directly after the assistant turn that called them.
    out.extend(tool_messages);

    if !parts.is_empty() {
        let content = if parts.len() == 1
            && let ContentPart::Text { text } = &parts[0]
        {
            ChatContent::Text(text.clone())
        } else {
            ChatContent::Parts(parts)
        };

        out.push(ChatMessage {
            role: ChatRole::User,
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
            reasoning_details: None,
        });
    }
}

/// Degraded form: everything flattened into one text message.
fn simple_user_message(message: &Message) -> ChatMessage {
    let text = message
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.clone()),
            ContentBlock::ToolResult { content, .. } => Some(format!("[Tool Result]: {}", content.flatten())),
            ContentBlock::Image { .. } => {
                log::debug!("Dropping image for simple-format backend");
                None
            }
            _ => None,
        })
        .join("\n");

    ChatMessage::user(text)
}

/// Exactly one assistant message per turn: text joined with spaces, tool
/// calls deduplicated by id, `content: null` when only tool calls remain.
fn translate_assistant_turn(message: &Message) -> Option<ChatMessage> {
    let text = message
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .join(" ");

    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in &message.content {
        if let ContentBlock::ToolUse { id, name, input } = block {
            if tool_calls.iter().any(|call| &call.id == id) {
                continue;
            }

            tool_calls.push(ToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: name.clone(),
                    arguments: serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string()),
                },
            });
        }
    }

    if text.is_empty() && tool_calls.is_empty() {
        return None;
    }

    Some(ChatMessage {
        role: ChatRole::Assistant,
        content: (!text.is_empty()).then_some(ChatContent::Text(text)),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
        reasoning_details: None,
    })
}

fn tool_choice_value(choice: &ToolChoice) -> serde_json::Value {
    match choice {
        ToolChoice::Auto => serde_json::json!("auto"),
        ToolChoice::None => serde_json::json!("none"),
        ToolChoice::Any => serde_json::json!("required"),
        ToolChoice::Tool { name } => serde_json::json!({
            "type": "function",
            "function": {"name": name}
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(messages: serde_json::Value) -> MessagesRequest {
        serde_json::from_value(json!({
            "model": "or/meta-llama/llama-4",
            "max_tokens": 1024,
            "system": "You are Claude Code, Anthropic's official CLI for Claude.",
            "messages": messages
        }))
        .unwrap()
    }

    #[test]
    fn system_message_is_decorated_and_first() {
        let request = request(json!([{"role": "user", "content": "hi"}]));
        let chat = to_chat_request(&request, "llama-4", &TranslationOptions::default());

        assert_eq!(chat.messages[0].role, ChatRole::System);
        let ChatContent::Text(system) = chat.messages[0].content.as_ref().unwrap() else {
            unreachable!("system must be text");
        };
        assert!(system.starts_with("IMPORTANT: You are NOT"));
        assert!(!system.contains("Claude Code"));
    }

    #[test]
    fn tool_results_become_tool_messages_deduplicated() {
        let request = request(json!([
            {"role": "assistant", "content": [
                {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {"file_path": "/tmp/a"}}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": "data"},
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": "data again"},
                {"type": "text", "text": "continue"}
            ]}
        ]));

        let chat = to_chat_request(&request, "llama-4", &TranslationOptions::default());
        let roles: Vec<ChatRole> = chat.messages.iter().map(|m| m.role).collect();

        assert_eq!(
            roles,
            vec![ChatRole::System, ChatRole::Assistant, ChatRole::Tool, ChatRole::User]
        );
        assert_eq!(chat.messages[2].tool_call_id.as_deref(), Some("toolu_1"));
    }

    #[test]
    fn assistant_with_only_tool_calls_has_null_content() {
        let request = request(json!([
            {"role": "assistant", "content": [
                {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {"file_path": "/tmp/a"}},
                {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {"file_path": "/tmp/a"}}
            ]}
        ]));

        let chat = to_chat_request(&request, "llama-4", &TranslationOptions::default());
        let assistant = &chat.messages[1];

        assert!(assistant.content.is_none());
        assert_eq!(assistant.tool_calls.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn images_become_data_urls() {
        let request = request(json!([
            {"role": "user", "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "aGk="}}
            ]}
        ]));

        let chat = to_chat_request(&request, "llama-4", &TranslationOptions::default());
        let ChatContent::Parts(parts) = chat.messages[1].content.as_ref().unwrap() else {
            unreachable!("expected parts");
        };

        let ContentPart::ImageUrl { image_url } = &parts[1] else {
            unreachable!("expected image part");
        };
        assert_eq!(image_url.url, "data:image/png;base64,aGk=");
    }

    #[test]
    fn simple_format_flattens_everything() {
        let request = request(json!([
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": "ok"},
                {"type": "text", "text": "next step"},
                {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "aGk="}}
            ]}
        ]));

        let options = TranslationOptions {
            simple_format: true,
            ..Default::default()
        };
        let chat = to_chat_request(&request, "llama-4", &options);

        assert_eq!(chat.messages.len(), 2);
        let ChatContent::Text(text) = chat.messages[1].content.as_ref().unwrap() else {
            unreachable!("expected text");
        };
        assert_eq!(text, "[Tool Result]: ok\nnext step");
    }

    #[test]
    fn no_think_prefixes_the_system_prompt() {
        let request = request(json!([{"role": "user", "content": "hi"}]));
        let options = TranslationOptions {
            no_think: true,
            ..Default::default()
        };

        let chat = to_chat_request(&request, "qwen3:8b", &options);
        let ChatContent::Text(system) = chat.messages[0].content.as_ref().unwrap() else {
            unreachable!("system must be text");
        };
        assert!(system.starts_with("/no_think\n"));
    }

    #[test]
    fn tool_choice_mapping() {
        assert_eq!(tool_choice_value(&ToolChoice::Auto), json!("auto"));
        assert_eq!(tool_choice_value(&ToolChoice::Any), json!("required"));
        assert_eq!(
            tool_choice_value(&ToolChoice::Tool {
                name: "Read".to_string()
            }),
            json!({"type": "function", "function": {"name": "Read"}})
        );
    }
}
