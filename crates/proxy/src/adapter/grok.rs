//! Grok family adapter.
//!
//! Grok models emit tool calls as inline XML (`<xai:function_call …>`)
//! instead of the structured channel. The adapter buffers streamed text,
//! lifts complete elements into tool calls, and keeps partial opening tags
//! out of the client-visible stream until they either complete or prove to
//! be plain text.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};

use super::{Adapter, ProcessedText};
use crate::{
    protocol::{anthropic::MessagesRequest, openai::ChatRequest},
    recovery::ExtractedToolCall,
};

static FUNCTION_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<xai:function_call\s+name="([^"]+)"\s*>(.*?)</xai:function_call>"#).expect("valid regex")
});
static PARAMETER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<xai:parameter\s+name="([^"]+)"\s*>(.*?)</xai:parameter>"#).expect("valid regex")
});

/// Reasoning-effort threshold: at or above this budget Grok minis get `high`.
const EFFORT_THRESHOLD: u32 = 20_000;

#[derive(Debug, Default)]
pub struct GrokAdapter {
    xml_buffer: String,
}

impl Adapter for GrokAdapter {
    fn name(&self) -> &'static str {
        "grok"
    }

    fn should_handle(&self, model_id: &str) -> bool {
        model_id.contains("grok")
    }

    fn reset(&mut self) {
        self.xml_buffer.clear();
    }

    fn prepare_openai(&self, outbound: &mut ChatRequest, original: &MessagesRequest) {
        // Only the minis take a reasoning dial; everyone else just drops the
        // thinking request on the floor.
        if !outbound.model.contains("mini") {
            return;
        }

        if let Some(budget) = original.thinking_budget() {
            let effort = if budget >= EFFORT_THRESHOLD { "high" } else { "low" };
            outbound
                .extra
                .insert("reasoning_effort".to_string(), json!(effort));
        }
    }

    fn process_text(&mut self, chunk: &str, _accumulated: &str) -> ProcessedText {
        self.xml_buffer.push_str(chunk);

        let mut extracted = Vec::new();
        let mut remaining = std::mem::take(&mut self.xml_buffer);

        // Lift every complete element out of the buffer.
        while let Some(caps) = FUNCTION_CALL.captures(&remaining) {
            let whole = caps.get(0).expect("capture 0 always present");
            let name = caps[1].to_string();
            extracted.push(ExtractedToolCall::new(name, parse_parameters(&caps[2])));

            let mut next = String::with_capacity(remaining.len() - whole.len());
            next.push_str(&remaining[..whole.start()]);
            next.push_str(&remaining[whole.end()..]);
            remaining = next;
        }

        // A partial opening tag stays buffered; text before it flows through.
        let cleaned = match remaining.find("<xai:") {
            Some(pos) => {
                let cleaned = remaining[..pos].to_string();
                self.xml_buffer = remaining[pos..].to_string();
                cleaned
            }
            None => remaining,
        };

        let was_transformed = !extracted.is_empty() || !self.xml_buffer.is_empty() || cleaned != chunk;

        ProcessedText {
            cleaned,
            extracted_tool_calls: extracted,
            was_transformed,
        }
    }

    fn flush(&mut self) -> Option<String> {
        // Whatever is still buffered never completed as XML; surface it as
        // plain text rather than dropping model output.
        let leftover = std::mem::take(&mut self.xml_buffer);
        (!leftover.is_empty()).then_some(leftover)
    }
}

/// Decodes `<xai:parameter>` values: JSON where it parses, string otherwise.
fn parse_parameters(body: &str) -> Value {
    let mut input = serde_json::Map::new();

    for caps in PARAMETER.captures_iter(body) {
        let key = caps[1].to_string();
        let raw = caps[2].trim();

        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        input.insert(key, value);
    }

    Value::Object(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> MessagesRequest {
        serde_json::from_value(serde_json::json!({
            "model": "grok-4-mini",
            "max_tokens": 1024,
            "messages": [{"role": "user", "content": "hi"}],
            "thinking": {"type": "enabled", "budget_tokens": 20000}
        }))
        .unwrap()
    }

    #[test]
    fn complete_element_becomes_a_tool_call() {
        let mut adapter = GrokAdapter::default();

        let result = adapter.process_text(
            r#"<xai:function_call name="Read"><xai:parameter name="file_path">/tmp/a</xai:parameter></xai:function_call>"#,
            "",
        );

        assert!(result.was_transformed);
        assert!(result.cleaned.is_empty());
        assert_eq!(result.extracted_tool_calls.len(), 1);
        assert_eq!(result.extracted_tool_calls[0].name, "Read");
        assert_eq!(result.extracted_tool_calls[0].input["file_path"], "/tmp/a");
    }

    #[test]
    fn element_split_across_chunks_is_reassembled() {
        let mut adapter = GrokAdapter::default();

        let first = adapter.process_text(r#"before <xai:function_call name="Bash"><xai:parameter name="command">l"#, "");
        assert_eq!(first.cleaned, "before ");
        assert!(first.extracted_tool_calls.is_empty());
        assert!(first.was_transformed);

        let second = adapter.process_text("s</xai:parameter></xai:function_call> after", "");
        assert_eq!(second.extracted_tool_calls.len(), 1);
        assert_eq!(second.extracted_tool_calls[0].input["command"], "ls");
        assert_eq!(second.cleaned, " after");
    }

    #[test]
    fn parameter_values_json_decode_when_possible() {
        let input = parse_parameters(
            r#"<xai:parameter name="count">3</xai:parameter><xai:parameter name="path">/tmp/a</xai:parameter>"#,
        );

        assert_eq!(input["count"], 3);
        assert_eq!(input["path"], "/tmp/a");
    }

    #[test]
    fn plain_text_passes_through_untouched() {
        let mut adapter = GrokAdapter::default();
        let result = adapter.process_text("just prose", "");

        assert_eq!(result.cleaned, "just prose");
        assert!(!result.was_transformed);
    }

    #[test]
    fn flush_returns_dangling_partial_tag() {
        let mut adapter = GrokAdapter::default();
        adapter.process_text("<xai:function_call name=\"Bash\">", "");

        assert_eq!(adapter.flush().as_deref(), Some("<xai:function_call name=\"Bash\">"));
        assert_eq!(adapter.flush(), None);
    }

    #[test]
    fn mini_models_map_budget_to_effort() {
        let adapter = GrokAdapter::default();
        let mut outbound = ChatRequest {
            model: "grok-4-mini".to_string(),
            ..Default::default()
        };

        adapter.prepare_openai(&mut outbound, &request());
        assert_eq!(outbound.extra["reasoning_effort"], "high");

        let mut low = request();
        low.thinking.as_mut().unwrap().budget_tokens = Some(4_000);
        let mut outbound = ChatRequest {
            model: "grok-4-mini".to_string(),
            ..Default::default()
        };
        adapter.prepare_openai(&mut outbound, &low);
        assert_eq!(outbound.extra["reasoning_effort"], "low");
    }

    #[test]
    fn non_mini_models_get_no_effort_field() {
        let adapter = GrokAdapter::default();
        let mut outbound = ChatRequest {
            model: "grok-4".to_string(),
            ..Default::default()
        };

        adapter.prepare_openai(&mut outbound, &request());
        assert!(outbound.extra.is_empty());
    }
}
