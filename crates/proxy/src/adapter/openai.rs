//! OpenAI reasoning-model adapter.
//!
//! Maps the Anthropic thinking budget onto `reasoning_effort`. Matched last
//! among the specific adapters because its pattern (`o1`, `o3`, `gpt-…`)
//! would otherwise shadow Grok minis and Gemini.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;

use super::Adapter;
use crate::protocol::{anthropic::MessagesRequest, openai::ChatRequest};

static MODEL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:gpt-|o[0-9](?:-|$)|chatgpt)").expect("valid regex"));

#[derive(Debug, Default)]
pub struct OpenAiAdapter;

impl Adapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn should_handle(&self, model_id: &str) -> bool {
        MODEL_PATTERN.is_match(model_id) || model_id.starts_with("openai/")
    }

    fn reset(&mut self) {}

    fn prepare_openai(&self, outbound: &mut ChatRequest, original: &MessagesRequest) {
        if original.thinking.is_none() {
            return;
        }

        let effort = match original.thinking_budget() {
            Some(budget) if budget < 4_000 => "minimal",
            Some(budget) if budget < 16_000 => "low",
            Some(budget) if budget < 32_000 => "medium",
            Some(_) => "high",
            None => "medium",
        };

        outbound
            .extra
            .insert("reasoning_effort".to_string(), json!(effort));
    }
}
