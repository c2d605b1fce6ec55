//! DeepSeek adapter.
//!
//! DeepSeek's OpenAI-compatible surface rejects thinking parameters, so the
//! adapter only exists to make sure none are attached. Reasoning text still
//! arrives via `reasoning_content` deltas, which the streaming machine maps
//! to thinking blocks on its own.

use super::Adapter;
use crate::protocol::{anthropic::MessagesRequest, openai::ChatRequest};

#[derive(Debug)]
pub struct DeepSeekAdapter;

impl Adapter for DeepSeekAdapter {
    fn name(&self) -> &'static str {
        "deepseek"
    }

    fn should_handle(&self, model_id: &str) -> bool {
        model_id.contains("deepseek")
    }

    fn reset(&mut self) {}

    fn prepare_openai(&self, outbound: &mut ChatRequest, _original: &MessagesRequest) {
        // DeepSeek 400s on any thinking parameter.
        outbound.extra.remove("reasoning_effort");
        outbound.extra.remove("enable_thinking");
        outbound.extra.remove("thinking_budget");
    }
}
