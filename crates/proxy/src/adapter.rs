//! Model-family adapters.
//!
//! Each adapter resolves the quirks of one model family: reasoning-parameter
//! dialects on the way out, text cleanup and embedded tool-call extraction on
//! the way back. Selection is first-match over an ordered list; Grok and
//! Gemini must be tested before OpenAI, whose pattern also matches `o1`/`o3`.

mod deepseek;
mod gemini;
mod grok;
mod minimax;
mod openai;
mod qwen;

pub use gemini::GeminiAdapter;
pub use grok::GrokAdapter;
pub use openai::OpenAiAdapter;
pub use qwen::QwenAdapter;

use crate::{
    protocol::{anthropic::MessagesRequest, google, openai::ChatRequest},
    recovery::ExtractedToolCall,
};

/// Result of feeding one upstream text chunk through an adapter.
#[derive(Debug, Default, PartialEq)]
pub struct ProcessedText {
    /// Text safe to forward to the client. May be empty.
    pub cleaned: String,
    /// Tool calls the adapter recovered from the raw text.
    pub extracted_tool_calls: Vec<ExtractedToolCall>,
    /// True when the adapter removed or withheld anything.
    pub was_transformed: bool,
}

impl ProcessedText {
    fn passthrough(chunk: &str) -> Self {
        Self {
            cleaned: chunk.to_string(),
            extracted_tool_calls: Vec::new(),
            was_transformed: false,
        }
    }
}

/// Per-family request and stream rewriting.
///
/// Adapters hold per-request state (XML buffers, reasoning flags) and are
/// reset at the start of every request.
pub trait Adapter: Send {
    fn name(&self) -> &'static str;

    /// Whether this adapter claims the given upstream model id.
    fn should_handle(&self, model_id: &str) -> bool;

    /// Clears per-request state.
    fn reset(&mut self);

    /// Rewrites an outbound OpenAI-style request.
    fn prepare_openai(&self, _outbound: &mut ChatRequest, _original: &MessagesRequest) {}

    /// Rewrites an outbound Gemini generation config.
    fn prepare_google(&self, _config: &mut google::GenerationConfig, _original: &MessagesRequest, _model_id: &str) {}

    /// Rewrites an outbound Anthropic-dialect body (MiniMax, Kimi).
    ///
    /// Returning `None` keeps the raw body byte-exact; families that need
    /// extra parameters parse, amend and re-serialize it.
    fn prepare_anthropic(&self, _raw_body: &[u8]) -> Option<Vec<u8>> {
        None
    }

    /// Cleans one streamed text chunk. `accumulated` is the text already
    /// forwarded for this stream.
    fn process_text(&mut self, chunk: &str, _accumulated: &str) -> ProcessedText {
        ProcessedText::passthrough(chunk)
    }

    /// Drains any text the adapter was still holding when the stream ended.
    fn flush(&mut self) -> Option<String> {
        None
    }
}

/// Identity adapter for families without quirks.
#[derive(Debug, Default)]
pub struct DefaultAdapter;

impl Adapter for DefaultAdapter {
    fn name(&self) -> &'static str {
        "default"
    }

    fn should_handle(&self, _model_id: &str) -> bool {
        true
    }

    fn reset(&mut self) {}
}

/// Picks the adapter for an upstream model id. Ordering matters.
pub fn select(model_id: &str) -> Box<dyn Adapter> {
    let lowered = model_id.to_ascii_lowercase();

    let candidates: [Box<dyn Adapter>; 6] = [
        Box::new(GrokAdapter::default()),
        Box::new(GeminiAdapter::default()),
        Box::new(QwenAdapter::default()),
        Box::new(minimax::MiniMaxAdapter),
        Box::new(deepseek::DeepSeekAdapter),
        Box::new(OpenAiAdapter),
    ];

    for candidate in candidates {
        if candidate.should_handle(&lowered) {
            log::debug!("Selected {} adapter for model {model_id}", candidate.name());
            return candidate;
        }
    }

    Box::new(DefaultAdapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_order_keeps_openai_from_stealing_grok_and_gemini() {
        assert_eq!(select("grok-4-mini").name(), "grok");
        assert_eq!(select("gemini-2.5-pro").name(), "gemini");
        assert_eq!(select("o3-mini").name(), "openai");
        assert_eq!(select("gpt-5").name(), "openai");
        assert_eq!(select("qwen3-coder:30b").name(), "qwen");
        assert_eq!(select("deepseek-v3").name(), "deepseek");
        assert_eq!(select("minimax-m2").name(), "minimax");
        assert_eq!(select("llama-4-maverick").name(), "default");
    }
}
