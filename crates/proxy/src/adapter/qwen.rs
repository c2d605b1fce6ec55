//! Qwen family adapter.
//!
//! Qwen checkpoints served locally sometimes leak chat-template special
//! tokens (`<|im_start|>`, role tags) into the output stream. The adapter
//! strips them and holds back partial tokens at chunk boundaries. Request
//! prep turns the Anthropic thinking budget into Qwen's
//! `enable_thinking` / `thinking_budget` pair.

use serde_json::json;

use super::{Adapter, ProcessedText};
use crate::protocol::{anthropic::MessagesRequest, openai::ChatRequest};

const SPECIAL_TOKENS: &[&str] = &[
    "<|im_start|>assistant",
    "<|im_start|>user",
    "<|im_start|>system",
    "<|im_start|>",
    "<|im_end|>",
    "<|endoftext|>",
    "<|end|>",
];

#[derive(Debug, Default)]
pub struct QwenAdapter {
    /// Partial special token held back at a chunk boundary.
    pending: String,
}

impl Adapter for QwenAdapter {
    fn name(&self) -> &'static str {
        "qwen"
    }

    fn should_handle(&self, model_id: &str) -> bool {
        model_id.contains("qwen") || model_id.contains("qwq")
    }

    fn reset(&mut self) {
        self.pending.clear();
    }

    fn prepare_openai(&self, outbound: &mut ChatRequest, original: &MessagesRequest) {
        let Some(budget) = original.thinking_budget() else {
            return;
        };

        outbound.extra.insert("enable_thinking".to_string(), json!(true));
        outbound.extra.insert("thinking_budget".to_string(), json!(budget));
    }

    fn process_text(&mut self, chunk: &str, _accumulated: &str) -> ProcessedText {
        let mut text = std::mem::take(&mut self.pending);
        text.push_str(chunk);

        let mut cleaned = String::with_capacity(text.len());
        let mut transformed = false;

        for token in SPECIAL_TOKENS {
            if text.contains(token) {
                text = text.replace(token, "");
                transformed = true;
            }
        }

        // A trailing `<|…` that could still grow into a special token waits
        // for the next chunk.
        if let Some(pos) = trailing_partial_token(&text) {
            self.pending = text[pos..].to_string();
            text.truncate(pos);
            transformed = true;
        }

        cleaned.push_str(&text);

        ProcessedText {
            cleaned,
            extracted_tool_calls: Vec::new(),
            was_transformed: transformed,
        }
    }

    fn flush(&mut self) -> Option<String> {
        let leftover = std::mem::take(&mut self.pending);
        // A lone partial marker at stream end is template junk, not content.
        (!leftover.is_empty() && !leftover.starts_with("<|")).then_some(leftover)
    }
}

/// Byte offset of a trailing prefix of any special token, if one exists.
fn trailing_partial_token(text: &str) -> Option<usize> {
    // Longest candidate suffix worth checking is the longest special token.
    let max_len = SPECIAL_TOKENS.iter().map(|t| t.len()).max().unwrap_or(0);

    for start in text.char_indices().map(|(i, _)| i).rev().take(max_len) {
        let suffix = &text[start..];
        if suffix.len() >= max_len {
            break;
        }

        if SPECIAL_TOKENS.iter().any(|token| token.starts_with(suffix)) {
            return Some(start);
        }
    }

    None
}
