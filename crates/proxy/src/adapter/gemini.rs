//! Gemini family adapter.
//!
//! Some Gemini checkpoints leak chain-of-thought into the answer channel as
//! short planning lines ("Wait, I'm checking…", "Let me think…"). The
//! adapter filters those lines while a reasoning block is active; the block
//! ends at the first substantive line. Request prep maps the thinking budget
//! onto whichever dial the model generation takes.

use std::sync::LazyLock;

use regex::Regex;

use super::{Adapter, ProcessedText};
use crate::protocol::{anthropic::MessagesRequest, google};

/// Budget at or above which next-gen models get `thinkingLevel: high`.
const LEVEL_THRESHOLD: u32 = 16_000;

/// Older models take a raw token budget, capped by the API.
const BUDGET_CAP: u32 = 24_576;

/// Lines that open a leaked reasoning block.
static OPENERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^wait,?\s+i'?m\s+\w+ing\b",
        r"(?i)^let me (?:think|check|see|look|verify|figure|trace)\b",
        r"(?i)^i'?ll\s+\w+",
        r"(?i)^i need to\b",
        r"(?i)^i should\b",
        r"(?i)^okay,?\s+so\b",
        r"(?i)^ok,?\s+so\b",
        r"(?i)^hmm\b",
        r"(?i)^the goal is\b",
        r"^\d+[.)]\s",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid regex"))
    .collect()
});

/// Lines that continue an already-open reasoning block.
static CONTINUATIONS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^and then\b",
        r"(?i)^actually\b",
        r"(?i)^since\b",
        r"(?i)^because\b",
        r"(?i)^if\b",
        r"(?i)^then\b",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid regex"))
    .collect()
});

#[derive(Debug, Default)]
pub struct GeminiAdapter {
    reasoning_active: bool,
    line_buffer: String,
}

impl Adapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn should_handle(&self, model_id: &str) -> bool {
        model_id.contains("gemini") || model_id.contains("gemma")
    }

    fn reset(&mut self) {
        self.reasoning_active = false;
        self.line_buffer.clear();
    }

    fn prepare_google(&self, config: &mut google::GenerationConfig, original: &MessagesRequest, model_id: &str) {
        let Some(budget) = original.thinking_budget() else {
            return;
        };

        let thinking = if is_next_gen(model_id) {
            google::ThinkingConfig {
                thinking_level: Some(if budget >= LEVEL_THRESHOLD { "high" } else { "low" }.to_string()),
                ..Default::default()
            }
        } else {
            google::ThinkingConfig {
                thinking_budget: Some(budget.min(BUDGET_CAP)),
                ..Default::default()
            }
        };

        config.thinking_config = Some(thinking);
    }

    fn process_text(&mut self, chunk: &str, _accumulated: &str) -> ProcessedText {
        self.line_buffer.push_str(chunk);

        let mut kept = String::new();
        let mut dropped_any = false;

        // Only complete lines can be judged; the trailing partial waits for
        // its newline (or the flush at stream end).
        while let Some(newline) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=newline).collect();

            match self.judge(line.trim_end_matches('\n')) {
                LineVerdict::Keep => kept.push_str(&line),
                LineVerdict::Drop => dropped_any = true,
            }
        }

        ProcessedText {
            cleaned: kept,
            extracted_tool_calls: Vec::new(),
            was_transformed: dropped_any || !self.line_buffer.is_empty(),
        }
    }

    fn flush(&mut self) -> Option<String> {
        let last = std::mem::take(&mut self.line_buffer);
        if last.is_empty() {
            return None;
        }

        // The final line of a stream is the answer unless it is itself a
        // reasoning opener or continuation; the length heuristic only
        // applies mid-stream.
        let trimmed = last.trim();
        let still_reasoning = OPENERS.iter().any(|re| re.is_match(trimmed))
            || (self.reasoning_active && CONTINUATIONS.iter().any(|re| re.is_match(trimmed)));

        (!still_reasoning).then_some(last)
    }
}

enum LineVerdict {
    Keep,
    Drop,
}

impl GeminiAdapter {
    fn judge(&mut self, line: &str) -> LineVerdict {
        let trimmed = line.trim();

        if trimmed.is_empty() {
            // Blank lines pass through without touching the flag.
            return LineVerdict::Keep;
        }

        if OPENERS.iter().any(|re| re.is_match(trimmed)) {
            self.reasoning_active = true;
            return LineVerdict::Drop;
        }

        if self.reasoning_active {
            if CONTINUATIONS.iter().any(|re| re.is_match(trimmed)) {
                return LineVerdict::Drop;
            }

            if trimmed.len() > 20 {
                self.reasoning_active = false;
                return LineVerdict::Keep;
            }

            return LineVerdict::Drop;
        }

        LineVerdict::Keep
    }
}

fn is_next_gen(model_id: &str) -> bool {
    model_id.contains("gemini-3")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(adapter: &mut GeminiAdapter, chunks: &[&str]) -> (String, bool) {
        let mut text = String::new();
        let mut transformed = false;

        for chunk in chunks {
            let result = adapter.process_text(chunk, &text);
            text.push_str(&result.cleaned);
            transformed |= result.was_transformed;
        }

        if let Some(tail) = adapter.flush() {
            text.push_str(&tail);
        }

        (text, transformed)
    }

    #[test]
    fn leading_reasoning_line_is_suppressed() {
        let mut adapter = GeminiAdapter::default();

        let (text, transformed) = collect(
            &mut adapter,
            &["Wait, I'm checking the file first.\n", "Here is the result."],
        );

        assert_eq!(text, "Here is the result.");
        assert!(transformed);
    }

    #[test]
    fn continuations_stay_suppressed_until_substantive_line() {
        let mut adapter = GeminiAdapter::default();

        let (text, _) = collect(
            &mut adapter,
            &[
                "Let me think about the layout.\n",
                "And then the second step.\n",
                "ok\n",
                "The function returns the parsed configuration value.\n",
            ],
        );

        assert_eq!(text, "The function returns the parsed configuration value.\n");
    }

    #[test]
    fn numbered_planning_steps_are_filtered() {
        let mut adapter = GeminiAdapter::default();

        let (text, _) = collect(
            &mut adapter,
            &["1. Read the config\n2. Apply the patch\nThe patch is applied and tests pass.\n"],
        );

        assert_eq!(text, "The patch is applied and tests pass.\n");
    }

    #[test]
    fn ordinary_text_is_untouched() {
        let mut adapter = GeminiAdapter::default();

        let (text, transformed) = collect(&mut adapter, &["The capital of France is Paris.\n"]);

        assert_eq!(text, "The capital of France is Paris.\n");
        assert!(!transformed);
    }

    #[test]
    fn line_split_across_chunks_is_judged_once_complete() {
        let mut adapter = GeminiAdapter::default();

        let (text, _) = collect(&mut adapter, &["Wait, I'm look", "ing at it.\n", "Done: two files changed.\n"]);

        assert_eq!(text, "Done: two files changed.\n");
    }

    #[test]
    fn budget_maps_to_level_on_next_gen() {
        let adapter = GeminiAdapter::default();
        let request: MessagesRequest = serde_json::from_value(serde_json::json!({
            "model": "g/gemini-3-pro",
            "max_tokens": 512,
            "messages": [{"role": "user", "content": "hi"}],
            "thinking": {"type": "enabled", "budget_tokens": 16000}
        }))
        .unwrap();

        let mut config = google::GenerationConfig::default();
        adapter.prepare_google(&mut config, &request, "gemini-3-pro");
        assert_eq!(
            config.thinking_config.as_ref().unwrap().thinking_level.as_deref(),
            Some("high")
        );

        let mut config = google::GenerationConfig::default();
        adapter.prepare_google(&mut config, &request, "gemini-2.5-flash");
        assert_eq!(config.thinking_config.as_ref().unwrap().thinking_budget, Some(16_000));
    }

    #[test]
    fn budget_is_capped_for_older_models() {
        let adapter = GeminiAdapter::default();
        let request: MessagesRequest = serde_json::from_value(serde_json::json!({
            "model": "g/gemini-2.5-pro",
            "max_tokens": 512,
            "messages": [{"role": "user", "content": "hi"}],
            "thinking": {"type": "enabled", "budget_tokens": 60000}
        }))
        .unwrap();

        let mut config = google::GenerationConfig::default();
        adapter.prepare_google(&mut config, &request, "gemini-2.5-pro");
        assert_eq!(config.thinking_config.as_ref().unwrap().thinking_budget, Some(BUDGET_CAP));
    }
}
