//! System-prompt decoration data.
//!
//! These strings are part of the external contract: downstream models behave
//! differently depending on them. They are kept as data so they can be
//! swapped without touching translation logic when the upstream agent's
//! prompt changes.

/// Phrase replacements applied to the client's system prompt before it is
/// sent to a non-Anthropic model.
pub const IDENTITY_REPLACEMENTS: &[(&str, &str)] = &[
    ("Claude Code, Anthropic's official CLI for Claude", "a command-line coding assistant"),
    ("Anthropic's official CLI for Claude", "a command-line coding assistant"),
    ("Claude Code", "the coding assistant"),
    ("You are Claude", "You are an AI assistant"),
    ("claude.ai", "your provider"),
];

/// Grok keeps trying to call tools through inline XML unless told otherwise.
pub const GROK_GUIDANCE: &str = "\n\nWhen calling tools, always use the structured tool_calls mechanism. Never write <xai:function_call> XML or any other tool-call markup into your text output.";

/// Gemini leaks planning text into the answer channel unless told otherwise.
pub const GEMINI_GUIDANCE: &str = "\n\nKeep all reasoning and planning internal. Your text output must contain only the final answer for the user, never step-by-step deliberation.";

/// Applies the identity replacements to a system prompt.
pub fn scrub(system: &str) -> String {
    let mut scrubbed = system.to_string();

    for (from, to) in IDENTITY_REPLACEMENTS {
        if scrubbed.contains(from) {
            scrubbed = scrubbed.replace(from, to);
        }
    }

    scrubbed
}

/// The "you are not X" preamble prepended to every translated system prompt.
pub fn disclaimer(brand: &str) -> String {
    format!(
        "IMPORTANT: You are NOT {brand} and not made by Anthropic. You are a different model serving a coding \
         assistant session. Never claim to be {brand}. Follow the instructions below as written.\n\n"
    )
}

/// Brand name the upstream model would otherwise claim.
pub fn brand_for_model(model_id: &str) -> &'static str {
    let lowered = model_id.to_ascii_lowercase();

    if lowered.contains("grok") {
        "Grok"
    } else if lowered.contains("gemini") || lowered.contains("gemma") {
        "Gemini"
    } else if lowered.contains("gpt") || lowered.starts_with('o') {
        "ChatGPT"
    } else if lowered.contains("qwen") {
        "Qwen"
    } else if lowered.contains("deepseek") {
        "DeepSeek"
    } else {
        "Claude"
    }
}

/// Family-specific guidance appended to the system prompt, when any.
pub fn family_guidance(model_id: &str) -> Option<&'static str> {
    let lowered = model_id.to_ascii_lowercase();

    if lowered.contains("grok") {
        Some(GROK_GUIDANCE)
    } else if lowered.contains("gemini") || lowered.contains("gemma") {
        Some(GEMINI_GUIDANCE)
    } else {
        None
    }
}

/// Builds the complete decorated system prompt for a non-Anthropic model.
pub fn decorate_system(system: Option<&str>, model_id: &str) -> String {
    let mut prompt = disclaimer(brand_for_model(model_id));

    if let Some(system) = system {
        prompt.push_str(&scrub(system));
    }

    if let Some(guidance) = family_guidance(model_id) {
        prompt.push_str(guidance);
    }

    prompt
}
