//! Bidirectional message and tool-schema translation.
//!
//! Outbound: Anthropic Messages → OpenAI chat/completions or Gemini
//! generateContent, including system-prompt identity scrubbing and optional
//! tool-description compression. The reverse (stream) direction lives in the
//! streaming machine; this module is purely about request bodies.

pub mod google;
pub mod identity;
pub mod openai;
pub mod tools;

/// Tool-schema compression switch.
///
/// The set of tools to *drop* at a given filtering level is decided by the
/// caller before translation; this switch only controls whether surviving
/// descriptions are compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolSummarization {
    #[default]
    Off,
    Summarize,
}
