//! Claudish runtime configuration.
//!
//! Everything here is sourced from environment variables once at startup and
//! passed down explicitly. Nothing in the proxy re-reads the environment
//! after [`RuntimeConfig::from_env`] returns.

#![deny(missing_docs)]

mod endpoints;
mod sampling;

pub use endpoints::LocalEndpoints;
pub use sampling::SamplingOverrides;

use std::env;

/// Snapshot of all environment-variable knobs the proxy honours.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Base URLs for local OpenAI-compatible servers.
    pub endpoints: LocalEndpoints,
    /// Sampling parameter overrides applied to OpenAI-style requests.
    pub sampling: SamplingOverrides,
    /// Forced context window size, bypassing detection.
    pub context_window_override: Option<u32>,
    /// How long Ollama keeps the model loaded after the last request.
    pub ollama_keep_alive: Option<String>,
    /// Prepend `/no_think` to system prompts sent to Qwen models.
    pub qwen_no_think: bool,
}

impl RuntimeConfig {
    /// Reads every knob from the process environment.
    pub fn from_env() -> Self {
        let context_window_override = read_parsed("CLAUDISH_CONTEXT_WINDOW");

        if let Some(window) = context_window_override {
            log::debug!("Context window forced to {window} via CLAUDISH_CONTEXT_WINDOW");
        }

        Self {
            endpoints: LocalEndpoints::from_env(),
            sampling: SamplingOverrides::from_env(),
            context_window_override,
            ollama_keep_alive: read_string("CLAUDISH_OLLAMA_KEEP_ALIVE"),
            qwen_no_think: read_flag("CLAUDISH_QWEN_NO_THINK"),
        }
    }
}

fn read_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn read_flag(name: &str) -> bool {
    matches!(
        env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes")
    )
}

fn read_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = read_string(name)?;

    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring unparsable value for {name}: {raw}");
            None
        }
    }
}
