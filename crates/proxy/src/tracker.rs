//! Per-session token and cost accounting.
//!
//! Local backends report `input_tokens` as the *full* conversation context
//! on every request, so the running input is replaced rather than summed;
//! cloud backends bill per request, so both counters accumulate. After every
//! update a small JSON status file is rewritten for the external status-line
//! renderer to poll.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    },
};

use serde::Serialize;

use crate::stream::StreamUsage;

/// USD per million tokens, input and output.
#[derive(Debug, Clone, Copy)]
struct Price {
    input: f64,
    output: f64,
}

const FREE: Price = Price { input: 0.0, output: 0.0 };

/// Model-specific prices. Consulted before the per-provider defaults;
/// matching is by substring of the model name.
static MODEL_PRICES: &[(&str, &str, Price)] = &[
    ("anthropic", "opus", Price { input: 15.0, output: 75.0 }),
    ("anthropic", "sonnet", Price { input: 3.0, output: 15.0 }),
    ("anthropic", "haiku", Price { input: 0.8, output: 4.0 }),
    ("openai", "gpt-5", Price { input: 1.25, output: 10.0 }),
    ("openai", "o3", Price { input: 2.0, output: 8.0 }),
    ("openai", "o4-mini", Price { input: 1.1, output: 4.4 }),
    ("google", "gemini-2.5-pro", Price { input: 1.25, output: 10.0 }),
    ("google", "gemini-2.5-flash", Price { input: 0.3, output: 2.5 }),
    ("openrouter", "deepseek", Price { input: 0.27, output: 1.1 }),
    ("moonshot", "kimi-k2", Price { input: 0.6, output: 2.5 }),
    ("minimax", "minimax-m2", Price { input: 0.3, output: 1.2 }),
];

/// Per-provider fallback for models missing from the table.
static PROVIDER_DEFAULTS: &[(&str, Price)] = &[
    ("anthropic", Price { input: 3.0, output: 15.0 }),
    ("openai", Price { input: 1.25, output: 10.0 }),
    ("google", Price { input: 0.35, output: 1.05 }),
    ("openrouter", Price { input: 0.5, output: 1.5 }),
    ("minimax", Price { input: 0.3, output: 1.2 }),
    ("moonshot", Price { input: 0.6, output: 2.5 }),
    ("zhipu", Price { input: 0.6, output: 2.2 }),
];

fn price_for(provider: &str, model: &str) -> Price {
    let model_lower = model.to_ascii_lowercase();

    for (family, pattern, price) in MODEL_PRICES {
        if *family == provider && model_lower.contains(pattern) {
            return *price;
        }
    }

    PROVIDER_DEFAULTS
        .iter()
        .find(|(family, _)| *family == provider)
        .map(|(_, price)| *price)
        .unwrap_or(FREE)
}

/// Snapshot written to the status file.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SessionSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub context_window: u32,
    pub context_left_percent: f64,
    pub updated_at: i64,
}

#[derive(Debug, Default)]
struct Counters {
    input_tokens: u64,
    output_tokens: u64,
    total_cost: f64,
}

/// One tracker per handler, covering that handler's session.
#[derive(Debug)]
pub struct SessionTracker {
    provider: String,
    model: String,
    local: bool,
    /// Settable after construction: detection is async and happens on the
    /// first request, while the tracker exists for the handler's lifetime.
    context_window: AtomicU32,
    status_path: PathBuf,
    counters: Mutex<Counters>,
}

impl SessionTracker {
    pub fn new(provider: &str, model: &str, local: bool, context_window: u32, status_dir: &Path, port: u16) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            local,
            context_window: AtomicU32::new(context_window),
            status_path: status_dir.join(format!("tokens-{port}.json")),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Conventional status directory: `${HOME}/.claudish`.
    pub fn default_status_dir() -> PathBuf {
        std::env::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".claudish")
    }

    /// Folds one stream's usage into the session counters and rewrites the
    /// status file.
    pub fn record(&self, usage: StreamUsage) -> SessionSnapshot {
        let price = price_for(&self.provider, &self.model);
        let input = u64::from(usage.usage.input_tokens);
        let output = u64::from(usage.usage.output_tokens);

        let snapshot = {
            let mut counters = self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

            if self.local {
                // Already the whole context, not an increment.
                counters.input_tokens = input;
            } else {
                counters.input_tokens += input;
            }
            counters.output_tokens += output;

            counters.total_cost +=
                (input as f64 / 1_000_000.0) * price.input + (output as f64 / 1_000_000.0) * price.output;

            self.snapshot(&counters)
        };

        if let Err(e) = self.write_status(&snapshot) {
            log::warn!("Failed to write status file {}: {e}", self.status_path.display());
        }

        snapshot
    }

    /// Current counters without recording anything.
    pub fn current(&self) -> SessionSnapshot {
        let counters = self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.snapshot(&counters)
    }

    /// Estimated tokens already used against the context window.
    pub fn context_used(&self) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        counters.input_tokens + counters.output_tokens
    }

    pub fn context_window(&self) -> u32 {
        self.context_window.load(Ordering::Relaxed)
    }

    pub fn set_context_window(&self, window: u32) {
        self.context_window.store(window, Ordering::Relaxed);
    }

    fn snapshot(&self, counters: &Counters) -> SessionSnapshot {
        let window = self.context_window();
        let total = counters.input_tokens + counters.output_tokens;
        let left = if window == 0 {
            100.0
        } else {
            let used = (total as f64 / f64::from(window)) * 100.0;
            (100.0 - used).max(0.0)
        };

        SessionSnapshot {
            input_tokens: counters.input_tokens,
            output_tokens: counters.output_tokens,
            total_tokens: total,
            total_cost: counters.total_cost,
            context_window: window,
            context_left_percent: left,
            updated_at: jiff::Timestamp::now().as_second(),
        }
    }

    /// Whole-file write followed by rename so pollers never see a torn file.
    fn write_status(&self, snapshot: &SessionSnapshot) -> std::io::Result<()> {
        if let Some(parent) = self.status_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let body = serde_json::to_vec_pretty(snapshot).map_err(std::io::Error::other)?;
        let tmp_path = self.status_path.with_extension("json.tmp");

        fs::write(&tmp_path, body)?;
        fs::rename(&tmp_path, &self.status_path)
    }
}
