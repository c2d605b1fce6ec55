//! Context-window detection and local-server health probing.
//!
//! Window detection order: explicit override, disk cache, a probe of the
//! server, then a conservative default. Probed values are remembered in
//! `${HOME}/.config/claudish/model-cache.json` (owner-only permissions) so
//! later sessions skip the probe. Health results are cached per base URL for
//! a short period.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::registry::ProviderDescriptor;

/// Window used when nothing better is known.
pub const DEFAULT_CONTEXT_WINDOW: u32 = 32_768;

/// How long a cached window stays valid.
const CACHE_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// How long a health probe result stays valid.
const HEALTH_TTL: Duration = Duration::from_secs(60);

/// Where a context-window figure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSource {
    Env,
    Cache,
    Probed,
    Default,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    #[serde(rename = "contextWindow")]
    context_window: u32,
    timestamp: i64,
    ttl: i64,
}

/// Disk-backed `provider:model → context window` cache.
#[derive(Debug)]
pub struct ModelCache {
    path: PathBuf,
}

impl ModelCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Conventional location: `${HOME}/.config/claudish/model-cache.json`.
    pub fn default_path() -> PathBuf {
        std::env::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("claudish")
            .join("model-cache.json")
    }

    pub fn get(&self, provider: &str, model: &str) -> Option<u32> {
        let entries = self.load();
        let entry = entries.get(&cache_key(provider, model))?;

        let now = jiff::Timestamp::now().as_second();
        if now - entry.timestamp > entry.ttl {
            log::debug!("Cached context window for {provider}:{model} expired");
            return None;
        }

        Some(entry.context_window)
    }

    pub fn put(&self, provider: &str, model: &str, context_window: u32) {
        let mut entries = self.load();
        entries.insert(
            cache_key(provider, model),
            CacheEntry {
                context_window,
                timestamp: jiff::Timestamp::now().as_second(),
                ttl: CACHE_TTL_SECS,
            },
        );

        if let Err(e) = self.store(&entries) {
            log::warn!("Failed to write model cache {}: {e}", self.path.display());
        }
    }

    fn load(&self) -> HashMap<String, CacheEntry> {
        let Ok(raw) = fs::read_to_string(&self.path) else {
            return HashMap::new();
        };

        serde_json::from_str(&raw).unwrap_or_else(|e| {
            log::warn!("Model cache {} is corrupt ({e}), starting fresh", self.path.display());
            HashMap::new()
        })
    }

    fn store(&self, entries: &HashMap<String, CacheEntry>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
            restrict_permissions(parent, 0o700)?;
        }

        let body = serde_json::to_vec_pretty(entries).map_err(std::io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body)?;
        restrict_permissions(&tmp, 0o600)?;
        fs::rename(&tmp, &self.path)
    }
}

fn cache_key(provider: &str, model: &str) -> String {
    format!("{provider}:{model}")
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Detects the context window for a model on a provider.
pub async fn detect_context_window(
    client: &reqwest::Client,
    provider: &ProviderDescriptor,
    model: &str,
    override_window: Option<u32>,
    cache: &ModelCache,
) -> (u32, WindowSource) {
    if let Some(window) = override_window {
        return (window, WindowSource::Env);
    }

    if let Some(window) = cache.get(provider.name, model) {
        return (window, WindowSource::Cache);
    }

    if provider.local
        && let Some(window) = probe_context_window(client, provider, model).await
    {
        cache.put(provider.name, model, window);
        return (window, WindowSource::Probed);
    }

    (DEFAULT_CONTEXT_WINDOW, WindowSource::Default)
}

/// Asks a local server how big the model's context is.
async fn probe_context_window(client: &reqwest::Client, provider: &ProviderDescriptor, model: &str) -> Option<u32> {
    if provider.ollama_options {
        let response = client
            .post(format!("{}/api/show", provider.base_url))
            .json(&serde_json::json!({"model": model}))
            .send()
            .await
            .ok()?;

        let body: Value = response.json().await.ok()?;
        return context_length_from_show(&body);
    }

    let response = client
        .get(format!("{}/v1/models", provider.base_url))
        .send()
        .await
        .ok()?;

    let body: Value = response.json().await.ok()?;
    let entries = body.get("data")?.as_array()?;

    entries
        .iter()
        .find(|entry| entry.get("id").and_then(Value::as_str) == Some(model))
        .and_then(context_length_from_entry)
}

/// Ollama's `/api/show` nests the figure under `model_info` with an
/// architecture-specific key (`llama.context_length`, `qwen3.context_length`).
fn context_length_from_show(body: &Value) -> Option<u32> {
    let info = body.get("model_info")?.as_object()?;

    info.iter()
        .find(|(key, _)| key.ends_with(".context_length"))
        .and_then(|(_, value)| value.as_u64())
        .map(|window| window as u32)
}

fn context_length_from_entry(entry: &Value) -> Option<u32> {
    for key in ["context_length", "max_context_length", "max_model_len"] {
        if let Some(window) = entry.get(key).and_then(Value::as_u64) {
            return Some(window as u32);
        }
    }
    None
}

/// Per-base-URL health results with a short TTL.
#[derive(Debug, Default)]
pub struct HealthCache {
    entries: DashMap<String, (Instant, bool)>,
}

impl HealthCache {
    pub fn get(&self, base_url: &str) -> Option<bool> {
        let entry = self.entries.get(base_url)?;
        let (probed_at, healthy) = *entry;

        (probed_at.elapsed() < HEALTH_TTL).then_some(healthy)
    }

    pub fn put(&self, base_url: &str, healthy: bool) {
        self.entries.insert(base_url.to_string(), (Instant::now(), healthy));
    }
}

/// Probes a local server, trying the Ollama surface first, then the
/// OpenAI-compatible one. The first 2xx wins. Results are cached.
pub async fn check_health(client: &reqwest::Client, base_url: &str, cache: &HealthCache) -> bool {
    if let Some(healthy) = cache.get(base_url) {
        return healthy;
    }

    let healthy = probe_health(client, base_url).await;
    cache.put(base_url, healthy);

    if !healthy {
        log::warn!("Local server at {base_url} is not responding");
    }

    healthy
}

async fn probe_health(client: &reqwest::Client, base_url: &str) -> bool {
    for path in ["/api/tags", "/v1/models"] {
        match client.get(format!("{base_url}{path}")).send().await {
            Ok(response) if response.status().is_success() => return true,
            Ok(_) | Err(_) => continue,
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ModelCache::new(dir.path().join("model-cache.json"));

        assert_eq!(cache.get("ollama", "qwen3:8b"), None);

        cache.put("ollama", "qwen3:8b", 40_960);
        assert_eq!(cache.get("ollama", "qwen3:8b"), Some(40_960));

        // Other models are unaffected.
        assert_eq!(cache.get("ollama", "llama3"), None);
    }

    #[test]
    fn expired_entries_are_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model-cache.json");

        let stale = serde_json::json!({
            "ollama:qwen3:8b": {
                "contextWindow": 40960,
                "timestamp": jiff::Timestamp::now().as_second() - CACHE_TTL_SECS - 10,
                "ttl": CACHE_TTL_SECS
            }
        });
        fs::write(&path, stale.to_string()).expect("seed cache");

        let cache = ModelCache::new(path);
        assert_eq!(cache.get("ollama", "qwen3:8b"), None);
    }

    #[test]
    fn corrupt_cache_is_not_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model-cache.json");
        fs::write(&path, "{{{{not json").expect("seed cache");

        let cache = ModelCache::new(path);
        assert_eq!(cache.get("ollama", "qwen3:8b"), None);

        cache.put("ollama", "qwen3:8b", 8_192);
        assert_eq!(cache.get("ollama", "qwen3:8b"), Some(8_192));
    }

    #[cfg(unix)]
    #[test]
    fn cache_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("model-cache.json");
        let cache = ModelCache::new(path.clone());

        cache.put("ollama", "qwen3:8b", 8_192);

        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn ollama_show_parsing() {
        let body = serde_json::json!({
            "model_info": {
                "general.architecture": "qwen3",
                "qwen3.context_length": 40960,
                "qwen3.embedding_length": 4096
            }
        });

        assert_eq!(context_length_from_show(&body), Some(40_960));
        assert_eq!(context_length_from_show(&serde_json::json!({})), None);
    }

    #[tokio::test(start_paused = true)]
    async fn health_cache_expires() {
        let cache = HealthCache::default();
        cache.put("http://localhost:11434", true);

        assert_eq!(cache.get("http://localhost:11434"), Some(true));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("http://localhost:11434"), None);
    }
}
