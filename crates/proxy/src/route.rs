//! Per-request model routing.
//!
//! Chooses the target model (observer mode, explicit override, profile
//! keyword mapping, or the request verbatim), resolves it through the
//! registry, and memoises one handler per target so session state survives
//! across turns.

use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    handler::{self, Handler, HandlerContext},
    registry::Registry,
};

/// Keyword → model substitutions from the active profile.
///
/// Matching is a case-insensitive substring test of the requested model
/// against the Claude tier names, in opus → sonnet → haiku order.
#[derive(Debug, Clone, Default)]
pub struct ProfileMap {
    pub opus: Option<String>,
    pub sonnet: Option<String>,
    pub haiku: Option<String>,
}

impl ProfileMap {
    fn substitute(&self, requested: &str) -> Option<&str> {
        let lowered = requested.to_ascii_lowercase();

        let mapped = [
            ("opus", &self.opus),
            ("sonnet", &self.sonnet),
            ("haiku", &self.haiku),
        ]
        .into_iter()
        .find(|(keyword, target)| lowered.contains(keyword) && target.is_some())
        .and_then(|(_, target)| target.as_deref());

        mapped
    }

    pub fn is_empty(&self) -> bool {
        self.opus.is_none() && self.sonnet.is_none() && self.haiku.is_none()
    }
}

/// Startup routing options.
#[derive(Debug, Clone, Default)]
pub struct RouterOptions {
    /// Pass everything to the Anthropic-native handler for observation.
    pub observer: bool,
    /// Use this model regardless of what the client asked for.
    pub override_model: Option<String>,
    pub profile: ProfileMap,
}

/// One live handler's status, as reported on `GET /`.
#[derive(Debug, serde::Serialize)]
pub struct SessionInfo {
    pub model: String,
    pub provider: String,
    pub session: crate::tracker::SessionSnapshot,
}

/// Selects and caches a handler per request.
pub struct ModelRouter {
    registry: Registry,
    options: RouterOptions,
    ctx: Arc<HandlerContext>,
    handlers: DashMap<String, Arc<dyn Handler>>,
}

impl ModelRouter {
    pub fn new(registry: Registry, options: RouterOptions, ctx: Arc<HandlerContext>) -> Self {
        Self {
            registry,
            options,
            ctx,
            handlers: DashMap::new(),
        }
    }

    /// Returns the handler serving this request, creating it on first use.
    pub fn route(&self, requested: &str) -> Arc<dyn Handler> {
        if self.options.observer {
            return self
                .handlers
                .entry(format!("observer:{requested}"))
                .or_insert_with(|| handler::build(self.registry.anthropic_route(requested), &self.ctx))
                .value()
                .clone();
        }

        let target = self.choose_target(requested);

        self.handlers
            .entry(target.clone())
            .or_insert_with(|| {
                let route = self.registry.resolve(&target);
                log::info!(
                    "Routing '{requested}' → {} on {}",
                    route.model_name,
                    route.provider.name
                );
                handler::build(route, &self.ctx)
            })
            .value()
            .clone()
    }

    /// Session snapshots of every live handler, for the status endpoint.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.handlers
            .iter()
            .map(|entry| {
                let handler = entry.value();
                SessionInfo {
                    model: entry.key().clone(),
                    provider: handler.descriptor().name.to_string(),
                    session: handler.tracker().current(),
                }
            })
            .collect()
    }

    fn choose_target(&self, requested: &str) -> String {
        if let Some(override_model) = &self.options.override_model {
            return override_model.clone();
        }

        if let Some(mapped) = self.options.profile.substitute(requested) {
            log::debug!("Profile mapped '{requested}' → '{mapped}'");
            return mapped.to_string();
        }

        requested.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{
        detect::{HealthCache, ModelCache},
        middleware::ReplayCache,
    };
    use config::LocalEndpoints;

    fn router(options: RouterOptions) -> ModelRouter {
        let ctx = Arc::new(HandlerContext {
            config: config::RuntimeConfig::default(),
            replay_cache: Arc::new(ReplayCache::default()),
            health_cache: Arc::new(HealthCache::default()),
            model_cache: Arc::new(ModelCache::new(PathBuf::from("/tmp/claudish-test-cache.json"))),
            status_dir: std::env::temp_dir(),
            port: 0,
        });

        ModelRouter::new(Registry::new(&LocalEndpoints::default()), options, ctx)
    }

    #[test]
    fn handlers_are_memoised_per_target() {
        let router = router(RouterOptions::default());

        let first = router.route("ollama/qwen3:8b");
        let second = router.route("ollama/qwen3:8b");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(router.sessions().len(), 1);
    }

    #[test]
    fn override_model_wins_over_the_request() {
        let router = router(RouterOptions {
            override_model: Some("ollama/qwen3:8b".to_string()),
            ..Default::default()
        });

        let handler = router.route("claude-sonnet-4");
        assert_eq!(handler.descriptor().name, "ollama");
    }

    #[test]
    fn profile_keywords_substitute_by_tier() {
        let router = router(RouterOptions {
            profile: ProfileMap {
                opus: Some("or/deepseek/deepseek-r1".to_string()),
                sonnet: Some("ollama/qwen3:8b".to_string()),
                haiku: None,
            },
            ..Default::default()
        });

        assert_eq!(router.route("claude-opus-4-1").descriptor().name, "openrouter");
        assert_eq!(router.route("claude-sonnet-4").descriptor().name, "ollama");
        // No haiku mapping: the request goes through verbatim.
        assert_eq!(router.route("claude-haiku-3-5").descriptor().name, "anthropic");
    }

    #[test]
    fn observer_mode_pins_everything_to_anthropic() {
        let router = router(RouterOptions {
            observer: true,
            override_model: Some("ollama/qwen3:8b".to_string()),
            ..Default::default()
        });

        let handler = router.route("ollama/qwen3:8b");
        assert_eq!(handler.descriptor().name, "anthropic");
    }
}
