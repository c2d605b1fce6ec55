//! Provider registry and model-name resolution.
//!
//! A static table of provider descriptors plus the resolution rules that map
//! a requested model string to exactly one provider. Resolution never
//! consults the environment; a missing credential only surfaces when the
//! selected handler actually runs.

use config::LocalEndpoints;
use url::Url;

/// Upstream wire dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `POST <base><api_path>` chat/completions.
    OpenAi,
    /// Native Gemini `streamGenerateContent`.
    Gemini,
    /// Anthropic Messages, native or aggregator-hosted.
    Anthropic,
}

/// What a provider's models can do.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub tools: bool,
    pub vision: bool,
    pub streaming: bool,
    pub json_mode: bool,
    pub reasoning: bool,
    /// Server only understands plain-string message content: no image
    /// parts, no `tool` role.
    pub simple_format: bool,
}

impl Capabilities {
    const FULL: Capabilities = Capabilities {
        tools: true,
        vision: true,
        streaming: true,
        json_mode: true,
        reasoning: true,
        simple_format: false,
    };

    const LOCAL: Capabilities = Capabilities {
        tools: true,
        vision: false,
        streaming: true,
        json_mode: false,
        reasoning: true,
        simple_format: false,
    };
}

/// A single upstream provider.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    /// Stable name, also the pricing-table family key.
    pub name: &'static str,
    pub base_url: String,
    /// Path appended to `base_url` for completions.
    pub api_path: &'static str,
    /// Model-name prefixes this provider claims. The prefix is stripped
    /// before the remainder is sent upstream.
    pub prefixes: &'static [&'static str],
    /// Environment variable holding the credential, if one is needed.
    pub cred_env: Option<&'static str>,
    /// Where to obtain a credential; shown in the missing-credential error.
    pub hint_url: &'static str,
    pub dialect: Dialect,
    pub capabilities: Capabilities,
    /// True for servers on this machine: no credential, generous timeouts.
    pub local: bool,
    /// True when the server understands Ollama's `options` extension.
    pub ollama_options: bool,
}

/// Outcome of resolving a requested model string.
#[derive(Debug, Clone)]
pub struct Route {
    pub provider: ProviderDescriptor,
    /// Model name with the provider prefix stripped.
    pub model_name: String,
}

/// The static provider table.
pub struct Registry {
    providers: Vec<ProviderDescriptor>,
    anthropic: ProviderDescriptor,
    aggregator: ProviderDescriptor,
}

impl Registry {
    pub fn new(endpoints: &LocalEndpoints) -> Self {
        let anthropic = ProviderDescriptor {
            name: "anthropic",
            base_url: "https://api.anthropic.com".to_string(),
            api_path: "/v1/messages",
            prefixes: &[],
            cred_env: Some("ANTHROPIC_API_KEY"),
            hint_url: "https://console.anthropic.com/settings/keys",
            dialect: Dialect::Anthropic,
            capabilities: Capabilities::FULL,
            local: false,
            ollama_options: false,
        };

        let aggregator = ProviderDescriptor {
            name: "openrouter",
            base_url: "https://openrouter.ai/api".to_string(),
            api_path: "/v1/chat/completions",
            prefixes: &["or/"],
            cred_env: Some("OPENROUTER_API_KEY"),
            hint_url: "https://openrouter.ai/keys",
            dialect: Dialect::OpenAi,
            capabilities: Capabilities::FULL,
            local: false,
            ollama_options: false,
        };

        let providers = vec![
            ProviderDescriptor {
                name: "ollama",
                base_url: endpoints.ollama.clone(),
                api_path: "/v1/chat/completions",
                prefixes: &["ollama/", "ollama:"],
                cred_env: None,
                hint_url: "https://ollama.com/download",
                dialect: Dialect::OpenAi,
                capabilities: Capabilities::LOCAL,
                local: true,
                ollama_options: true,
            },
            ProviderDescriptor {
                name: "lmstudio",
                base_url: endpoints.lmstudio.clone(),
                api_path: "/v1/chat/completions",
                prefixes: &["lmstudio/", "lmstudio:", "mlstudio/"],
                cred_env: None,
                hint_url: "https://lmstudio.ai",
                dialect: Dialect::OpenAi,
                capabilities: Capabilities::LOCAL,
                local: true,
                ollama_options: false,
            },
            ProviderDescriptor {
                name: "vllm",
                base_url: endpoints.vllm.clone(),
                api_path: "/v1/chat/completions",
                prefixes: &["vllm/"],
                cred_env: None,
                hint_url: "https://docs.vllm.ai",
                dialect: Dialect::OpenAi,
                capabilities: Capabilities::LOCAL,
                local: true,
                ollama_options: false,
            },
            ProviderDescriptor {
                name: "mlx",
                base_url: endpoints.mlx.clone(),
                api_path: "/v1/chat/completions",
                prefixes: &["mlx/"],
                cred_env: None,
                hint_url: "https://github.com/ml-explore/mlx-lm",
                dialect: Dialect::OpenAi,
                capabilities: Capabilities {
                    simple_format: true,
                    ..Capabilities::LOCAL
                },
                local: true,
                ollama_options: false,
            },
            ProviderDescriptor {
                name: "google",
                base_url: "https://generativelanguage.googleapis.com".to_string(),
                api_path: "/v1beta/models",
                prefixes: &["g/", "gemini/"],
                cred_env: Some("GEMINI_API_KEY"),
                hint_url: "https://aistudio.google.com/apikey",
                dialect: Dialect::Gemini,
                capabilities: Capabilities::FULL,
                local: false,
                ollama_options: false,
            },
            ProviderDescriptor {
                name: "openai",
                base_url: "https://api.openai.com".to_string(),
                api_path: "/v1/chat/completions",
                prefixes: &["oai/"],
                cred_env: Some("OPENAI_API_KEY"),
                hint_url: "https://platform.openai.com/api-keys",
                dialect: Dialect::OpenAi,
                capabilities: Capabilities::FULL,
                local: false,
                ollama_options: false,
            },
            aggregator.clone(),
            ProviderDescriptor {
                name: "minimax",
                base_url: "https://api.minimax.io".to_string(),
                api_path: "/anthropic/v1/messages",
                prefixes: &["mmax/", "mm/"],
                cred_env: Some("MINIMAX_API_KEY"),
                hint_url: "https://platform.minimax.io",
                dialect: Dialect::Anthropic,
                capabilities: Capabilities::FULL,
                local: false,
                ollama_options: false,
            },
            ProviderDescriptor {
                name: "moonshot",
                base_url: "https://api.moonshot.ai".to_string(),
                api_path: "/anthropic/v1/messages",
                prefixes: &["kimi/", "moonshot/"],
                cred_env: Some("MOONSHOT_API_KEY"),
                hint_url: "https://platform.moonshot.ai",
                dialect: Dialect::Anthropic,
                capabilities: Capabilities::FULL,
                local: false,
                ollama_options: false,
            },
            ProviderDescriptor {
                name: "zhipu",
                base_url: "https://open.bigmodel.cn/api/paas/v4".to_string(),
                api_path: "/chat/completions",
                prefixes: &["glm/", "zhipu/"],
                cred_env: Some("ZHIPU_API_KEY"),
                hint_url: "https://open.bigmodel.cn",
                dialect: Dialect::OpenAi,
                capabilities: Capabilities::FULL,
                local: false,
                ollama_options: false,
            },
        ];

        Self {
            providers,
            anthropic,
            aggregator,
        }
    }

    /// Forces the Anthropic-native route regardless of prefixes. Observer
    /// mode uses this to pass every request through untouched.
    pub fn anthropic_route(&self, model: &str) -> Route {
        Route {
            provider: self.anthropic.clone(),
            model_name: model.to_string(),
        }
    }

    /// Resolves a requested model string to exactly one provider.
    ///
    /// Order: URL-pinned local server, literal prefix match, `/`-containing
    /// names fall back to the aggregator, anything else goes to Anthropic.
    pub fn resolve(&self, model: &str) -> Route {
        if model.starts_with("http://") || model.starts_with("https://") {
            if let Some(route) = self.resolve_pinned_url(model) {
                return route;
            }
            log::warn!("Unparsable model URL '{model}', falling back to prefix resolution");
        }

        for provider in &self.providers {
            for prefix in provider.prefixes {
                if let Some(rest) = model.strip_prefix(prefix) {
                    return Route {
                        provider: provider.clone(),
                        model_name: rest.to_string(),
                    };
                }
            }
        }

        if model.contains('/') {
            return Route {
                provider: self.aggregator.clone(),
                model_name: model.to_string(),
            };
        }

        Route {
            provider: self.anthropic.clone(),
            model_name: model.to_string(),
        }
    }

    /// `http://host:port/path/model` pins an ad-hoc OpenAI-compatible server.
    fn resolve_pinned_url(&self, model: &str) -> Option<Route> {
        let url = Url::parse(model).ok()?;
        let host = url.host_str()?;

        let model_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())?
            .to_string();

        let base_url = match url.port() {
            Some(port) => format!("{}://{host}:{port}", url.scheme()),
            None => format!("{}://{host}", url.scheme()),
        };

        Some(Route {
            provider: ProviderDescriptor {
                name: "custom",
                base_url,
                api_path: "/v1/chat/completions",
                prefixes: &[],
                cred_env: None,
                hint_url: "",
                dialect: Dialect::OpenAi,
                capabilities: Capabilities::LOCAL,
                local: true,
                ollama_options: false,
            },
            model_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::new(&LocalEndpoints::default())
    }

    #[test]
    fn prefix_resolution_strips_the_prefix() {
        let route = registry().resolve("ollama/qwen3:8b");
        assert_eq!(route.provider.name, "ollama");
        assert_eq!(route.model_name, "qwen3:8b");

        let route = registry().resolve("ollama:qwen3:8b");
        assert_eq!(route.provider.name, "ollama");
        assert_eq!(route.model_name, "qwen3:8b");
    }

    #[test]
    fn oai_prefix_does_not_collide_with_aggregator_namespace() {
        let direct = registry().resolve("oai/gpt-5");
        assert_eq!(direct.provider.name, "openai");
        assert_eq!(direct.model_name, "gpt-5");

        // `openai/...` is an aggregator namespace, not the direct API.
        let aggregated = registry().resolve("openai/gpt-5");
        assert_eq!(aggregated.provider.name, "openrouter");
        assert_eq!(aggregated.model_name, "openai/gpt-5");
    }

    #[test]
    fn gemini_prefixes_use_native_dialect() {
        for model in ["g/gemini-2.5-flash", "gemini/gemini-2.5-flash"] {
            let route = registry().resolve(model);
            assert_eq!(route.provider.name, "google");
            assert_eq!(route.provider.dialect, Dialect::Gemini);
            assert_eq!(route.model_name, "gemini-2.5-flash");
        }
    }

    #[test]
    fn anthropic_compatible_aggregators() {
        let route = registry().resolve("kimi/kimi-k2");
        assert_eq!(route.provider.name, "moonshot");
        assert_eq!(route.provider.dialect, Dialect::Anthropic);

        let route = registry().resolve("mm/MiniMax-M2");
        assert_eq!(route.provider.name, "minimax");
        assert_eq!(route.provider.api_path, "/anthropic/v1/messages");
    }

    #[test]
    fn slash_fallback_routes_to_aggregator() {
        let route = registry().resolve("meta-llama/llama-4-maverick");
        assert_eq!(route.provider.name, "openrouter");
        assert_eq!(route.model_name, "meta-llama/llama-4-maverick");
    }

    #[test]
    fn bare_names_route_to_anthropic() {
        let route = registry().resolve("claude-sonnet-4");
        assert_eq!(route.provider.name, "anthropic");
        assert_eq!(route.provider.dialect, Dialect::Anthropic);
        assert_eq!(route.model_name, "claude-sonnet-4");
    }

    #[test]
    fn url_pinned_model_synthesises_a_local_provider() {
        let route = registry().resolve("http://192.168.1.20:8080/v1/qwen3-coder");
        assert_eq!(route.provider.name, "custom");
        assert_eq!(route.provider.base_url, "http://192.168.1.20:8080");
        assert_eq!(route.model_name, "qwen3-coder");
        assert!(route.provider.local);
    }

    #[test]
    fn resolution_is_total() {
        for model in ["", "x", "a/b/c", "ollama/", "http://bad"] {
            // Never panics, always lands on some provider.
            let _ = registry().resolve(model);
        }
    }
}
