//! Per-provider request handlers.
//!
//! A handler is the long-lived object bound to one `(provider, model)` pair.
//! It owns the session state (token counters, context window, the Gemini
//! tool-name map) and converts requests and responses for its dialect. One
//! handler exists per target model for the life of the proxy; per-request
//! state lives in the streaming machine.

mod anthropic;
mod google;
mod openai;

pub use anthropic::AnthropicHandler;
pub use google::GoogleHandler;
pub use openai::OpenAiHandler;

use std::{convert::Infallible, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    response::{IntoResponse, Response, Sse, sse::Event},
};
use futures::StreamExt;
use secrecy::SecretString;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    detect::{HealthCache, ModelCache},
    error::{ProxyError, ProxyResult},
    middleware::ReplayCache,
    protocol::anthropic::{CountTokensResponse, MessagesRequest, StreamEvent},
    registry::{Dialect, ProviderDescriptor, Route},
    stream::estimate_tokens,
    tracker::SessionTracker,
};

/// Shared collaborators injected into every handler.
///
/// Everything process-wide lives here explicitly (design note: no ambient
/// globals) so the handlers stay testable with fakes.
pub struct HandlerContext {
    pub config: config::RuntimeConfig,
    pub replay_cache: Arc<ReplayCache>,
    pub health_cache: Arc<HealthCache>,
    pub model_cache: Arc<ModelCache>,
    pub status_dir: PathBuf,
    pub port: u16,
}

/// A provider-bound request handler.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Serves one `/v1/messages` call, returning the SSE response.
    async fn handle(&self, request: MessagesRequest, raw_body: Bytes) -> ProxyResult<Response>;

    /// Serves `/v1/messages/count_tokens`.
    async fn count_tokens(&self, raw_body: Bytes) -> ProxyResult<CountTokensResponse> {
        Ok(CountTokensResponse {
            input_tokens: u64::from(estimate_tokens(std::str::from_utf8(&raw_body).unwrap_or_default())),
        })
    }

    fn descriptor(&self) -> &ProviderDescriptor;

    fn tracker(&self) -> &SessionTracker;
}

/// Builds the handler for a resolved route.
pub fn build(route: Route, ctx: &Arc<HandlerContext>) -> Arc<dyn Handler> {
    match route.provider.dialect {
        Dialect::OpenAi => Arc::new(OpenAiHandler::new(route, ctx)),
        Dialect::Gemini => Arc::new(GoogleHandler::new(route, ctx)),
        Dialect::Anthropic => Arc::new(AnthropicHandler::new(route, ctx)),
    }
}

/// Reads the provider's credential, or reports which variable is missing.
pub(crate) fn credential(provider: &ProviderDescriptor) -> ProxyResult<Option<SecretString>> {
    let Some(env) = provider.cred_env else {
        return Ok(None);
    };

    match std::env::var(env) {
        Ok(value) if !value.trim().is_empty() => Ok(Some(SecretString::from(value))),
        _ => Err(ProxyError::MissingCredential {
            env: env.to_string(),
            hint_url: provider.hint_url.to_string(),
        }),
    }
}

/// Rejects requests whose capabilities the model cannot serve.
pub(crate) fn check_capabilities(provider: &ProviderDescriptor, request: &MessagesRequest, model: &str) -> ProxyResult<()> {
    let needs_tools = request.tools.as_ref().is_some_and(|tools| !tools.is_empty());

    if needs_tools && !provider.capabilities.tools {
        return Err(ProxyError::Capability {
            model: model.to_string(),
            capability: "tools".to_string(),
        });
    }

    Ok(())
}

/// Turns the machine's event channel into the client-facing SSE response,
/// terminated by the `data: [DONE]` sentinel.
pub(crate) fn sse_response(receiver: mpsc::UnboundedReceiver<StreamEvent>) -> Response {
    let events = UnboundedReceiverStream::new(receiver)
        .map(|event| Ok::<_, Infallible>(Event::default().event(event.event_name()).json_data(&event).unwrap_or_else(|e| {
            log::error!("Failed to serialize stream event: {e}");
            Event::default().event("error").data(r#"{"type":"error","error":{"type":"server_error","message":"serialization failed"}}"#)
        })));

    let with_done = events.chain(futures::stream::once(async {
        Ok::<_, Infallible>(Event::default().data("[DONE]"))
    }));

    Sse::new(with_done).into_response()
}

/// Rough input-size estimate for `message_start` and fallback accounting.
pub(crate) fn input_estimate(raw_body: &Bytes) -> u32 {
    estimate_tokens(std::str::from_utf8(raw_body).unwrap_or_default())
}

/// Maps an upstream non-2xx status to the error taxonomy.
pub(crate) async fn upstream_error(provider: &ProviderDescriptor, model: &str, response: reqwest::Response) -> ProxyError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());

    log::error!("{} API error ({status}): {body}", provider.name);

    let model_missing = status == 404
        || (body.contains("not found") && body.contains("model"))
        || body.contains("model_not_found");

    if model_missing {
        let hint = if provider.ollama_options {
            format!("Try: ollama pull {model}")
        } else if provider.local {
            format!("Check that {model} is loaded on {}", provider.base_url)
        } else {
            format!("Check the model name against {}", provider.name)
        };

        return ProxyError::ModelNotFound {
            model: model.to_string(),
            hint,
        };
    }

    match status {
        429 => ProxyError::RateLimited(body),
        _ => ProxyError::Api { status, message: body },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use config::LocalEndpoints;

    #[test]
    fn missing_credential_names_env_and_hint() {
        let registry = Registry::new(&LocalEndpoints::default());
        let route = registry.resolve("g/gemini-2.5-flash");

        // SAFETY: no other test mutates this variable.
        unsafe {
            std::env::remove_var("GEMINI_API_KEY");
        }

        let error = credential(&route.provider).unwrap_err();
        let message = error.client_message();
        assert!(message.contains("GEMINI_API_KEY"));
        assert!(message.contains("aistudio.google.com"));
    }

    #[test]
    fn local_providers_need_no_credential() {
        let registry = Registry::new(&LocalEndpoints::default());
        let route = registry.resolve("ollama/qwen3:8b");

        assert!(credential(&route.provider).unwrap().is_none());
    }

    #[test]
    fn tools_against_toolless_model_is_a_capability_error() {
        let registry = Registry::new(&LocalEndpoints::default());
        let mut route = registry.resolve("ollama/tinyllama");
        route.provider.capabilities.tools = false;

        let request: MessagesRequest = serde_json::from_value(serde_json::json!({
            "model": "ollama/tinyllama",
            "max_tokens": 128,
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "Read", "input_schema": {"type": "object"}}]
        }))
        .unwrap();

        let error = check_capabilities(&route.provider, &request, "tinyllama").unwrap_err();
        assert_eq!(error.error_type(), "capability_error");
    }
}
