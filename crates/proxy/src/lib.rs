//! Claudish proxy core.
//!
//! A loopback reverse proxy that impersonates the Anthropic Messages API and
//! translates each request to whichever upstream provider actually serves
//! the chosen model, streaming the result back as Anthropic-shaped SSE.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub mod adapter;
pub mod detect;
mod error;
pub mod middleware;
pub mod protocol;
pub mod prune;
pub mod recovery;
pub mod registry;
pub mod route;
pub mod stream;
pub mod tracker;
pub mod translate;

mod handler;
mod http_client;
mod retry;

pub use error::{ProxyError, ProxyResult};
pub use handler::HandlerContext;
pub use route::{ModelRouter, ProfileMap, RouterOptions};

use crate::{
    detect::{HealthCache, ModelCache},
    middleware::ReplayCache,
    protocol::anthropic::MessagesRequest,
    registry::Registry,
    tracker::SessionTracker,
};

/// Everything the proxy needs to serve.
pub struct ServeConfig {
    /// Port on the loopback interface. Chosen externally.
    pub port: u16,
    pub runtime: config::RuntimeConfig,
    pub options: RouterOptions,
    /// Cancellation token for graceful shutdown.
    pub shutdown: CancellationToken,
    /// Reports the actually-bound address once listening.
    pub bound_addr_sender: Option<tokio::sync::oneshot::Sender<SocketAddr>>,
}

struct ProxyState {
    router: ModelRouter,
    port: u16,
}

/// Builds the axum router for the proxy endpoints.
pub fn router(port: u16, runtime: config::RuntimeConfig, options: RouterOptions) -> Router {
    let registry = Registry::new(&runtime.endpoints);

    let ctx = Arc::new(HandlerContext {
        config: runtime,
        replay_cache: Arc::new(ReplayCache::default()),
        health_cache: Arc::new(HealthCache::default()),
        model_cache: Arc::new(ModelCache::new(ModelCache::default_path())),
        status_dir: SessionTracker::default_status_dir(),
        port,
    });

    let state = Arc::new(ProxyState {
        router: ModelRouter::new(registry, options, ctx),
        port,
    });

    Router::new()
        .route("/health", get(health))
        .route("/", get(status))
        .route("/v1/messages", post(messages))
        .route("/v1/messages/count_tokens", post(count_tokens))
        .with_state(state)
}

/// Binds the loopback interface and serves until the token is cancelled.
pub async fn serve(config: ServeConfig) -> anyhow::Result<()> {
    let ServeConfig {
        port,
        runtime,
        options,
        shutdown,
        bound_addr_sender,
    } = config;

    let app = router(port, runtime, options);

    let address = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(address).await?;
    let bound = listener.local_addr()?;

    log::info!("Claudish proxy listening on http://{bound}");

    if let Some(sender) = bound_addr_sender {
        let _ = sender.send(bound);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Human-readable status snapshot, also polled by the status line.
async fn status(State(state): State<Arc<ProxyState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "port": state.port,
        "sessions": state.router.sessions(),
    }))
}

async fn messages(State(state): State<Arc<ProxyState>>, body: Bytes) -> Result<Response, ProxyError> {
    let request: MessagesRequest = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::InvalidRequest(format!("Malformed messages request: {e}")))?;

    log::debug!(
        "Messages request for {} ({} message(s), stream={})",
        request.model,
        request.messages.len(),
        request.stream.unwrap_or(false)
    );

    let handler = state.router.route(&request.model);
    handler.handle(request, body).await
}

async fn count_tokens(State(state): State<Arc<ProxyState>>, body: Bytes) -> Result<Response, ProxyError> {
    let request: MessagesRequest = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::InvalidRequest(format!("Malformed count_tokens request: {e}")))?;

    let handler = state.router.route(&request.model);
    let counted = handler.count_tokens(body).await?;

    Ok(Json(counted).into_response())
}
