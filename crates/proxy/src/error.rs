use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::protocol::anthropic::ErrorBody;

pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

/// Proxy errors observable to the client, with Anthropic-shaped responses.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Cannot reach the upstream provider.
    #[error("Cannot reach {url}: {reason}")]
    Connection { url: String, reason: String },

    /// Upstream returned a non-2xx status we don't recognise specifically.
    #[error("Upstream API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Upstream 429 after the retry budget was exhausted.
    #[error("Rate limited by upstream: {0}")]
    RateLimited(String),

    /// Upstream indicated the model is unavailable.
    #[error("Model '{model}' not found. {hint}")]
    ModelNotFound { model: String, hint: String },

    /// The chosen model cannot support a capability the request needs.
    #[error("Model '{model}' does not support {capability}")]
    Capability { model: String, capability: String },

    /// A provider credential is missing from the environment.
    #[error("Missing credential: set {env}. Get a key at {hint_url}")]
    MissingCredential { env: String, hint_url: String },

    /// Malformed client request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Anything else.
    #[error("Internal server error")]
    Internal(Option<String>),
}

impl ProxyError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Connection { .. } => StatusCode::BAD_GATEWAY,
            Self::Api { status, .. } => match *status {
                400 => StatusCode::BAD_REQUEST,
                401 => StatusCode::UNAUTHORIZED,
                403 => StatusCode::FORBIDDEN,
                404 => StatusCode::NOT_FOUND,
                429 => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::BAD_GATEWAY,
            },
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Capability { .. } | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::MissingCredential { .. } => StatusCode::UNAUTHORIZED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wire `type` string used in both error responses and `error` events.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection_error",
            Self::Api { .. } => "api_error",
            Self::RateLimited(_) => "rate_limit_error",
            Self::ModelNotFound { .. } => "model_not_found",
            Self::Capability { .. } => "capability_error",
            Self::MissingCredential { .. } => "authentication_error",
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::Internal(_) => "server_error",
        }
    }

    /// Message that is safe to expose to the client.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(Some(upstream)) => upstream.clone(),
            Self::Internal(None) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    /// Error payload for an in-stream `error` SSE event.
    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody {
            error_type: self.error_type().to_string(),
            message: self.client_message(),
        }
    }

    /// True when a fresh attempt against the same upstream may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::RateLimited(_)) || matches!(self, Self::Api { status, .. } if *status >= 500)
    }
}

/// Error response body shaped like Anthropic's.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    #[serde(rename = "type")]
    response_type: &'static str,
    error: ErrorBody,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            response_type: "error",
            error: self.to_error_body(),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credential_names_the_env_var() {
        let error = ProxyError::MissingCredential {
            env: "GEMINI_API_KEY".to_string(),
            hint_url: "https://aistudio.google.com/apikey".to_string(),
        };

        assert_eq!(error.status_code(), StatusCode::UNAUTHORIZED);
        assert!(error.client_message().contains("GEMINI_API_KEY"));
        assert!(error.client_message().contains("aistudio.google.com"));
    }

    #[test]
    fn upstream_status_maps_through() {
        let error = ProxyError::Api {
            status: 404,
            message: "no such model".to_string(),
        };
        assert_eq!(error.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(error.error_type(), "api_error");
    }

    #[test]
    fn transient_classification() {
        assert!(
            ProxyError::Connection {
                url: "http://localhost:11434".to_string(),
                reason: "refused".to_string()
            }
            .is_transient()
        );
        assert!(ProxyError::RateLimited("slow down".to_string()).is_transient());
        assert!(
            ProxyError::Api {
                status: 503,
                message: "overloaded".to_string()
            }
            .is_transient()
        );
        assert!(
            !ProxyError::Capability {
                model: "tinyllama".to_string(),
                capability: "tools".to_string()
            }
            .is_transient()
        );
    }
}
