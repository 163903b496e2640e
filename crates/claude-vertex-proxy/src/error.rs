//! Proxy error types and their Anthropic wire representation.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use bytes::Bytes;
use claude_vertex_auth::AuthError;
use serde_json::Value;
use thiserror::Error;

use crate::types::ErrorEnvelope;

/// Longest upstream body excerpt carried into an error message.
const MAX_UPSTREAM_MESSAGE: usize = 512;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown model '{alias}' (configured: {known})")]
    UnknownModel { alias: String, known: String },

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("credential error: {message}")]
    Credential { message: String, forbidden: bool },

    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("upstream timed out after {after_ms}ms")]
    UpstreamTimeout { after_ms: u64 },

    #[error("protocol translation error: {0}")]
    ProtocolTranslation(String),

    #[error("upstream returned {status}: {message}")]
    UpstreamStatus { status: u16, message: String },
}

impl ProxyError {
    /// Only transport-level failures are worth a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamTransport(_))
    }

    /// Build an error from a non-success upstream answer.
    pub fn from_upstream_status(status: u16, body: &[u8]) -> Self {
        let message = upstream_message(body)
            .unwrap_or_else(|| format!("upstream returned status {status}"));

        match status {
            401 | 403 => Self::Credential {
                message: format!("Vertex AI rejected the credential: {message}"),
                forbidden: status == 403,
            },
            _ => Self::UpstreamStatus { status, message },
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownModel { .. } | Self::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            Self::Credential {
                forbidden: true, ..
            } => StatusCode::FORBIDDEN,
            Self::Credential { .. } => StatusCode::UNAUTHORIZED,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamTransport(_) | Self::ProtocolTranslation(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamStatus { status, .. } => match status {
                400 | 404 | 413 | 429 | 529 => {
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
                }
                _ => StatusCode::BAD_GATEWAY,
            },
            Self::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The Anthropic `error.type` for this failure.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::UnknownModel { .. } | Self::MalformedRequest(_) => "invalid_request_error",
            Self::Credential {
                forbidden: true, ..
            } => "permission_error",
            Self::Credential { .. } => "authentication_error",
            Self::UpstreamTimeout { .. } => "timeout_error",
            Self::UpstreamStatus { status, .. } => match status {
                400 => "invalid_request_error",
                404 => "not_found_error",
                413 => "request_too_large",
                429 => "rate_limit_error",
                529 => "overloaded_error",
                _ => "api_error",
            },
            Self::UpstreamTransport(_) | Self::ProtocolTranslation(_) | Self::Configuration(_) => {
                "api_error"
            }
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope::new(self.error_type(), self.to_string())
    }

    /// A terminating `event: error` frame for a stream that already started.
    pub fn sse_frame(&self) -> Bytes {
        let data = serde_json::to_string(&self.envelope()).unwrap_or_else(|_| {
            r#"{"type":"error","error":{"type":"api_error","message":"internal error"}}"#
                .to_string()
        });
        Bytes::from(format!("event: error\ndata: {data}\n\n"))
    }
}

impl From<AuthError> for ProxyError {
    fn from(err: AuthError) -> Self {
        Self::Credential {
            forbidden: err.is_forbidden(),
            message: err.to_string(),
        }
    }
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        self.status()
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status()).json(self.envelope())
    }
}

/// Pull `error.message` out of an Anthropic or Google error body, falling back
/// to the raw text.
fn upstream_message(body: &[u8]) -> Option<String> {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        let root = match &value {
            Value::Array(items) => items.first(),
            other => Some(other),
        };
        let message = root
            .and_then(|v| v.get("error"))
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str);
        if let Some(message) = message {
            return Some(message.to_string());
        }
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(text.chars().take(MAX_UPSTREAM_MESSAGE).collect())
}
