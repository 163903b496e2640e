//! Anthropic API wire types.
//!
//! Claude Code speaks Anthropic's `/v1/messages` API. The proxy only looks at
//! the handful of fields it needs for routing (`model`, `stream`, `messages`);
//! everything else in the request body is carried to Vertex AI untouched.
//!
//! Notes:
//! - The body is kept as a JSON object rather than a typed struct so that new
//!   API fields (thinking, tools, cache control, ...) pass through without a
//!   proxy release.
//! - On Vertex AI the model lives in the URL path, not the body, and the body
//!   must carry a Vertex `anthropic_version`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProxyError;

/// API version Vertex AI expects in the body of Anthropic model calls.
pub const VERTEX_ANTHROPIC_VERSION: &str = "vertex-2023-10-16";

/// A validated client request.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRequest {
    model: String,
    stream: bool,
    body: Map<String, Value>,
}

impl InboundRequest {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProxyError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ProxyError::MalformedRequest(format!("invalid JSON body: {e}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ProxyError> {
        let Value::Object(body) = value else {
            return Err(ProxyError::MalformedRequest(
                "request body must be a JSON object".to_string(),
            ));
        };

        let model = match body.get("model") {
            Some(Value::String(model)) if !model.trim().is_empty() => model.clone(),
            Some(Value::String(_)) | None => {
                return Err(ProxyError::MalformedRequest(
                    "model: field required".to_string(),
                ))
            }
            Some(_) => {
                return Err(ProxyError::MalformedRequest(
                    "model: expected a string".to_string(),
                ))
            }
        };

        let stream = match body.get("stream") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(stream)) => *stream,
            Some(_) => {
                return Err(ProxyError::MalformedRequest(
                    "stream: expected a boolean".to_string(),
                ))
            }
        };

        match body.get("messages") {
            Some(Value::Array(messages)) if !messages.is_empty() => {}
            Some(Value::Array(_)) => {
                return Err(ProxyError::MalformedRequest(
                    "messages: at least one message is required".to_string(),
                ))
            }
            Some(_) => {
                return Err(ProxyError::MalformedRequest(
                    "messages: expected an array".to_string(),
                ))
            }
            None => {
                return Err(ProxyError::MalformedRequest(
                    "messages: field required".to_string(),
                ))
            }
        }

        Ok(Self {
            model,
            stream,
            body,
        })
    }

    /// The model name as the client sent it.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn is_stream(&self) -> bool {
        self.stream
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }
}

/// The body sent to Vertex AI.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    body: Map<String, Value>,
}

impl OutboundRequest {
    /// Body for `:rawPredict` / `:streamRawPredict`. The model moves to the URL.
    pub fn for_messages(request: &InboundRequest) -> Self {
        let mut body = request.body.clone();
        body.remove("model");
        if !body.contains_key("anthropic_version") {
            body.insert(
                "anthropic_version".to_string(),
                Value::String(VERTEX_ANTHROPIC_VERSION.to_string()),
            );
        }
        Self { body }
    }

    /// Body for `count-tokens:rawPredict`, which takes the model in the body.
    pub fn for_count_tokens(request: &InboundRequest, vertex_model: &str) -> Self {
        let mut body = request.body.clone();
        body.remove("stream");
        body.insert("model".to_string(), Value::String(vertex_model.to_string()));
        Self { body }
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn to_bytes(&self) -> Result<Bytes, ProxyError> {
        serde_json::to_vec(&self.body)
            .map(Bytes::from)
            .map_err(|e| ProxyError::ProtocolTranslation(format!("failed to encode request: {e}")))
    }
}

/// `{"type":"error","error":{"type":...,"message":...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            error: ErrorDetail {
                kind: kind.into(),
                message: message.into(),
            },
        }
    }
}

/// Response for `POST /v1/messages/count_tokens`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCountResponse {
    pub input_tokens: u64,
}

/// Response for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: Value) -> InboundRequest {
        InboundRequest::from_value(value).unwrap()
    }

    #[test]
    fn test_inbound_keeps_unknown_fields() {
        let req = request(json!({
            "model": "sonnet",
            "max_tokens": 1024,
            "messages": [{"role": "user", "content": "hi"}],
            "thinking": {"type": "enabled", "budget_tokens": 2048},
            "metadata": {"user_id": "abc"}
        }));

        assert_eq!(req.model(), "sonnet");
        assert!(!req.is_stream());
        assert_eq!(req.body()["thinking"]["budget_tokens"], 2048);
        assert_eq!(req.body()["metadata"]["user_id"], "abc");
    }

    #[test]
    fn test_inbound_validation() {
        let cases = [
            (json!([1, 2]), "JSON object"),
            (json!({"messages": [{"role": "user", "content": "hi"}]}), "model"),
            (json!({"model": 5, "messages": [{"role": "user", "content": "hi"}]}), "model"),
            (json!({"model": " ", "messages": [{"role": "user", "content": "hi"}]}), "model"),
            (json!({"model": "sonnet"}), "messages"),
            (json!({"model": "sonnet", "messages": []}), "messages"),
            (json!({"model": "sonnet", "messages": "hi"}), "messages"),
            (
                json!({"model": "sonnet", "stream": "yes", "messages": [{"role": "user", "content": "hi"}]}),
                "stream",
            ),
        ];

        for (value, field) in cases {
            let err = InboundRequest::from_value(value.clone()).unwrap_err();
            assert!(
                matches!(&err, ProxyError::MalformedRequest(msg) if msg.contains(field)),
                "{value} -> {err}"
            );
        }

        let err = InboundRequest::from_slice(b"{not json").unwrap_err();
        assert!(matches!(err, ProxyError::MalformedRequest(_)));
    }

    #[test]
    fn test_outbound_messages_body() {
        let req = request(json!({
            "model": "haiku",
            "stream": true,
            "max_tokens": 16,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let out = OutboundRequest::for_messages(&req);

        assert!(!out.body().contains_key("model"));
        assert_eq!(out.body()["anthropic_version"], VERTEX_ANTHROPIC_VERSION);
        assert_eq!(out.body()["stream"], true);
        assert_eq!(out.body()["max_tokens"], 16);
    }

    #[test]
    fn test_outbound_keeps_client_anthropic_version() {
        let req = request(json!({
            "model": "haiku",
            "anthropic_version": "vertex-2099-01-01",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let out = OutboundRequest::for_messages(&req);
        assert_eq!(out.body()["anthropic_version"], "vertex-2099-01-01");
    }

    #[test]
    fn test_outbound_count_tokens_body() {
        let req = request(json!({
            "model": "haiku",
            "stream": false,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let out = OutboundRequest::for_count_tokens(&req, "claude-3-5-haiku@20241022");

        assert_eq!(out.body()["model"], "claude-3-5-haiku@20241022");
        assert!(!out.body().contains_key("stream"));
        let bytes = out.to_bytes().unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["messages"][0]["content"], "hi");
    }

    #[test]
    fn test_error_envelope_serialization() {
        let value = serde_json::to_value(ErrorEnvelope::new("not_found_error", "gone")).unwrap();
        assert_eq!(
            value,
            json!({"type": "error", "error": {"type": "not_found_error", "message": "gone"}})
        );
    }
}
