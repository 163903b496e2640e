//! Response translation (Vertex AI → Anthropic).
//!
//! Claude on Vertex AI already answers in the Anthropic Messages format, so
//! translation is narrow:
//! - the `model` field is rewritten back to the name the client asked for
//!   (Vertex reports its own `claude-...@date` identifier),
//! - `stop_reason` is normalised to the Anthropic vocabulary,
//! - every other field and every other stream event passes through as is.

use bytes::Bytes;
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::ProxyError;
use crate::types::TokenCountResponse;

/// Stop reasons Claude Code understands.
const ANTHROPIC_STOP_REASONS: &[&str] = &[
    "end_turn",
    "max_tokens",
    "stop_sequence",
    "tool_use",
    "pause_turn",
    "refusal",
];

/// Normalise a stop reason to the Anthropic vocabulary.
pub fn map_stop_reason(reason: &str) -> String {
    if ANTHROPIC_STOP_REASONS.contains(&reason) {
        return reason.to_string();
    }

    match reason {
        "stop" | "STOP" | "end" => "end_turn".to_string(),
        "length" | "MAX_TOKENS" | "max_output_tokens" => "max_tokens".to_string(),
        "tool_calls" | "function_call" => "tool_use".to_string(),
        "content_filter" | "SAFETY" | "RECITATION" | "BLOCKLIST" => "refusal".to_string(),
        other => {
            warn!(stop_reason = other, "unrecognised stop reason, passing through");
            other.to_string()
        }
    }
}

/// Translate a buffered `message` response.
pub fn translate_message(body: &[u8], client_model: &str) -> Result<Bytes, ProxyError> {
    let value: Value = serde_json::from_slice(body).map_err(|e| {
        ProxyError::ProtocolTranslation(format!("upstream response is not JSON: {e}"))
    })?;
    let Value::Object(mut message) = value else {
        return Err(ProxyError::ProtocolTranslation(
            "upstream response is not a JSON object".to_string(),
        ));
    };

    rewrite_message(&mut message, client_model);
    encode(&message)
}

/// Translate a `count-tokens:rawPredict` response.
pub fn translate_count_tokens(body: &[u8]) -> Result<TokenCountResponse, ProxyError> {
    let value: Value = serde_json::from_slice(body).map_err(|e| {
        ProxyError::ProtocolTranslation(format!("upstream token count is not JSON: {e}"))
    })?;

    value
        .get("input_tokens")
        .and_then(Value::as_u64)
        .map(|input_tokens| TokenCountResponse { input_tokens })
        .ok_or_else(|| {
            ProxyError::ProtocolTranslation(
                "upstream token count is missing input_tokens".to_string(),
            )
        })
}

fn rewrite_message(message: &mut Map<String, Value>, client_model: &str) {
    message.insert("model".to_string(), Value::String(client_model.to_string()));
    rewrite_stop_reason(message);
}

fn rewrite_stop_reason(object: &mut Map<String, Value>) {
    if let Some(Value::String(reason)) = object.get_mut("stop_reason") {
        let mapped = map_stop_reason(reason);
        *reason = mapped;
    }
}

fn encode(value: &Map<String, Value>) -> Result<Bytes, ProxyError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| ProxyError::ProtocolTranslation(format!("failed to encode response: {e}")))
}

/// Format one SSE frame.
pub fn sse_frame(event: &str, data: &[u8]) -> Bytes {
    let mut frame = Vec::with_capacity(event.len() + data.len() + 16);
    frame.extend_from_slice(b"event: ");
    frame.extend_from_slice(event.as_bytes());
    frame.extend_from_slice(b"\ndata: ");
    frame.extend_from_slice(data);
    frame.extend_from_slice(b"\n\n");
    Bytes::from(frame)
}

/// How an upstream event stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// `message_stop` was seen.
    Completed,
    /// Upstream sent an `error` event, already relayed to the client.
    UpstreamError(String),
    /// The body ended before either.
    Truncated,
}

/// Per-stream translation state.
#[derive(Debug)]
pub struct StreamTranslator {
    client_model: String,
    saw_stop: bool,
    upstream_error: Option<String>,
    frames: u64,
}

impl StreamTranslator {
    pub fn new(client_model: impl Into<String>) -> Self {
        Self {
            client_model: client_model.into(),
            saw_stop: false,
            upstream_error: None,
            frames: 0,
        }
    }

    /// Translate one complete SSE frame (including its trailing blank line).
    ///
    /// Frames that need no change are returned byte for byte.
    pub fn translate(&mut self, frame: Bytes) -> Result<Bytes, ProxyError> {
        self.frames += 1;

        let text = std::str::from_utf8(&frame).map_err(|e| {
            ProxyError::ProtocolTranslation(format!("upstream event is not UTF-8: {e}"))
        })?;
        let Some(data) = data_field(text) else {
            return Ok(frame);
        };

        let mut value: Value = serde_json::from_str(&data).map_err(|e| {
            ProxyError::ProtocolTranslation(format!("upstream event data is not JSON: {e}"))
        })?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match kind.as_str() {
            "message_start" => {
                if let Some(Value::Object(message)) = value.get_mut("message") {
                    rewrite_message(message, &self.client_model);
                }
                self.reencode(&kind, &value)
            }
            "message_delta" => {
                if let Some(Value::Object(delta)) = value.get_mut("delta") {
                    rewrite_stop_reason(delta);
                }
                self.reencode(&kind, &value)
            }
            "message_stop" => {
                self.saw_stop = true;
                Ok(frame)
            }
            "error" => {
                let message = value
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("upstream stream error")
                    .to_string();
                self.upstream_error = Some(message);
                Ok(frame)
            }
            _ => Ok(frame),
        }
    }

    fn reencode(&self, event: &str, value: &Value) -> Result<Bytes, ProxyError> {
        let data = serde_json::to_vec(value).map_err(|e| {
            ProxyError::ProtocolTranslation(format!("failed to encode event: {e}"))
        })?;
        Ok(sse_frame(event, &data))
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn end(&self) -> StreamEnd {
        match (&self.upstream_error, self.saw_stop) {
            (Some(message), _) => StreamEnd::UpstreamError(message.clone()),
            (None, true) => StreamEnd::Completed,
            (None, false) => StreamEnd::Truncated,
        }
    }
}

/// Join the frame's `data:` lines, per the SSE rules.
fn data_field(frame: &str) -> Option<String> {
    let mut data: Option<String> = None;
    for line in frame.lines() {
        let Some(rest) = line.strip_prefix("data:") else {
            continue;
        };
        let rest = rest.strip_prefix(' ').unwrap_or(rest);
        match &mut data {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(rest);
            }
            None => data = Some(rest.to_string()),
        }
    }
    data
}
