//! The HTTP seam between the proxy and Vertex AI.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use claude_vertex_auth::{ExposeSecret, SecretString};
use futures::{Stream, StreamExt};

use crate::error::ProxyError;

/// Upstream response body, chunk by chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProxyError>> + Send>>;

/// One request to Vertex AI, ready to send (and to send again).
#[derive(Clone)]
pub struct UpstreamCall {
    pub url: String,
    pub bearer: SecretString,
    pub body: Bytes,
    pub anthropic_beta: Option<String>,
    pub stream: bool,
}

impl std::fmt::Debug for UpstreamCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamCall")
            .field("url", &self.url)
            .field("bearer", &"[REDACTED]")
            .field("body_len", &self.body.len())
            .field("anthropic_beta", &self.anthropic_beta)
            .field("stream", &self.stream)
            .finish()
    }
}

pub struct UpstreamResponse {
    pub status: u16,
    pub body: ByteStream,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Read the whole body.
    pub async fn collect(mut self) -> Result<Bytes, ProxyError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

#[async_trait]
pub trait VertexTransport: Send + Sync {
    /// Send the call and return once response headers arrive.
    async fn send(&self, call: &UpstreamCall) -> Result<UpstreamResponse, ProxyError>;
}

/// [`VertexTransport`] over `reqwest`.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VertexTransport for HttpTransport {
    async fn send(&self, call: &UpstreamCall) -> Result<UpstreamResponse, ProxyError> {
        let mut request = self
            .client
            .post(&call.url)
            .bearer_auth(call.bearer.expose_secret())
            .header("content-type", "application/json")
            .body(call.body.clone());

        if call.stream {
            request = request.header("accept", "text/event-stream");
        }
        if let Some(beta) = &call.anthropic_beta {
            request = request.header("anthropic-beta", beta);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(transport_error))
            .boxed();

        Ok(UpstreamResponse { status, body })
    }
}

fn transport_error(err: reqwest::Error) -> ProxyError {
    if err.is_timeout() {
        ProxyError::UpstreamTransport(format!("upstream I/O timed out: {err}"))
    } else if err.is_connect() {
        ProxyError::UpstreamTransport(format!("failed to connect to Vertex AI: {err}"))
    } else {
        ProxyError::UpstreamTransport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn call(url: String) -> UpstreamCall {
        UpstreamCall {
            url,
            bearer: SecretString::from("ya29.test".to_string()),
            body: Bytes::from_static(br#"{"messages":[]}"#),
            anthropic_beta: Some("prompt-caching-2024-07-31".to_string()),
            stream: false,
        }
    }

    #[tokio::test]
    async fn test_sends_bearer_and_beta_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/m:rawPredict"))
            .and(header("authorization", "Bearer ya29.test"))
            .and(header("anthropic-beta", "prompt-caching-2024-07-31"))
            .and(body_json(serde_json::json!({"messages": []})))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"ok\":true}"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(reqwest::Client::new());
        let response = transport
            .send(&call(format!("{}/m:rawPredict", server.uri())))
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(response.collect().await.unwrap(), Bytes::from_static(b"{\"ok\":true}"));
    }

    #[tokio::test]
    async fn test_error_status_is_returned_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(reqwest::Client::new());
        let response = transport.send(&call(server.uri())).await.unwrap();

        assert_eq!(response.status, 429);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(reqwest::Client::new());
        let err = transport
            .send(&call(format!("http://{addr}/m:rawPredict")))
            .await
            .err()
            .unwrap();

        assert!(err.is_retryable());
    }

    #[test]
    fn test_debug_redacts_bearer() {
        let rendered = format!("{:?}", call("http://localhost".to_string()));
        assert!(!rendered.contains("ya29.test"));
        assert!(rendered.contains("REDACTED"));
    }
}
