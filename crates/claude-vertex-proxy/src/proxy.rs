//! The translation proxy: route, authenticate, forward, relay.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use claude_vertex_auth::{SecretString, TokenCache};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use crate::config::{ProxyConfig, RouteConfig};
use crate::error::ProxyError;
use crate::lifecycle::Lifecycle;
use crate::retry::{with_retry, RetryPolicy};
use crate::streaming::{spawn_relay, RelayOptions, RelayStream};
use crate::translation::{translate_count_tokens, translate_message, StreamTranslator};
use crate::types::{InboundRequest, OutboundRequest};
use crate::upstream::{UpstreamCall, UpstreamResponse, VertexTransport};
use crate::vertex::{VertexEndpoint, VertexMethod};

/// Longest deadline honoured for one request, whatever the caller asks for.
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Per-request inputs that do not come from the body.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub deadline: Instant,
    pub timeout: Duration,
    pub anthropic_beta: Option<String>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>, timeout: Duration) -> Self {
        let timeout = timeout.min(MAX_REQUEST_TIMEOUT);
        Self {
            request_id: request_id.into(),
            deadline: Instant::now() + timeout,
            timeout,
            anthropic_beta: None,
        }
    }

    pub fn with_anthropic_beta(mut self, beta: Option<String>) -> Self {
        self.anthropic_beta = beta;
        self
    }

    fn timeout_error(&self) -> ProxyError {
        ProxyError::UpstreamTimeout {
            after_ms: millis(self.timeout),
        }
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// What to send back to the client.
pub enum ProxyReply {
    /// A complete JSON body.
    Buffered(Bytes),
    /// SSE frames, relayed as they arrive.
    Streaming(RelayStream),
}

pub struct TranslationProxy {
    routes: RouteConfig,
    endpoint: VertexEndpoint,
    tokens: Arc<TokenCache>,
    transport: Arc<dyn VertexTransport>,
    retry: RetryPolicy,
    stream_buffer: usize,
    log_bodies: bool,
}

impl TranslationProxy {
    pub fn new(
        config: &ProxyConfig,
        tokens: Arc<TokenCache>,
        transport: Arc<dyn VertexTransport>,
    ) -> Self {
        Self {
            endpoint: VertexEndpoint::new(&config.routes, config.vertex_base_url.as_deref()),
            routes: config.routes.clone(),
            tokens,
            transport,
            retry: RetryPolicy::default(),
            stream_buffer: config.server.stream_buffer,
            log_bodies: config.logging.log_bodies,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn routes(&self) -> &RouteConfig {
        &self.routes
    }

    pub fn resolve_model(&self, alias: &str) -> Result<&str, ProxyError> {
        self.routes.resolve_model(alias)
    }

    /// Handle a `/v1/messages` call.
    pub async fn forward(&self, body: &[u8], ctx: &RequestContext) -> Result<ProxyReply, ProxyError> {
        let mut lifecycle = Lifecycle::new();

        let request = InboundRequest::from_slice(body).map_err(|e| lifecycle.fail(e))?;
        if self.log_bodies {
            debug!(body = %String::from_utf8_lossy(body), "request body");
        }

        let vertex_model = self
            .resolve_model(request.model())
            .map_err(|e| lifecycle.fail(e))?
            .to_string();
        lifecycle.advance();
        info!(
            model = request.model(),
            vertex_model = %vertex_model,
            stream = request.is_stream(),
            "forwarding request"
        );

        let bearer = self.bearer(ctx).await.map_err(|e| lifecycle.fail(e))?;
        lifecycle.advance();

        let outbound = OutboundRequest::for_messages(&request);
        let call = UpstreamCall {
            url: self
                .endpoint
                .url(&vertex_model, VertexMethod::for_stream(request.is_stream())),
            bearer,
            body: outbound.to_bytes().map_err(|e| lifecycle.fail(e))?,
            anthropic_beta: ctx.anthropic_beta.clone(),
            stream: request.is_stream(),
        };
        lifecycle.advance();

        if request.is_stream() {
            let response = self.send_once(&call, ctx).await.map_err(|e| lifecycle.fail(e))?;
            let translator = StreamTranslator::new(request.model());
            let relay = spawn_relay(
                response.body,
                translator,
                lifecycle,
                RelayOptions {
                    capacity: self.stream_buffer,
                    deadline: ctx.deadline,
                    timeout: ctx.timeout,
                },
            );
            return Ok(ProxyReply::Streaming(relay));
        }

        let raw = self.call_buffered(&call, ctx).await.map_err(|e| lifecycle.fail(e))?;
        let translated = translate_message(&raw, request.model()).map_err(|e| lifecycle.fail(e))?;
        lifecycle.advance();
        Ok(ProxyReply::Buffered(translated))
    }

    /// Handle a `/v1/messages/count_tokens` call.
    pub async fn count_tokens(&self, body: &[u8], ctx: &RequestContext) -> Result<Bytes, ProxyError> {
        let mut lifecycle = Lifecycle::new();

        let request = InboundRequest::from_slice(body).map_err(|e| lifecycle.fail(e))?;
        let vertex_model = self
            .resolve_model(request.model())
            .map_err(|e| lifecycle.fail(e))?
            .to_string();
        lifecycle.advance();

        let bearer = self.bearer(ctx).await.map_err(|e| lifecycle.fail(e))?;
        lifecycle.advance();

        let outbound = OutboundRequest::for_count_tokens(&request, &vertex_model);
        let call = UpstreamCall {
            url: self.endpoint.url(&vertex_model, VertexMethod::CountTokens),
            bearer,
            body: outbound.to_bytes().map_err(|e| lifecycle.fail(e))?,
            anthropic_beta: ctx.anthropic_beta.clone(),
            stream: false,
        };
        lifecycle.advance();

        let raw = self.call_buffered(&call, ctx).await.map_err(|e| lifecycle.fail(e))?;
        let count = translate_count_tokens(&raw).map_err(|e| lifecycle.fail(e))?;
        let encoded = serde_json::to_vec(&count)
            .map(Bytes::from)
            .map_err(|e| lifecycle.fail(ProxyError::ProtocolTranslation(e.to_string())))?;
        lifecycle.advance();
        Ok(encoded)
    }

    async fn bearer(&self, ctx: &RequestContext) -> Result<SecretString, ProxyError> {
        match timeout_at(ctx.deadline, self.tokens.token()).await {
            Ok(token) => token.map_err(ProxyError::from),
            Err(_) => Err(ctx.timeout_error()),
        }
    }

    /// One attempt, up to response headers. Non-success answers become errors.
    async fn send_once(
        &self,
        call: &UpstreamCall,
        ctx: &RequestContext,
    ) -> Result<UpstreamResponse, ProxyError> {
        let response = timeout_at(ctx.deadline, self.transport.send(call))
            .await
            .map_err(|_| ctx.timeout_error())??;

        if response.is_success() {
            return Ok(response);
        }

        let status = response.status;
        let body = timeout_at(ctx.deadline, response.collect())
            .await
            .map_err(|_| ctx.timeout_error())?
            .unwrap_or_default();
        if status == 401 {
            self.tokens.invalidate().await;
        }
        Err(ProxyError::from_upstream_status(status, &body))
    }

    /// Send and read the whole body, retrying transport failures per policy.
    async fn call_buffered(&self, call: &UpstreamCall, ctx: &RequestContext) -> Result<Bytes, ProxyError> {
        let attempt = || async move {
            let response = self.send_once(call, ctx).await?;
            timeout_at(ctx.deadline, response.collect())
                .await
                .map_err(|_| ctx.timeout_error())?
        };
        let body = with_retry(&self.retry, attempt).await?;

        if self.log_bodies {
            debug!(body = %String::from_utf8_lossy(&body), "upstream response body");
        }
        Ok(body)
    }
}
