//! Actix Web HTTP server.
//!
//! Exposes Anthropic-compatible endpoints:
//! - `POST /v1/messages`
//! - `POST /v1/messages/count_tokens`
//! - `GET /health`

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use anyhow::{Context, Result};
use claude_vertex_auth::{resolve_token_source, TokenCache};
use tracing::{info, info_span, Instrument};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::proxy::{ProxyReply, RequestContext, TranslationProxy};
use crate::types::HealthStatus;
use crate::upstream::HttpTransport;

/// Large enough for long Claude Code conversations with images.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Per-request timeout header sent by the Anthropic SDKs, in seconds.
const TIMEOUT_HEADER: &str = "x-stainless-timeout";

#[derive(Clone)]
pub struct AppState {
    pub proxy: Arc<TranslationProxy>,
    pub default_timeout: Duration,
}

impl AppState {
    pub fn new(proxy: Arc<TranslationProxy>, default_timeout: Duration) -> Self {
        Self {
            proxy,
            default_timeout,
        }
    }

    /// Wire up credentials and the HTTP transport from `config`.
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        let source = resolve_token_source(&config.credentials, client.clone())
            .context("failed to set up Google Cloud credentials")?;
        info!(source = source.name(), "credential source selected");

        let tokens = Arc::new(TokenCache::new(source));
        let transport = Arc::new(HttpTransport::new(client));
        let proxy = TranslationProxy::new(config, tokens, transport);

        Ok(Self::new(Arc::new(proxy), config.server.request_timeout))
    }

    fn request_context(&self, req: &HttpRequest) -> RequestContext {
        let headers = req.headers();
        let timeout = headers
            .get(TIMEOUT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_timeout_secs)
            .unwrap_or(self.default_timeout);
        let beta = headers
            .get("anthropic-beta")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        RequestContext::new(new_request_id(), timeout).with_anthropic_beta(beta)
    }
}

/// Register the routes. The caller provides `web::Data<AppState>`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::PayloadConfig::new(MAX_BODY_BYTES))
        .route("/health", web::get().to(health_check))
        .route("/v1/messages", web::post().to(handle_messages))
        .route(
            "/v1/messages/count_tokens",
            web::post().to(handle_count_tokens),
        );
}

pub async fn serve(config: ProxyConfig) -> Result<()> {
    let addr = (config.server.host.clone(), config.server.port);
    let state = web::Data::new(AppState::from_config(&config)?);

    info!(
        host = %addr.0,
        port = addr.1,
        project = config.routes.project_id(),
        region = config.routes.region(),
        models = config.routes.aliases().len(),
        "claude-vertex-proxy listening"
    );

    HttpServer::new(move || App::new().app_data(state.clone()).configure(configure))
        .bind(&addr)
        .with_context(|| format!("failed to bind {}:{}", addr.0, addr.1))?
        .run()
        .await
        .context("server error")?;

    Ok(())
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(HealthStatus::healthy())
}

async fn handle_messages(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, ProxyError> {
    let ctx = state.request_context(&req);
    let span = info_span!("request", request_id = %ctx.request_id);

    async move {
        let reply = state.proxy.forward(&body, &ctx).await?;
        Ok(match reply {
            ProxyReply::Buffered(bytes) => HttpResponse::Ok()
                .content_type("application/json")
                .insert_header(("x-request-id", ctx.request_id.as_str()))
                .body(bytes),
            ProxyReply::Streaming(stream) => HttpResponse::Ok()
                .content_type("text/event-stream")
                .insert_header(("cache-control", "no-cache"))
                .insert_header(("x-request-id", ctx.request_id.as_str()))
                .streaming(stream),
        })
    }
    .instrument(span)
    .await
}

async fn handle_count_tokens(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, ProxyError> {
    let ctx = state.request_context(&req);
    let span = info_span!("request", request_id = %ctx.request_id);

    async move {
        let bytes = state.proxy.count_tokens(&body, &ctx).await?;
        Ok(HttpResponse::Ok()
            .content_type("application/json")
            .insert_header(("x-request-id", ctx.request_id.as_str()))
            .body(bytes))
    }
    .instrument(span)
    .await
}

fn parse_timeout_secs(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if secs <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

/// Short id used to correlate log lines of one request.
fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timeout_secs() {
        assert_eq!(parse_timeout_secs("600"), Some(Duration::from_secs(600)));
        assert_eq!(parse_timeout_secs(" 1.5 "), Some(Duration::from_millis(1500)));
        assert_eq!(parse_timeout_secs("0"), None);
        assert_eq!(parse_timeout_secs("-3"), None);
        assert_eq!(parse_timeout_secs("NaN"), None);
        assert_eq!(parse_timeout_secs("soon"), None);
        assert_eq!(parse_timeout_secs("1e300"), None);
    }

    #[test]
    fn test_request_ids_are_short_hex() {
        let id = new_request_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_request_id());
    }
}
