//! Claude Vertex Proxy - serve Claude Code from Claude models on Vertex AI.
//!
//! Claude Code speaks Anthropic's `/v1/messages` API. This crate exposes a
//! compatible HTTP surface and forwards each call to the matching Claude
//! publisher model on Vertex AI (`:rawPredict` / `:streamRawPredict`).
//!
//! Design goals:
//! - Accept Claude Code traffic (Anthropic wire format) unchanged.
//! - Route the client's model name to a configured Vertex AI model id.
//! - Authenticate with a cached Google Cloud access token.
//! - Relay responses, including SSE streams, in the shape Claude Code expects.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod proxy;
pub mod retry;
pub mod server;
pub mod streaming;
pub mod translation;
pub mod types;
pub mod upstream;
pub mod vertex;

pub use config::{ProxyConfig, RouteConfig};
pub use error::ProxyError;
pub use proxy::{ProxyReply, RequestContext, TranslationProxy};
pub use server::serve;
