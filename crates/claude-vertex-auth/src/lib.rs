//! Google Cloud bearer tokens for Vertex AI.
//!
//! A [`TokenSource`] mints access tokens (static token, service-account JWT
//! grant, or the GCE metadata server). A [`TokenCache`] sits in front of a
//! source and hands out cached tokens until they near expiry, refreshing
//! lazily with a single in-flight refresh shared by all concurrent callers.

mod cache;
mod error;
mod metadata;
mod service_account;
mod source;
mod token;

pub use cache::TokenCache;
pub use error::{AuthError, Result};
pub use metadata::MetadataTokenSource;
pub use service_account::{ServiceAccountKey, ServiceAccountTokenSource};
pub use source::{resolve_token_source, CredentialSettings, StaticTokenSource, TokenSource};
pub use token::AccessToken;

pub use secrecy::{ExposeSecret, SecretString};

/// OAuth scope granting access to Vertex AI.
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
