//! Token sources and the start-up resolution order between them.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::{
    AccessToken, MetadataTokenSource, Result, ServiceAccountKey, ServiceAccountTokenSource,
};

/// Something that can mint a fresh Google Cloud access token.
///
/// Implementations do no caching of their own; wrap them in a
/// [`TokenCache`](crate::TokenCache).
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<AccessToken>;

    /// Short label used in logs.
    fn name(&self) -> &str;
}

/// A token managed outside the proxy (e.g. `gcloud auth print-access-token`).
pub struct StaticTokenSource {
    token: SecretString,
}

impl StaticTokenSource {
    pub fn new(token: SecretString) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch(&self) -> Result<AccessToken> {
        Ok(AccessToken::new(self.token.expose_secret(), None))
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Inputs for [`resolve_token_source`].
#[derive(Debug, Clone, Default)]
pub struct CredentialSettings {
    /// Pre-minted access token; wins over everything else.
    pub access_token: Option<SecretString>,
    /// Service-account key file, used when it exists on disk.
    pub service_account_file: Option<PathBuf>,
}

/// Pick a token source: static token, then service-account key file, then
/// the GCE/GKE metadata server.
pub fn resolve_token_source(
    settings: &CredentialSettings,
    http: reqwest::Client,
) -> Result<Arc<dyn TokenSource>> {
    if let Some(token) = &settings.access_token {
        info!(source = "static", "using pre-minted access token");
        return Ok(Arc::new(StaticTokenSource::new(token.clone())));
    }

    if let Some(path) = settings
        .service_account_file
        .as_ref()
        .filter(|p| p.exists())
    {
        let key = ServiceAccountKey::from_file(path)?;
        info!(
            source = "service_account",
            client_email = %key.client_email,
            path = %path.display(),
            "using service account credentials"
        );
        return Ok(Arc::new(ServiceAccountTokenSource::new(key, http)));
    }

    info!(source = "metadata", "no token or key file configured, using metadata server");
    Ok(Arc::new(MetadataTokenSource::new(http)))
}
