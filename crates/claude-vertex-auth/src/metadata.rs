//! Access tokens from the GCE/GKE metadata server.

use async_trait::async_trait;
use serde::Deserialize;

use crate::{AccessToken, AuthError, Result, TokenSource};

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: i64,
}

pub struct MetadataTokenSource {
    http: reqwest::Client,
    url: String,
}

impl MetadataTokenSource {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            url: METADATA_TOKEN_URL.to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[async_trait]
impl TokenSource for MetadataTokenSource {
    async fn fetch(&self) -> Result<AccessToken> {
        let response = self
            .http
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenEndpoint { status, message });
        }

        let token: MetadataToken = response.json().await?;
        AccessToken::expiring_in(token.access_token, token.expires_in)
    }

    fn name(&self) -> &str {
        "metadata"
    }
}
