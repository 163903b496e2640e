//! Process-wide access-token cache with single-flight refresh.

use chrono::{Duration, Utc};
use secrecy::SecretString;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::{AccessToken, AuthError, Result, TokenSource};

/// Refresh this long before the upstream-reported expiry.
const DEFAULT_SAFETY_WINDOW_SECS: i64 = 300;

#[derive(Default)]
struct CacheState {
    token: Option<AccessToken>,
    /// Bumped after every refresh attempt, successful or not.
    generation: u64,
    last_failure: Option<FailedRefresh>,
}

#[derive(Clone)]
struct FailedRefresh {
    message: String,
    forbidden: bool,
}

impl CacheState {
    fn fresh(&self, window: Duration) -> Option<SecretString> {
        self.token
            .as_ref()
            .filter(|t| t.is_fresh_at(Utc::now(), window))
            .map(|t| t.secret().clone())
    }
}

/// Hands out cached tokens and refreshes them lazily.
///
/// Concurrent callers that find the token stale queue on one refresh lock.
/// The first one through calls the source; the rest observe that a refresh
/// finished while they waited and take its outcome, so N callers racing on an
/// expired token cost exactly one call to [`TokenSource::fetch`].
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    state: RwLock<CacheState>,
    refresh: Mutex<()>,
    safety_window: Duration,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            state: RwLock::new(CacheState::default()),
            refresh: Mutex::new(()),
            safety_window: Duration::seconds(DEFAULT_SAFETY_WINDOW_SECS),
        }
    }

    /// Seed the cache, e.g. with a token known to be stale.
    pub fn with_token(self, token: AccessToken) -> Self {
        Self {
            state: RwLock::new(CacheState {
                token: Some(token),
                ..CacheState::default()
            }),
            ..self
        }
    }

    pub fn with_safety_window(mut self, window: Duration) -> Self {
        self.safety_window = window;
        self
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// A usable bearer token, refreshing first if the cached one is stale.
    pub async fn token(&self) -> Result<SecretString> {
        let observed = {
            let state = self.state.read().await;
            if let Some(secret) = state.fresh(self.safety_window) {
                return Ok(secret);
            }
            state.generation
        };

        let _refresh = self.refresh.lock().await;

        {
            let state = self.state.read().await;
            if state.generation != observed {
                if let Some(secret) = state.fresh(self.safety_window) {
                    return Ok(secret);
                }
                if let Some(failure) = &state.last_failure {
                    return Err(AuthError::RefreshFailed {
                        message: failure.message.clone(),
                        forbidden: failure.forbidden,
                    });
                }
            }
        }

        debug!(source = self.source.name(), "refreshing access token");
        let result = self.source.fetch().await;

        let mut state = self.state.write().await;
        state.generation += 1;
        match result {
            Ok(token) => {
                let secret = token.secret().clone();
                debug!(expires_at = ?token.expires_at(), "access token refreshed");
                state.token = Some(token);
                state.last_failure = None;
                Ok(secret)
            }
            Err(err) => {
                warn!(source = self.source.name(), error = %err, "access token refresh failed");
                state.last_failure = Some(FailedRefresh {
                    message: err.to_string(),
                    forbidden: err.is_forbidden(),
                });
                Err(err)
            }
        }
    }

    /// Drop the cached token so the next call refreshes.
    pub async fn invalidate(&self) {
        self.state.write().await.token = None;
    }
}
