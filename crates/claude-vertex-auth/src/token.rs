use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;

use crate::error::{AuthError, Result};

/// A bearer token plus the instant it stops being valid.
///
/// `expires_at == None` means the token never expires from the proxy's point
/// of view (an externally managed static token).
#[derive(Clone)]
pub struct AccessToken {
    secret: SecretString,
    expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            secret: SecretString::from(token.into()),
            expires_at,
        }
    }

    /// Token valid for `expires_in_secs` from now, as reported by OAuth
    /// token endpoints. A lifetime that does not fit a timestamp is rejected.
    pub fn expiring_in(token: impl Into<String>, expires_in_secs: i64) -> Result<Self> {
        let expires_at = Duration::try_seconds(expires_in_secs)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| {
                AuthError::InvalidCredentials(format!(
                    "token endpoint returned unusable expires_in: {expires_in_secs}"
                ))
            })?;
        Ok(Self::new(token, Some(expires_at)))
    }

    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Whether the token is still usable at `now` with `window` to spare.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.expires_at {
            Some(exp) => exp - window > now,
            None => true,
        }
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
