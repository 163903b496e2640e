//! Credential error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("failed to sign token assertion: {0}")]
    Signing(String),

    #[error("token endpoint returned HTTP {status}: {message}")]
    TokenEndpoint { status: u16, message: String },

    #[error("token refresh failed: {message}")]
    RefreshFailed { message: String, forbidden: bool },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuthError {
    /// True when the identity is known but lacks permission, as opposed to
    /// having no usable identity at all.
    pub fn is_forbidden(&self) -> bool {
        match self {
            Self::TokenEndpoint { status, .. } => *status == 403,
            Self::RefreshFailed { forbidden, .. } => *forbidden,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
