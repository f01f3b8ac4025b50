use std::{path::PathBuf, time::Duration};

/// Errors produced while issuing, caching or refreshing tokens.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("timed out after {waited:?} waiting for lock {}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("lock path must be absolute: {}", .0.display())]
    RelativeLockPath(PathBuf),

    #[error("failed to marshal token: {0}")]
    Marshal(#[source] serde_json::Error),

    #[error("failed to decode token: {0}")]
    Decode(String),

    #[error("failed to read from the system randomness source: {0}")]
    Randomness(String),

    #[error("no port available for the callback listener in {start}-{end}")]
    NoPortAvailable { start: u16, end: u16 },

    #[error("oauth callback state mismatch")]
    StateMismatch,

    #[error("ID token nonce mismatch")]
    NonceMismatch,

    #[error("token response did not include an ID token")]
    MissingIdToken,

    #[error("timed out after {0:?} waiting for the browser login to complete")]
    AuthenticationTimeout(Duration),

    #[error("authorization failed: {error}{}", .description.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    AuthorizationFailed {
        error: String,
        description: Option<String>,
    },

    #[error("device code expired before the login was approved")]
    DeviceCodeExpired,

    #[error("access denied by the identity provider")]
    AccessDenied,

    #[error("refresh produced a token that is not fresh")]
    InvalidFreshToken,

    #[error("operation cancelled")]
    Cancelled,

    #[error("token endpoint returned {status}: {error}{}", .description.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    OAuth {
        status: u16,
        error: String,
        description: Option<String>,
    },

    #[error("provider discovery failed: {0}")]
    Discovery(String),

    #[error("invalid ID token: {0}")]
    IdToken(#[from] jsonwebtoken::errors::Error),

    #[error("no signing key matches ID token key id {0:?}")]
    UnknownSigningKey(Option<String>),

    #[error("value is too large for the keyring backend")]
    ValueTooLarge,

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// Errors the operator can act on (retry the login, ask for access, ...)
    /// rather than infrastructure or programming failures.
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            Self::AccessDenied
                | Self::DeviceCodeExpired
                | Self::AuthenticationTimeout(_)
                | Self::AuthorizationFailed { .. }
                | Self::StateMismatch
                | Self::NonceMismatch
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
