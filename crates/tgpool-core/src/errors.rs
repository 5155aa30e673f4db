use std::time::Duration;

use crate::domain::AccountId;

/// Core error type.
///
/// Adapter crates map their platform-specific errors into this type so the
/// orchestration layer can classify failures consistently (terminal vs retryable).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid code pattern: {0}")]
    Pattern(String),

    #[error("account {0} not found")]
    NotFound(AccountId),

    #[error("account {0} already exists")]
    Duplicate(AccountId),

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("invalid phone number: {0}")]
    InvalidPhone(String),

    #[error("account {0} requires interactive authorization")]
    AuthRequired(AccountId),

    #[error("account {0} is deactivated on the platform")]
    Deactivated(AccountId),

    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("not supported by this platform adapter: {0}")]
    Unsupported(String),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Transient network-side failures a caller may retry under its own policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. } | Error::Connection(_) | Error::Timeout(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<regex::Error> for Error {
    fn from(e: regex::Error) -> Self {
        Error::Pattern(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
