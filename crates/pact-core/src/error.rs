use thiserror::Error;

/// Core engine errors.
///
/// The taxonomy matters for retry policy: `Upstream` is retryable by the
/// caller and must never be cached by the idempotency ledger, while
/// `Validation`/`Unauthorized` are terminal for the request that raised them.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("provider call failed: {0}")]
    Upstream(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    pub fn store(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Store(format!("{context}: {err}"))
    }

    /// True for errors a client may legitimately retry with the same
    /// idempotency key.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream(_) | Self::Store(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
