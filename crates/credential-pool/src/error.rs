//! Error types for the credential pool engine

/// Errors surfaced by the engine's public operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lock acquisition timed out after {0}s")]
    LockTimeout(u64),

    #[error("{0}")]
    AllAccountsUnavailable(String),

    #[error("Exhausted {0} retries across all accounts")]
    RetriesExhausted(u32),

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Transport error: {0}")]
    TransportFailed(String),

    #[error("common error: {0}")]
    Common(#[from] common::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
