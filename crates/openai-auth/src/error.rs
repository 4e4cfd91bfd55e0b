//! Error types for OpenAI OAuth operations

/// Errors from OpenAI OAuth authentication operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
}

/// Result alias for OpenAI auth operations.
pub type Result<T> = std::result::Result<T, Error>;
