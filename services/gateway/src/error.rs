//! Gateway-specific error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("upstream timeout after {0}s")]
    UpstreamTimeout(u64),

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Pool(#[from] credential_pool::Error),
}

impl Error {
    /// HTTP status to report for this error on the proxy surface.
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::UnknownProvider(_) | Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            Error::Pool(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
