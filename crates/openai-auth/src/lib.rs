//! OpenAI/Codex OAuth collaborator
//!
//! Provides the token refresh and usage-fetch interactions the credential
//! pool engine needs from OpenAI as an injected collaborator
//! (`credential_pool::Refresher` / `credential_pool::UsageFetcher`). The
//! interactive device/browser login flow is out of scope — accounts arrive
//! with a refresh token already in hand, from auth migration or an
//! external login step.

pub mod constants;
pub mod error;
pub mod token;

pub use constants::*;
pub use error::{Error, Result};
pub use token::{OpenAiUsage, TokenResponse, UsageWindow, fetch_usage, refresh_token};
