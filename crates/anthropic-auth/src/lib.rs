//! Anthropic OAuth collaborator
//!
//! Provides PKCE flow generation plus the token exchange/refresh/usage
//! interactions the credential pool engine needs from Anthropic as an
//! injected collaborator (`credential_pool::Refresher` /
//! `credential_pool::UsageFetcher`). This crate is a standalone library
//! with no dependency on the engine or the gateway binary — it can be
//! tested and used independently.
//!
//! Credential flow:
//! 1. Admin calls `pkce::generate_verifier()` + `pkce::compute_challenge()`
//! 2. User authorizes via `pkce::build_authorization_url()`
//! 3. Gateway calls `token::exchange_code()` with the authorization code
//! 4. The resulting tokens are handed to the account store as a new account
//! 5. The proactive refresh queue / request-time path call
//!    `token::refresh_token()` as tokens approach expiry

pub mod constants;
pub mod error;
pub mod pkce;
pub mod token;

pub use constants::*;
pub use error::{Error, Result};
pub use pkce::{build_authorization_url, compute_challenge, generate_verifier};
pub use token::{AnthropicUsage, TokenResponse, exchange_code, fetch_usage, refresh_token};
