//! OAuth token exchange, refresh, and usage retrieval
//!
//! Handles the three token endpoint interactions the pool needs:
//! authorization code exchange (PKCE flow completion), token refresh
//! (request-time and proactive), and usage-tier polling. All three talk to
//! Anthropic's console host (`console.anthropic.com` / `api.anthropic.com`),
//! never the inference API directly.
//!
//! Anthropic's token endpoint accepts a JSON body (unlike OpenAI's, which is
//! form-encoded — see `openai-auth`).

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::constants::{ANTHROPIC_CLIENT_ID, REDIRECT_URI, TOKEN_ENDPOINT, USAGE_ENDPOINT};
use crate::error::{Error, Result};

/// Timeout for a single refresh/exchange attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds from the response time. The caller
/// converts this to an absolute unix millisecond timestamp when storing
/// the credential.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Serialize)]
struct ExchangeRequest<'a> {
    grant_type: &'static str,
    code: &'a str,
    code_verifier: &'a str,
    client_id: &'a str,
    redirect_uri: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'static str,
    refresh_token: &'a str,
    client_id: &'a str,
}

/// Exchange an authorization code for tokens (initial OAuth flow).
///
/// This is the second step of the PKCE flow: the user has authorized in
/// their browser, and we received the authorization code. We send the code
/// along with the PKCE verifier to prove we initiated the flow.
pub async fn exchange_code(
    client: &reqwest::Client,
    code: &str,
    verifier: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(TOKEN_ENDPOINT)
        .timeout(REQUEST_TIMEOUT)
        .json(&ExchangeRequest {
            grant_type: "authorization_code",
            code,
            code_verifier: verifier,
            client_id: ANTHROPIC_CLIENT_ID,
            redirect_uri: REDIRECT_URI,
        })
        .send()
        .await
        .map_err(|e| Error::Http(format!("token exchange request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        warn!(%status, "token exchange rejected");
        return Err(Error::TokenExchange(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    let token = response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid token response: {e}")))?;
    info!(account_id = ?token.account_id, "exchanged authorization code for tokens");
    Ok(token)
}

/// Refresh an access token using a refresh token.
///
/// Called proactively by the background refresh queue (before expiration)
/// and reactively at request time (when the token is about to expire).
/// Returns `Error::InvalidCredentials` for 400/401/403 — the caller treats
/// this as a permanent failure and disables the account.
pub async fn refresh_token(client: &reqwest::Client, refresh: &str) -> Result<TokenResponse> {
    if refresh.is_empty() {
        return Err(Error::InvalidCredentials("empty refresh token".into()));
    }

    let response = client
        .post(TOKEN_ENDPOINT)
        .timeout(REQUEST_TIMEOUT)
        .json(&RefreshRequest {
            grant_type: "refresh_token",
            refresh_token: refresh,
            client_id: ANTHROPIC_CLIENT_ID,
        })
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if matches!(status.as_u16(), 400 | 401 | 403) {
            warn!(%status, "refresh token rejected, treating as permanent failure");
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        warn!(%status, "token refresh failed");
        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    let token = response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))?;
    debug!(expires_in = token.expires_in, "refreshed access token");
    Ok(token)
}

/// A single usage tier as reported by the usage endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UsageTier {
    pub utilization: f64,
    #[serde(default)]
    pub resets_at: Option<String>,
}

/// Per-tier utilization as reported by Anthropic's usage endpoint.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AnthropicUsage {
    #[serde(default)]
    pub five_hour: Option<UsageTier>,
    #[serde(default)]
    pub seven_day: Option<UsageTier>,
    #[serde(default)]
    pub seven_day_sonnet: Option<UsageTier>,
}

/// Fetch current usage tiers for the given access token.
pub async fn fetch_usage(client: &reqwest::Client, access_token: &str) -> Result<AnthropicUsage> {
    let response = client
        .get(USAGE_ENDPOINT)
        .bearer_auth(access_token)
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await
        .map_err(|e| Error::Http(format!("usage request failed: {e}")))?;

    if !response.status().is_success() {
        return Err(Error::Http(format!(
            "usage endpoint returned {}",
            response.status()
        )));
    }

    response
        .json::<AnthropicUsage>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid usage response: {e}")))
}
