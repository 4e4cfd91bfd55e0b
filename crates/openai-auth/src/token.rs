//! Token refresh and usage fetch for the OpenAI/Codex collaborator.
//!
//! The interactive device/browser authorization flow is out of scope here
//! (UI layer) — accounts arrive already carrying a refresh token, either
//! from the legacy auth migration or from an external login step. This
//! crate only implements what the engine calls at runtime: refreshing an
//! access token and fetching usage.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{OPENAI_AUTH_BASE, OPENAI_CLIENT_ID, USAGE_ENDPOINT};
use crate::error::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
    #[serde(default)]
    pub account_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'a str,
    refresh_token: &'a str,
    client_id: &'a str,
}

pub async fn refresh_token(client: &reqwest::Client, refresh: &str) -> Result<TokenResponse> {
    if refresh.is_empty() {
        return Err(Error::InvalidCredentials("empty refresh token".into()));
    }

    let url = format!("{OPENAI_AUTH_BASE}/oauth/token");
    let response = client
        .post(&url)
        .timeout(REQUEST_TIMEOUT)
        .form(&RefreshRequest {
            grant_type: "refresh_token",
            refresh_token: refresh,
            client_id: OPENAI_CLIENT_ID,
        })
        .send()
        .await
        .map_err(|e| Error::Http(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        if matches!(status.as_u16(), 400 | 401 | 403) {
            warn!(%status, "refresh token rejected, treating as permanent failure");
            return Err(Error::InvalidCredentials(format!("{status}: {body}")));
        }
        warn!(%status, "token refresh failed");
        return Err(Error::TokenExchange(format!("{status}: {body}")));
    }

    let token = response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(e.to_string()))?;
    debug!(expires_in = token.expires_in, "refreshed access token");
    Ok(token)
}

/// A single usage window as reported by OpenAI (`primary_window` /
/// `secondary_window`), before being mapped onto the internal
/// `five_hour` / `seven_day` naming used by the account store.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct UsageWindow {
    pub utilization: f64,
    #[serde(default)]
    pub resets_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawUsageResponse {
    #[serde(default)]
    primary_window: Option<UsageWindow>,
    #[serde(default)]
    secondary_window: Option<UsageWindow>,
}

/// Usage limits mapped onto the internal naming. OpenAI has no equivalent
/// of Anthropic's `seven_day_sonnet` tier.
#[derive(Debug, Clone, Default)]
pub struct OpenAiUsage {
    pub five_hour: Option<UsageWindow>,
    pub seven_day: Option<UsageWindow>,
}

pub async fn fetch_usage(client: &reqwest::Client, access_token: &str) -> Result<OpenAiUsage> {
    let response = client
        .get(USAGE_ENDPOINT)
        .timeout(REQUEST_TIMEOUT)
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| Error::Http(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Http(format!("{status}: {body}")));
    }

    let raw: RawUsageResponse = response
        .json()
        .await
        .map_err(|e| Error::Http(e.to_string()))?;

    Ok(OpenAiUsage {
        five_hour: raw.primary_window,
        seven_day: raw.secondary_window,
    })
}
