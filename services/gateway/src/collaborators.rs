//! Provider-specific implementations of the engine's collaborator traits
//! (`Refresher`/`UsageFetcher`/`RequestTransport`), wrapping the
//! `anthropic-auth`/`openai-auth` crates.

use std::future::Future;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use credential_pool::model::UsageTier;
use credential_pool::{RefreshOutcome, RefreshPatch, RequestTransport, UsageFetcher, UsageLimits, Refresher};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct AnthropicCollaborator {
    client: reqwest::Client,
}

impl AnthropicCollaborator {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Refresher for AnthropicCollaborator {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = RefreshOutcome> + Send + 'a>> {
        Box::pin(async move {
            match anthropic_auth::refresh_token(&self.client, refresh_token).await {
                Ok(response) => RefreshOutcome::Ok(RefreshPatch {
                    access_token: response.access_token,
                    expires_at: now_ms() + response.expires_in * 1000,
                    refresh_token: Some(response.refresh_token),
                    account_id: response.account_id,
                    email: response.email,
                }),
                Err(anthropic_auth::Error::InvalidCredentials(_)) => RefreshOutcome::Err {
                    permanent: true,
                    status: Some(401),
                },
                Err(_) => RefreshOutcome::Err {
                    permanent: false,
                    status: None,
                },
            }
        })
    }
}

impl UsageFetcher for AnthropicCollaborator {
    fn fetch_usage<'a>(
        &'a self,
        access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<UsageLimits>> + Send + 'a>> {
        Box::pin(async move {
            let usage = anthropic_auth::fetch_usage(&self.client, access_token)
                .await
                .ok()?;
            Some(UsageLimits {
                five_hour: usage.five_hour.map(map_anthropic_tier),
                seven_day: usage.seven_day.map(map_anthropic_tier),
                seven_day_sonnet: usage.seven_day_sonnet.map(map_anthropic_tier),
            })
        })
    }
}

impl RequestTransport for AnthropicCollaborator {
    fn send<'a>(
        &'a self,
        access_token: &'a str,
        mut request: reqwest::Request,
    ) -> Pin<Box<dyn Future<Output = Result<reqwest::Response, reqwest::Error>> + Send + 'a>> {
        Box::pin(async move {
            {
                let headers = request.headers_mut();
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    format!("Bearer {access_token}")
                        .parse()
                        .expect("bearer header value is always valid"),
                );
                headers.insert(
                    reqwest::header::USER_AGENT,
                    anthropic_auth::USER_AGENT
                        .parse()
                        .expect("constant user agent is always valid"),
                );
                headers.insert(
                    "anthropic-beta",
                    anthropic_auth::BETA_HEADER
                        .parse()
                        .expect("constant beta header is always valid"),
                );
            }
            self.client.execute(request).await
        })
    }
}

fn map_anthropic_tier(tier: anthropic_auth::UsageTier) -> UsageTier {
    UsageTier {
        utilization: tier.utilization,
        resets_at: tier.resets_at,
    }
}

pub struct OpenAiCollaborator {
    client: reqwest::Client,
}

impl OpenAiCollaborator {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Refresher for OpenAiCollaborator {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = RefreshOutcome> + Send + 'a>> {
        Box::pin(async move {
            match openai_auth::refresh_token(&self.client, refresh_token).await {
                Ok(response) => RefreshOutcome::Ok(RefreshPatch {
                    access_token: response.access_token,
                    expires_at: now_ms() + response.expires_in * 1000,
                    refresh_token: Some(response.refresh_token),
                    account_id: response.account_id,
                    email: None,
                }),
                Err(openai_auth::Error::InvalidCredentials(_)) => RefreshOutcome::Err {
                    permanent: true,
                    status: Some(401),
                },
                Err(_) => RefreshOutcome::Err {
                    permanent: false,
                    status: None,
                },
            }
        })
    }
}

impl UsageFetcher for OpenAiCollaborator {
    fn fetch_usage<'a>(
        &'a self,
        access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<UsageLimits>> + Send + 'a>> {
        Box::pin(async move {
            let usage = openai_auth::fetch_usage(&self.client, access_token).await.ok()?;
            Some(UsageLimits {
                five_hour: usage.five_hour.map(map_openai_window),
                seven_day: usage.seven_day.map(map_openai_window),
                seven_day_sonnet: None,
            })
        })
    }
}

impl RequestTransport for OpenAiCollaborator {
    fn send<'a>(
        &'a self,
        access_token: &'a str,
        mut request: reqwest::Request,
    ) -> Pin<Box<dyn Future<Output = Result<reqwest::Response, reqwest::Error>> + Send + 'a>> {
        Box::pin(async move {
            request.headers_mut().insert(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {access_token}")
                    .parse()
                    .expect("bearer header value is always valid"),
            );
            self.client.execute(request).await
        })
    }
}

fn map_openai_window(window: openai_auth::UsageWindow) -> UsageTier {
    UsageTier {
        utilization: window.utilization,
        resets_at: window.resets_at,
    }
}
