//! Executor: the retry/rotation loop around a fetch operation (§4.8).

use rand::Rng;
use tracing::{debug, warn};

use crate::collab::{HostClient, ToastVariant};
use crate::error::{Error, Result};
use crate::manager::AccountManager;
use crate::ratelimit::RateLimitHandler;
use crate::runtime::RuntimeFactory;
use std::sync::Arc;

const MAX_RESOLVE_ATTEMPTS: u32 = 10;

pub struct Executor {
    manager: Arc<AccountManager>,
    runtime_factory: Arc<RuntimeFactory>,
    rate_limit_handler: Arc<RateLimitHandler>,
    host: Arc<dyn HostClient>,
    provider_name: String,
}

impl Executor {
    pub fn new(
        manager: Arc<AccountManager>,
        runtime_factory: Arc<RuntimeFactory>,
        rate_limit_handler: Arc<RateLimitHandler>,
        host: Arc<dyn HostClient>,
        provider_name: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            runtime_factory,
            rate_limit_handler,
            host,
            provider_name: provider_name.into(),
        }
    }

    /// Drive one logical request to completion, rotating accounts as
    /// needed. `build_request` is called fresh on every attempt since a
    /// `reqwest::Request` is consumed by the transport.
    pub async fn execute(
        &self,
        build_request: impl Fn() -> reqwest::Request,
    ) -> Result<reqwest::Response> {
        self.manager.refresh().await;
        let account_count = self.manager.pool_size().await;
        if account_count == 0 {
            return Err(Error::AllAccountsUnavailable(format!(
                "No {} accounts configured",
                self.provider_name
            )));
        }

        let max_retries = (account_count as u32 * 3).max(6);
        let mut previous_uuid: Option<String> = None;

        for _retry in 0..max_retries {
            self.manager.refresh().await;
            let uuid = self.resolve_account().await?;

            if previous_uuid.as_deref() != Some(uuid.as_str()) && account_count > 1 {
                self.host
                    .show_toast(&format!("Switched to {uuid}"), ToastVariant::Info);
            }
            previous_uuid = Some(uuid.clone());

            let runtime = self.runtime_factory.get_runtime(&uuid);

            let response = match runtime.fetch(build_request()).await {
                Ok(response) => response,
                Err(Error::RefreshFailed(status_label)) => {
                    self.runtime_factory.invalidate(&uuid);
                    let permanent = status_label
                        .parse::<u16>()
                        .map(|s| matches!(s, 400 | 401 | 403))
                        .unwrap_or(false);
                    self.manager.mark_auth_failure(&uuid, permanent).await;
                    self.manager.refresh().await;
                    if !self.manager.has_any_usable_account().await {
                        let message = if permanent {
                            format!("All {} accounts are disabled or revoked", self.provider_name)
                        } else {
                            format!("All {} accounts have authentication failures", self.provider_name)
                        };
                        return Err(Error::AllAccountsUnavailable(message));
                    }
                    continue;
                }
                Err(Error::TransportFailed(message)) => {
                    warn!(uuid, error = %message, "transport error, no auth marking");
                    self.host.show_toast(&message, ToastVariant::Error);
                    continue;
                }
                Err(e) => {
                    warn!(uuid, error = %e, "transport error, rotating");
                    self.host.show_toast(&e.to_string(), ToastVariant::Error);
                    continue;
                }
            };

            let status = response.status().as_u16();

            if status >= 500 {
                if let Some(response) = self.retry_same_account(&runtime, &build_request, status).await? {
                    self.manager.mark_success(&uuid).await;
                    return Ok(response);
                }
                continue;
            }

            if status == 401 {
                self.runtime_factory.invalidate(&uuid);
                let retried = runtime.fetch(build_request()).await;
                match retried {
                    Ok(response) if response.status().as_u16() != 401 => {
                        self.manager.mark_success(&uuid).await;
                        return Ok(response);
                    }
                    _ => {
                        self.manager.mark_auth_failure(&uuid, false).await;
                        self.manager.refresh().await;
                        continue;
                    }
                }
            }

            if status == 403 {
                let response_headers = response.headers().clone();
                let body = response.bytes().await.unwrap_or_default();
                if body.windows(7).any(|w| w == b"revoked") {
                    self.manager.mark_revoked(&uuid).await;
                    continue;
                }
                self.manager.mark_success(&uuid).await;
                let mut builder = http::Response::builder().status(403);
                if let Some(headers) = builder.headers_mut() {
                    *headers = response_headers;
                }
                return Ok(builder.body(body).unwrap().into());
            }

            if status == 429 {
                let headers = header_map_to_string_map(response.headers());
                self.rate_limit_handler
                    .handle_429(&self.manager, &uuid, &headers, &self.manager.config())
                    .await;
                continue;
            }

            self.manager.mark_success(&uuid).await;
            return Ok(response);
        }

        Err(Error::RetriesExhausted(max_retries))
    }

    async fn resolve_account(&self) -> Result<String> {
        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            if let Some(uuid) = self.manager.select_account().await {
                return Ok(uuid);
            }

            if !self.manager.has_any_usable_account().await {
                return Err(Error::AllAccountsUnavailable(format!(
                    "All {} accounts are disabled",
                    self.provider_name
                )));
            }

            let wait_ms = self.manager.min_wait_time_ms().await;
            if wait_ms == 0 {
                return Err(Error::AllAccountsUnavailable(format!(
                    "All {} accounts are rate-limited",
                    self.provider_name
                )));
            }

            self.host.show_toast(
                &format!("Waiting {}ms for an account to become usable", wait_ms),
                ToastVariant::Warning,
            );
            tokio::time::sleep(std::time::Duration::from_millis(wait_ms)).await;
        }

        Err(Error::AllAccountsUnavailable(format!(
            "All {} accounts are rate-limited",
            self.provider_name
        )))
    }

    /// Retries the same account up to twice more on a >=500 response,
    /// with `min(1000*2^attempt, 4000)ms` backoff plus +/-25% jitter.
    /// Returns `Ok(Some(response))` on an eventual non-5xx response,
    /// `Ok(None)` if all attempts stayed >=500.
    async fn retry_same_account(
        &self,
        runtime: &crate::runtime::Runtime,
        build_request: &impl Fn() -> reqwest::Request,
        first_status: u16,
    ) -> Result<Option<reqwest::Response>> {
        let mut status = first_status;
        for attempt in 1..=2u32 {
            if status < 500 {
                break;
            }
            let base_ms = (1000u64.saturating_mul(1u64 << attempt)).min(4000);
            let jitter = {
                let mut rng = rand::rng();
                rng.random_range(-0.25..=0.25)
            };
            let delay_ms = (base_ms as f64 * (1.0 + jitter)).max(0.0) as u64;
            debug!(attempt, delay_ms, "retrying same account after 5xx");
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;

            match runtime.fetch(build_request()).await {
                Ok(response) => {
                    status = response.status().as_u16();
                    if status < 500 {
                        return Ok(Some(response));
                    }
                }
                Err(_) => continue,
            }
        }
        Ok(None)
    }
}

fn header_map_to_string_map(headers: &reqwest::header::HeaderMap) -> std::collections::HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_lowercase(), v.to_string())))
        .collect()
}
