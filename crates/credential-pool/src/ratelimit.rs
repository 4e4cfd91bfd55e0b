//! Rate-Limit Handler: parses the server's retry hint, blends it with
//! usage-derived reset timing, and marks the account rate-limited (§4.5).

use std::sync::Arc;

use tracing::debug;

use crate::collab::{HostClient, ToastVariant, UsageFetcher};
use crate::config::Config;
use crate::manager::AccountManager;
use crate::model::{now_ms, USAGE_STALE_MS};

pub struct RateLimitHandler {
    usage_fetcher: Arc<dyn UsageFetcher>,
    host: Arc<dyn HostClient>,
}

impl RateLimitHandler {
    pub fn new(usage_fetcher: Arc<dyn UsageFetcher>, host: Arc<dyn HostClient>) -> Self {
        Self {
            usage_fetcher,
            host,
        }
    }

    /// Parse `retry-after-ms` / `retry-after` headers with that priority,
    /// falling back to the configured default.
    pub fn parse_retry_after_ms(
        headers: &std::collections::HashMap<String, String>,
        config: &Config,
    ) -> u64 {
        if let Some(ms) = headers
            .get("retry-after-ms")
            .and_then(|v| v.parse::<u64>().ok())
        {
            return ms;
        }
        if let Some(secs) = headers
            .get("retry-after")
            .and_then(|v| v.parse::<u64>().ok())
        {
            return secs * 1000;
        }
        config.default_retry_after_ms
    }

    /// Handle a 429 for `uuid`: mark rate-limited using the smaller of the
    /// usage-derived reset and the header-derived one (preferring the
    /// usage-derived reset when present), then kick off an async usage
    /// refresh if the cache is stale.
    pub async fn handle_429(
        &self,
        manager: &AccountManager,
        uuid: &str,
        headers: &std::collections::HashMap<String, String>,
        config: &Config,
    ) {
        let header_retry_ms = Self::parse_retry_after_ms(headers, config);
        let now = now_ms();

        let usage_reset_ms = manager
            .account_snapshot(uuid)
            .await
            .and_then(|a| a.cached_usage.and_then(|u| u.earliest_exhausted_reset_ms()))
            .map(|reset_at| reset_at.saturating_sub(now))
            .filter(|ms| *ms > 0);

        let effective_ms = usage_reset_ms.unwrap_or(header_retry_ms);
        manager.mark_rate_limited(uuid, Some(effective_ms)).await;

        if manager.pool_size().await > 1 {
            self.host.show_toast(
                &format!("Rate limited; retrying in {}", format_wait(effective_ms)),
                ToastVariant::Warning,
            );
        }

        self.maybe_refresh_usage(manager, uuid).await;
    }

    async fn maybe_refresh_usage(&self, manager: &AccountManager, uuid: &str) {
        let Some(account) = manager.account_snapshot(uuid).await else {
            return;
        };
        let now = now_ms();
        let is_stale = account
            .cached_usage_at
            .map(|at| now.saturating_sub(at) > USAGE_STALE_MS)
            .unwrap_or(true);
        let Some(access_token) = account.access_token else {
            return;
        };
        if !is_stale {
            return;
        }

        if let Some(usage) = self.usage_fetcher.fetch_usage(&access_token).await {
            manager.apply_usage_cache(uuid, usage).await;
        } else {
            debug!(uuid, "usage fetch failed, ignoring");
        }
    }
}

fn format_wait(ms: u64) -> String {
    if ms >= 1000 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_ms_header_takes_priority() {
        let mut headers = std::collections::HashMap::new();
        headers.insert("retry-after-ms".to_string(), "500".to_string());
        headers.insert("retry-after".to_string(), "10".to_string());
        let config = Config::default();
        assert_eq!(RateLimitHandler::parse_retry_after_ms(&headers, &config), 500);
    }

    #[test]
    fn retry_after_seconds_converted_to_ms() {
        let mut headers = std::collections::HashMap::new();
        headers.insert("retry-after".to_string(), "10".to_string());
        let config = Config::default();
        assert_eq!(RateLimitHandler::parse_retry_after_ms(&headers, &config), 10_000);
    }

    #[test]
    fn falls_back_to_config_default() {
        let headers = std::collections::HashMap::new();
        let config = Config::default();
        assert_eq!(
            RateLimitHandler::parse_retry_after_ms(&headers, &config),
            config.default_retry_after_ms
        );
    }

    #[test]
    fn format_wait_uses_seconds_above_one_second() {
        assert_eq!(format_wait(10_000), "10s");
        assert_eq!(format_wait(500), "500ms");
    }
}
