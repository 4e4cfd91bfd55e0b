//! Account Manager: in-memory projection of the account list, selection
//! strategies, and the state-transition table (§4.6). The largest
//! component by design — selection, circuit-breaking, and usage-cache
//! bookkeeping all live here.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OnceCell, RwLock};
use tracing::warn;

use crate::claims::ClaimsCoordinator;
use crate::collab::{HostClient, RefreshOutcome, ToastVariant};
use crate::config::{Config, ConfigLoader, SelectionStrategy};
use crate::model::{now_ms, ManagedAccount, StoredAccount, UsageLimits};
use crate::refresher::TokenRefresher;
use crate::store::AccountStore;

/// Allows the Manager to invalidate a cached runtime without depending on
/// the `RuntimeFactory` type directly (it is constructed after the
/// Manager and hands itself back via `set_runtime_invalidator`).
pub trait RuntimeInvalidator: Send + Sync {
    fn invalidate(&self, uuid: &str);
}

pub struct AccountManager {
    store: Arc<AccountStore>,
    claims: Arc<ClaimsCoordinator>,
    config: Arc<ConfigLoader>,
    host: Arc<dyn HostClient>,
    refresher: Arc<TokenRefresher>,
    cached: RwLock<Vec<ManagedAccount>>,
    active_uuid: RwLock<Option<String>>,
    round_robin_cursor: std::sync::atomic::AtomicUsize,
    runtime_invalidator: OnceCell<Arc<dyn RuntimeInvalidator>>,
    provider_name: &'static str,
}

impl AccountManager {
    pub fn new(
        store: Arc<AccountStore>,
        claims: Arc<ClaimsCoordinator>,
        config: Arc<ConfigLoader>,
        host: Arc<dyn HostClient>,
        refresher: Arc<TokenRefresher>,
        provider_name: &'static str,
    ) -> Self {
        Self {
            store,
            claims,
            config,
            host,
            refresher,
            cached: RwLock::new(Vec::new()),
            active_uuid: RwLock::new(None),
            round_robin_cursor: std::sync::atomic::AtomicUsize::new(0),
            runtime_invalidator: OnceCell::new(),
            provider_name,
        }
    }

    /// Late-bound back-reference so `markRevoked`/`markAuthFailure` can
    /// invalidate the Runtime Factory's cache, without a construction
    /// cycle (the factory is built from an `Arc<AccountManager>`).
    pub fn set_runtime_invalidator(&self, invalidator: Arc<dyn RuntimeInvalidator>) {
        let _ = self.runtime_invalidator.set(invalidator);
    }

    fn invalidate_runtime(&self, uuid: &str) {
        if let Some(invalidator) = self.runtime_invalidator.get() {
            invalidator.invalidate(uuid);
        }
    }

    pub fn config(&self) -> Config {
        self.config.load()
    }

    /// Reload the in-memory projection from disk. Transient `last429`
    /// timestamps are not persisted and are carried forward by uuid.
    /// Expired `rateLimitResetAt` entries are cleared in the projection.
    pub async fn refresh(&self) {
        let doc = self.store.load().await;
        let now = now_ms();

        let mut cached = self.cached.write().await;
        let carried_429: HashMap<String, u64> = cached
            .iter()
            .filter_map(|m| m.last_429_at.map(|t| (m.account.uuid.clone(), t)))
            .collect();

        *cached = doc
            .accounts
            .into_iter()
            .enumerate()
            .map(|(index, mut account)| {
                if let Some(reset) = account.rate_limit_reset_at {
                    if reset <= now {
                        account.rate_limit_reset_at = None;
                    }
                }
                ManagedAccount {
                    last_429_at: carried_429.get(&account.uuid).copied(),
                    account,
                    index,
                }
            })
            .collect();

        *self.active_uuid.write().await = doc.active_account_uuid;
    }

    pub async fn pool_size(&self) -> usize {
        self.cached.read().await.len()
    }

    pub async fn account_snapshot(&self, uuid: &str) -> Option<StoredAccount> {
        self.cached
            .read()
            .await
            .iter()
            .find(|m| m.account.uuid == uuid)
            .map(|m| m.account.clone())
    }

    pub async fn has_any_usable_account(&self) -> bool {
        let config = self.config();
        let now = now_ms();
        self.cached
            .read()
            .await
            .iter()
            .any(|m| m.is_usable(now, config.soft_quota_threshold_percent))
    }

    /// Minimum wait time (ms) until any account becomes usable again, or
    /// 0 if none are rate-limited (distinct from "none exist").
    pub async fn min_wait_time_ms(&self) -> u64 {
        let now = now_ms();
        self.cached
            .read()
            .await
            .iter()
            .filter(|m| m.account.enabled && !m.account.is_auth_disabled)
            .filter_map(|m| m.account.rate_limit_reset_at)
            .filter(|reset| *reset > now)
            .map(|reset| reset - now)
            .min()
            .unwrap_or(0)
    }

    /// Select the account to use for the next request, per the configured
    /// strategy (§4.6). Refreshes the projection first and clears expired
    /// rate limits as a side effect of `refresh()`.
    pub async fn select_account(&self) -> Option<String> {
        self.refresh().await;
        let config = self.config();
        let now = now_ms();

        let strategy_label = match config.account_selection_strategy {
            SelectionStrategy::Sticky => "sticky",
            SelectionStrategy::RoundRobin => "round-robin",
            SelectionStrategy::Hybrid => "hybrid",
        };
        let selected = match config.account_selection_strategy {
            SelectionStrategy::Sticky => self.select_sticky(now, &config).await,
            SelectionStrategy::RoundRobin => self.select_round_robin(now, &config).await,
            SelectionStrategy::Hybrid => self.select_hybrid(now, &config).await,
        };

        metrics::counter!(
            "credential_pool_selections_total",
            "provider" => self.provider_name,
            "strategy" => strategy_label,
            "outcome" => if selected.is_some() { "selected" } else { "exhausted" },
        )
        .increment(1);

        let selected = selected?;
        self.commit_selection(&selected, &config).await;
        Some(selected)
    }

    async fn commit_selection(&self, uuid: &str, config: &Config) {
        *self.active_uuid.write().await = Some(uuid.to_string());
        let _ = self.store.set_active_uuid(Some(uuid.to_string())).await;
        let now = now_ms();
        let uuid_owned = uuid.to_string();
        let _ = self
            .store
            .mutate_account(uuid, move |a| a.last_used = now)
            .await;
        if let Some(m) = self
            .cached
            .write()
            .await
            .iter_mut()
            .find(|m| m.account.uuid == uuid_owned)
        {
            m.account.last_used = now;
        }

        if config.cross_process_claims {
            let claims = self.claims.clone();
            let uuid = uuid.to_string();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = claims.write_claim(&uuid) {
                    warn!(uuid, error = %e, "failed to write claim");
                }
            });
        }
    }

    async fn select_sticky(&self, now: u64, config: &Config) -> Option<String> {
        let active_uuid = self.active_uuid.read().await.clone();
        let cached = self.cached.read().await;
        let claims = self.claims.read_claims();

        if let Some(active) = &active_uuid {
            if let Some(m) = cached.iter().find(|m| &m.account.uuid == active) {
                if m.is_usable(now, config.soft_quota_threshold_percent) {
                    return Some(active.clone());
                }
            }
        }

        if let Some(m) = cached.iter().find(|m| {
            m.is_usable(now, config.soft_quota_threshold_percent)
                && !self.claims.is_claimed_by_other(&claims, &m.account.uuid)
        }) {
            return Some(m.account.uuid.clone());
        }

        if let Some(m) = cached
            .iter()
            .find(|m| m.is_usable(now, config.soft_quota_threshold_percent))
        {
            return Some(m.account.uuid.clone());
        }

        cached
            .iter()
            .find(|m| m.account.enabled && !m.account.is_auth_disabled && !m.account.is_rate_limited(now))
            .map(|m| m.account.uuid.clone())
    }

    async fn select_round_robin(&self, now: u64, config: &Config) -> Option<String> {
        let cached = self.cached.read().await;
        let n = cached.len();
        if n == 0 {
            return None;
        }
        let start = self
            .round_robin_cursor
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            % n;
        let claims = self.claims.read_claims();

        for offset in 0..n {
            let m = &cached[(start + offset) % n];
            if m.is_usable(now, config.soft_quota_threshold_percent)
                && !self.claims.is_claimed_by_other(&claims, &m.account.uuid)
            {
                return Some(m.account.uuid.clone());
            }
        }
        for offset in 0..n {
            let m = &cached[(start + offset) % n];
            if m.is_usable(now, config.soft_quota_threshold_percent) {
                return Some(m.account.uuid.clone());
            }
        }
        cached
            .iter()
            .find(|m| m.account.enabled && !m.account.is_auth_disabled && !m.account.is_rate_limited(now))
            .map(|m| m.account.uuid.clone())
    }

    async fn select_hybrid(&self, now: u64, config: &Config) -> Option<String> {
        let active_uuid = self.active_uuid.read().await.clone();
        let cached = self.cached.read().await;
        let claims = self.claims.read_claims();

        let eligible: Vec<_> = cached
            .iter()
            .filter(|m| m.is_usable(now, config.soft_quota_threshold_percent))
            .collect();

        if eligible.is_empty() {
            return cached
                .iter()
                .find(|m| {
                    m.account.enabled && !m.account.is_auth_disabled && !m.account.is_rate_limited(now)
                })
                .map(|m| m.account.uuid.clone());
        }

        let score = |m: &ManagedAccount, is_active: bool| -> f64 {
            let max_util = m
                .account
                .cached_usage
                .as_ref()
                .and_then(UsageLimits::max_tier_utilization)
                .unwrap_or(65.0);
            let usage_score = (100.0 - max_util).max(0.0) / 100.0 * 450.0;

            let max_failures = config.max_consecutive_auth_failures.max(1) as f64;
            let health_score = ((max_failures - m.account.consecutive_auth_failures as f64)
                / max_failures
                * 250.0)
                .max(0.0);

            let seconds_since_used = now.saturating_sub(m.account.last_used) as f64 / 1000.0;
            let freshness_score = seconds_since_used.min(900.0) / 900.0 * 60.0;

            let stickiness_bonus = if is_active { 120.0 } else { 0.0 };
            let claim_penalty = if self.claims.is_claimed_by_other(&claims, &m.account.uuid) {
                -200.0
            } else {
                0.0
            };

            usage_score + health_score + freshness_score + stickiness_bonus + claim_penalty
        };

        let best = eligible
            .iter()
            .max_by(|a, b| {
                let is_a_active = active_uuid.as_deref() == Some(a.account.uuid.as_str());
                let is_b_active = active_uuid.as_deref() == Some(b.account.uuid.as_str());
                score(a, is_a_active)
                    .partial_cmp(&score(b, is_b_active))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|m| m.account.uuid.clone())?;

        if let Some(active) = &active_uuid {
            if let Some(active_m) = eligible.iter().find(|m| &m.account.uuid == active) {
                let current_score = score(active_m, true);
                let best_without_current = eligible
                    .iter()
                    .filter(|m| &m.account.uuid != active)
                    .map(|m| score(m, false))
                    .fold(f64::NEG_INFINITY, f64::max);

                if best_without_current == f64::NEG_INFINITY || current_score >= best_without_current - 40.0 {
                    return Some(active.clone());
                }
            }
        }

        Some(best)
    }

    pub async fn mark_success(&self, uuid: &str) {
        let now = now_ms();
        let _ = self
            .store
            .mutate_account(uuid, move |a| {
                a.rate_limit_reset_at = None;
                a.consecutive_auth_failures = 0;
                a.last_used = now;
            })
            .await;
        let mut cached = self.cached.write().await;
        if let Some(m) = cached.iter_mut().find(|m| m.account.uuid == uuid) {
            m.last_429_at = None;
            m.account.rate_limit_reset_at = None;
            m.account.consecutive_auth_failures = 0;
            m.account.last_used = now;
        }
    }

    pub async fn mark_rate_limited(&self, uuid: &str, ms: Option<u64>) {
        let config = self.config();
        let delay = ms.unwrap_or(config.rate_limit_min_backoff_ms);
        let now = now_ms();
        let reset_at = now + delay;
        let _ = self
            .store
            .mutate_account(uuid, move |a| a.rate_limit_reset_at = Some(reset_at))
            .await;
        let mut cached = self.cached.write().await;
        if let Some(m) = cached.iter_mut().find(|m| m.account.uuid == uuid) {
            m.last_429_at = Some(now);
            m.account.rate_limit_reset_at = Some(reset_at);
        }
        drop(cached);

        metrics::counter!(
            "credential_pool_rate_limit_events_total",
            "provider" => self.provider_name,
        )
        .increment(1);
    }

    pub async fn mark_revoked(&self, uuid: &str) {
        let _ = self
            .store
            .mutate_account(uuid, |a| {
                a.is_auth_disabled = true;
                a.auth_disabled_reason = Some("OAuth token revoked (403)".to_string());
                a.access_token = None;
                a.expires_at = None;
            })
            .await;
        self.invalidate_runtime(uuid);
        self.refresh().await;
    }

    /// `permanent` disables unconditionally; otherwise increments the
    /// failure counter and only disables once `max_consecutive_auth_failures`
    /// is reached *and* at least one other account remains usable
    /// (invariant #6 — the last survivor is never auto-disabled for
    /// transient failures).
    pub async fn mark_auth_failure(&self, uuid: &str, permanent: bool) {
        if permanent {
            let _ = self
                .store
                .mutate_account(uuid, |a| {
                    a.is_auth_disabled = true;
                    a.auth_disabled_reason =
                        Some("Token permanently rejected (400/401/403)".to_string());
                })
                .await;
            self.invalidate_runtime(uuid);
            self.refresh().await;
            return;
        }

        let config = self.config();
        let threshold = config.max_consecutive_auth_failures;
        let other_usable = {
            let now = now_ms();
            self.cached
                .read()
                .await
                .iter()
                .any(|m| m.account.uuid != uuid && m.is_usable(now, config.soft_quota_threshold_percent))
        };

        let result = self
            .store
            .mutate_account(uuid, move |a| {
                a.consecutive_auth_failures += 1;
                if a.consecutive_auth_failures >= threshold && other_usable {
                    a.is_auth_disabled = true;
                    a.auth_disabled_reason =
                        Some(format!("{} consecutive auth failures", a.consecutive_auth_failures));
                }
            })
            .await;

        if let Ok(Some(account)) = result {
            if account.is_auth_disabled {
                self.invalidate_runtime(uuid);
            }
        }
        self.refresh().await;
    }

    pub async fn apply_usage_cache(&self, uuid: &str, usage: UsageLimits) {
        let now = now_ms();
        let reset_at = usage.earliest_exhausted_reset_ms();
        let usage_clone = usage.clone();
        let _ = self
            .store
            .mutate_account(uuid, move |a| {
                a.cached_usage = Some(usage_clone);
                a.cached_usage_at = Some(now);
                a.rate_limit_reset_at = reset_at;
            })
            .await;
        self.refresh().await;
    }

    /// Ensure `uuid`'s token is valid, refreshing if expired. On success,
    /// if this is the active account, syncs credentials to the host.
    pub async fn ensure_valid_token(&self, uuid: &str) -> Result<(String, u64), RefreshOutcome> {
        let now = now_ms();
        let Some(account) = self.account_snapshot(uuid).await else {
            return Err(RefreshOutcome::Err {
                permanent: true,
                status: None,
            });
        };

        if !account.is_token_expired(now) {
            return Ok((account.access_token.unwrap(), account.expires_at.unwrap()));
        }

        match self.refresher.refresh(uuid, &account.refresh_token).await {
            RefreshOutcome::Ok(patch) => {
                let uuid_owned = uuid.to_string();
                let patch_clone = patch.clone();
                let _ = self
                    .store
                    .mutate_account(&uuid_owned, move |a| {
                        a.access_token = Some(patch_clone.access_token.clone());
                        a.expires_at = Some(patch_clone.expires_at);
                        if let Some(rt) = &patch_clone.refresh_token {
                            a.refresh_token = rt.clone();
                        }
                        if let Some(account_id) = &patch_clone.account_id {
                            a.account_id = Some(account_id.clone());
                        }
                        if let Some(email) = &patch_clone.email {
                            a.email = Some(email.clone());
                        }
                        a.consecutive_auth_failures = 0;
                    })
                    .await;
                self.refresh().await;

                let is_active = self.active_uuid.read().await.as_deref() == Some(uuid);
                if is_active {
                    self.host.auth_set(
                        uuid,
                        crate::collab::HostCredentials {
                            refresh_token: patch.refresh_token.clone().unwrap_or(account.refresh_token),
                            access_token: patch.access_token.clone(),
                            expires_at: patch.expires_at,
                        },
                    );
                }
                Ok((patch.access_token, patch.expires_at))
            }
            Err(outcome) => Err(outcome),
        }
    }

    /// Startup sweep: refresh expired tokens for enabled, non-active,
    /// non-disabled accounts, in parallel batches of 3 (§4.6).
    pub async fn validate_non_active_tokens(&self) {
        self.refresh().await;
        let now = now_ms();
        let active = self.active_uuid.read().await.clone();

        let candidates: Vec<String> = self
            .cached
            .read()
            .await
            .iter()
            .filter(|m| {
                m.account.enabled
                    && !m.account.is_auth_disabled
                    && Some(m.account.uuid.as_str()) != active.as_deref()
                    && m.account.is_token_expired(now)
            })
            .map(|m| m.account.uuid.clone())
            .collect();

        for batch in candidates.chunks(3) {
            let mut handles = Vec::new();
            for uuid in batch {
                let uuid = uuid.clone();
                handles.push(async move {
                    match self.ensure_valid_token(&uuid).await {
                        Ok(_) => {}
                        Err(RefreshOutcome::Err { permanent, .. }) => {
                            self.mark_auth_failure(&uuid, permanent).await;
                        }
                    }
                });
            }
            futures_join_all(handles).await;
        }
    }
}

/// Minimal join-all without pulling in the `futures` crate: await each
/// boxed future concurrently via `tokio::join!`-style fan-out.
async fn futures_join_all<F: std::future::Future<Output = ()>>(futures: Vec<F>) {
    let handles: Vec<_> = futures.into_iter().collect();
    let mut pinned: Vec<_> = handles.into_iter().map(Box::pin).collect();
    for fut in pinned.iter_mut() {
        fut.as_mut().await;
    }
}
