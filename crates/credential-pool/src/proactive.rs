//! Proactive Refresh Queue: a single self-rescheduling background task that
//! refreshes tokens nearing expiry before a caller ever hits a 401 (§4.9).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::collab::RefreshOutcome;
use crate::config::ConfigLoader;
use crate::model::now_ms;
use crate::refresher::TokenRefresher;
use crate::store::AccountStore;

const INITIAL_DELAY_MS: u64 = 5_000;

pub struct ProactiveRefreshQueue {
    store: Arc<AccountStore>,
    config: Arc<ConfigLoader>,
    refresher: Arc<TokenRefresher>,
    run_token: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProactiveRefreshQueue {
    pub fn new(
        store: Arc<AccountStore>,
        config: Arc<ConfigLoader>,
        refresher: Arc<TokenRefresher>,
    ) -> Self {
        Self {
            store,
            config,
            refresher,
            run_token: Arc::new(AtomicU64::new(0)),
            handle: Mutex::new(None),
        }
    }

    /// Schedules the first check after a 5s delay. A no-op if
    /// `proactive_refresh` is disabled, or if already running.
    pub async fn start(self: &Arc<Self>) {
        if !self.config.load().proactive_refresh {
            return;
        }

        let mut handle_slot = self.handle.lock().await;
        if handle_slot.is_some() {
            return;
        }

        let token = self.run_token.fetch_add(1, Ordering::SeqCst) + 1;
        let this = self.clone();
        *handle_slot = Some(tokio::spawn(async move {
            this.run_loop(token).await;
        }));
    }

    /// Cancels the pending timer and awaits any in-flight check before
    /// returning, so observers see final state.
    pub async fn stop(self: &Arc<Self>) {
        self.run_token.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn run_loop(self: Arc<Self>, token: u64) {
        tokio::time::sleep(std::time::Duration::from_millis(INITIAL_DELAY_MS)).await;

        loop {
            if self.run_token.load(Ordering::SeqCst) != token {
                return;
            }

            self.run_check(token).await;

            if self.run_token.load(Ordering::SeqCst) != token {
                return;
            }

            let interval_ms = self.config.load().proactive_refresh_interval_seconds * 1000;
            tokio::time::sleep(std::time::Duration::from_millis(interval_ms)).await;
        }
    }

    async fn run_check(&self, token: u64) {
        let config = self.config.load();
        let buffer_ms = config.proactive_refresh_buffer_seconds * 1000;
        let now = now_ms();

        let doc = self.store.load().await;
        let candidates: Vec<String> = doc
            .accounts
            .iter()
            .filter(|a| needs_proactive_refresh(a, now, buffer_ms))
            .map(|a| a.uuid.clone())
            .collect();

        for uuid in candidates {
            if self.run_token.load(Ordering::SeqCst) != token {
                return;
            }

            let Some(credentials) = self.store.read_credentials(&uuid).await else {
                continue;
            };
            if !still_needs_refresh(&credentials, now, buffer_ms) {
                continue;
            }

            match self.refresher.refresh(&uuid, &credentials.refresh_token).await {
                RefreshOutcome::Ok(patch) => {
                    let uuid_owned = uuid.clone();
                    let patch_clone = patch.clone();
                    let _ = self
                        .store
                        .mutate_account(&uuid_owned, move |a| {
                            a.access_token = Some(patch_clone.access_token.clone());
                            a.expires_at = Some(patch_clone.expires_at);
                            if let Some(rt) = &patch_clone.refresh_token {
                                a.refresh_token = rt.clone();
                            }
                            a.consecutive_auth_failures = 0;
                        })
                        .await;
                    debug!(uuid, "proactive refresh succeeded");
                }
                RefreshOutcome::Err { permanent, .. } => {
                    self.apply_auth_failure(&uuid, permanent).await;
                    warn!(uuid, permanent, "proactive refresh failed");
                }
            }
        }
    }

    /// Same threshold/other-usable accounting as `AccountManager::mark_auth_failure`
    /// (§4.9: "the same auth-failure accounting as the Manager — with distinct
    /// reason strings"), duplicated here rather than delegated since this queue
    /// only holds the store/config, not the Manager's in-memory projection.
    async fn apply_auth_failure(&self, uuid: &str, permanent: bool) {
        if permanent {
            let _ = self
                .store
                .mutate_account(uuid, |a| {
                    a.is_auth_disabled = true;
                    a.auth_disabled_reason =
                        Some("Token permanently rejected (proactive refresh)".to_string());
                })
                .await;
            return;
        }

        let config = self.config.load();
        let threshold = config.max_consecutive_auth_failures;
        let now = now_ms();
        let doc = self.store.load().await;
        let other_usable = doc
            .accounts
            .iter()
            .any(|a| a.uuid != uuid && a.enabled && !a.is_auth_disabled && !a.is_rate_limited(now));

        let _ = self
            .store
            .mutate_account(uuid, move |a| {
                a.consecutive_auth_failures += 1;
                if a.consecutive_auth_failures >= threshold && other_usable {
                    a.is_auth_disabled = true;
                    a.auth_disabled_reason = Some(format!(
                        "{} consecutive auth failures (proactive refresh)",
                        a.consecutive_auth_failures
                    ));
                }
            })
            .await;
    }
}

fn needs_proactive_refresh(account: &crate::model::StoredAccount, now: u64, buffer_ms: u64) -> bool {
    if account.is_auth_disabled || !account.enabled {
        return false;
    }
    match (&account.access_token, account.expires_at) {
        (Some(_), Some(expires_at)) => expires_at > now && expires_at <= now + buffer_ms,
        _ => false,
    }
}

fn still_needs_refresh(credentials: &crate::store::Credentials, now: u64, buffer_ms: u64) -> bool {
    match (&credentials.access_token, credentials.expires_at) {
        (Some(_), Some(expires_at)) => expires_at > now && expires_at <= now + buffer_ms,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{RefreshPatch, Refresher};
    use crate::model::StoredAccount;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;

    struct CountingRefresher {
        calls: AtomicUsize,
    }

    impl Refresher for CountingRefresher {
        fn refresh<'a>(
            &'a self,
            _refresh_token: &'a str,
        ) -> Pin<Box<dyn Future<Output = RefreshOutcome> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                RefreshOutcome::Ok(RefreshPatch {
                    access_token: "fresh-at".into(),
                    expires_at: now_ms() + 3_600_000,
                    ..Default::default()
                })
            })
        }
    }

    #[test]
    fn needs_proactive_refresh_skips_disabled_accounts() {
        let mut account = StoredAccount::new("u1".into(), "rt".into());
        account.access_token = Some("at".into());
        account.expires_at = Some(now_ms() + 10_000);
        account.is_auth_disabled = true;
        assert!(!needs_proactive_refresh(&account, now_ms(), 1_800_000));
    }

    #[test]
    fn needs_proactive_refresh_true_within_buffer() {
        let mut account = StoredAccount::new("u1".into(), "rt".into());
        account.access_token = Some("at".into());
        account.expires_at = Some(now_ms() + 10_000);
        assert!(needs_proactive_refresh(&account, now_ms(), 1_800_000));
    }

    #[test]
    fn needs_proactive_refresh_false_when_far_from_expiry() {
        let mut account = StoredAccount::new("u1".into(), "rt".into());
        account.access_token = Some("at".into());
        account.expires_at = Some(now_ms() + 10_000_000);
        assert!(!needs_proactive_refresh(&account, now_ms(), 1_800_000));
    }

    #[tokio::test(start_paused = true)]
    async fn s5_refreshes_once_after_initial_delay() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AccountStore::new(dir.path().join("accounts.json")));
        let config = Arc::new(ConfigLoader::new(dir.path().join("config.json")));
        config
            .update_field("proactive_refresh_buffer_seconds", serde_json::json!(300))
            .unwrap();

        let mut account = StoredAccount::new("u1".into(), "rt".into());
        account.access_token = Some("old-at".into());
        account.expires_at = Some(now_ms() + 120_000);
        store.add_account(account).await.unwrap();

        let refresher = Arc::new(TokenRefresher::new(Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
        }), "Test"));
        let queue = Arc::new(ProactiveRefreshQueue::new(
            store.clone(),
            config,
            refresher,
        ));

        queue.start().await;
        tokio::time::sleep(std::time::Duration::from_millis(INITIAL_DELAY_MS + 50)).await;
        queue.stop().await;

        let doc = store.load().await;
        let account = &doc.accounts[0];
        assert_eq!(account.access_token.as_deref(), Some("fresh-at"));
        assert_eq!(account.consecutive_auth_failures, 0);
    }

    #[tokio::test]
    async fn apply_auth_failure_disables_after_threshold_when_other_usable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AccountStore::new(dir.path().join("accounts.json")));
        let config = Arc::new(ConfigLoader::new(dir.path().join("config.json")));
        let refresher = Arc::new(TokenRefresher::new(
            Arc::new(CountingRefresher { calls: AtomicUsize::new(0) }),
            "Test",
        ));
        let queue = ProactiveRefreshQueue::new(store.clone(), config.clone(), refresher);

        store.add_account(StoredAccount::new("a".into(), "rt-a".into())).await.unwrap();
        store.add_account(StoredAccount::new("b".into(), "rt-b".into())).await.unwrap();

        let threshold = config.load().max_consecutive_auth_failures;
        for _ in 0..threshold {
            queue.apply_auth_failure("a", false).await;
        }

        let doc = store.load().await;
        let a = doc.accounts.iter().find(|acc| acc.uuid == "a").unwrap();
        assert!(a.is_auth_disabled);
        assert!(a.auth_disabled_reason.as_deref().unwrap().contains("proactive refresh"));
    }

    #[tokio::test]
    async fn apply_auth_failure_never_disables_the_last_usable_account() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AccountStore::new(dir.path().join("accounts.json")));
        let config = Arc::new(ConfigLoader::new(dir.path().join("config.json")));
        let refresher = Arc::new(TokenRefresher::new(
            Arc::new(CountingRefresher { calls: AtomicUsize::new(0) }),
            "Test",
        ));
        let queue = ProactiveRefreshQueue::new(store.clone(), config.clone(), refresher);

        store.add_account(StoredAccount::new("solo".into(), "rt".into())).await.unwrap();

        for _ in 0..10 {
            queue.apply_auth_failure("solo", false).await;
        }

        let doc = store.load().await;
        let solo = doc.accounts.iter().find(|acc| acc.uuid == "solo").unwrap();
        assert!(!solo.is_auth_disabled);
    }

    #[tokio::test]
    async fn start_is_noop_when_proactive_refresh_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AccountStore::new(dir.path().join("accounts.json")));
        let config = Arc::new(ConfigLoader::new(dir.path().join("config.json")));
        config
            .update_field("proactive_refresh", serde_json::json!(false))
            .unwrap();
        let refresher = Arc::new(TokenRefresher::new(Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
        }), "Test"));
        let queue = Arc::new(ProactiveRefreshQueue::new(store, config, refresher));

        queue.start().await;
        assert!(queue.handle.lock().await.is_none());
    }
}
