//! Runtime Factory: a per-`uuid` cached "request issuer" wrapping fresh-
//! token acquisition around a provider-specific transport (§4.7).
//!
//! Construction is cheap and side-effect free (no I/O happens until
//! `Runtime::fetch` is called), so concurrent `get_runtime` calls for the
//! same uuid are deduplicated with a simple double-checked insert rather
//! than a full async init-promise — there is nothing expensive to join on
//! before the first request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::collab::{RefreshOutcome, RequestTransport};
use crate::error::{Error, Result};
use crate::manager::{AccountManager, RuntimeInvalidator};

pub struct Runtime {
    uuid: String,
    manager: Arc<AccountManager>,
    transport: Arc<dyn RequestTransport>,
}

impl Runtime {
    /// Ensures a fresh token, applies the provider's transforms, and
    /// delegates to the transport.
    pub async fn fetch(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        let (access_token, _) = self
            .manager
            .ensure_valid_token(&self.uuid)
            .await
            .map_err(|outcome| Error::RefreshFailed(refresh_outcome_label(&outcome)))?;

        self.transport
            .send(&access_token, request)
            .await
            .map_err(|e| Error::TransportFailed(e.to_string()))
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

fn refresh_outcome_label(outcome: &RefreshOutcome) -> String {
    match outcome {
        RefreshOutcome::Err {
            status: Some(status),
            ..
        } => status.to_string(),
        RefreshOutcome::Err { status: None, .. } => "transport error".to_string(),
        RefreshOutcome::Ok(_) => unreachable!("ensure_valid_token only errors on RefreshOutcome::Err"),
    }
}

pub struct RuntimeFactory {
    manager: Arc<AccountManager>,
    transport: Arc<dyn RequestTransport>,
    cache: Mutex<HashMap<String, Arc<Runtime>>>,
}

impl RuntimeFactory {
    pub fn new(manager: Arc<AccountManager>, transport: Arc<dyn RequestTransport>) -> Self {
        Self {
            manager,
            transport,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_runtime(&self, uuid: &str) -> Arc<Runtime> {
        if let Some(runtime) = self.cache.lock().unwrap().get(uuid) {
            return runtime.clone();
        }

        let runtime = Arc::new(Runtime {
            uuid: uuid.to_string(),
            manager: self.manager.clone(),
            transport: self.transport.clone(),
        });

        self.cache
            .lock()
            .unwrap()
            .entry(uuid.to_string())
            .or_insert(runtime)
            .clone()
    }

    pub fn invalidate(&self, uuid: &str) {
        self.cache.lock().unwrap().remove(uuid);
    }

    pub fn invalidate_all(&self) {
        self.cache.lock().unwrap().clear();
    }
}

impl RuntimeInvalidator for RuntimeFactory {
    fn invalidate(&self, uuid: &str) {
        RuntimeFactory::invalidate(self, uuid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::ClaimsCoordinator;
    use crate::collab::{NullHostClient, RefreshPatch, Refresher};
    use crate::config::ConfigLoader;
    use crate::model::{now_ms, StoredAccount};
    use crate::refresher::TokenRefresher;
    use crate::store::AccountStore;
    use std::future::Future;
    use std::pin::Pin;

    struct AlwaysOkRefresher;
    impl Refresher for AlwaysOkRefresher {
        fn refresh<'a>(
            &'a self,
            _refresh_token: &'a str,
        ) -> Pin<Box<dyn Future<Output = RefreshOutcome> + Send + 'a>> {
            Box::pin(async move {
                RefreshOutcome::Ok(RefreshPatch {
                    access_token: "at".into(),
                    expires_at: now_ms() + 3_600_000,
                    ..Default::default()
                })
            })
        }
    }

    struct EchoTransport;
    impl RequestTransport for EchoTransport {
        fn send<'a>(
            &'a self,
            _access_token: &'a str,
            _request: reqwest::Request,
        ) -> Pin<Box<dyn Future<Output = std::result::Result<reqwest::Response, reqwest::Error>> + Send + 'a>>
        {
            Box::pin(async move {
                reqwest::get("http://127.0.0.1:0/unreachable").await
            })
        }
    }

    fn build_manager(dir: &tempfile::TempDir) -> Arc<AccountManager> {
        Arc::new(AccountManager::new(
            Arc::new(AccountStore::new(dir.path().join("accounts.json"))),
            Arc::new(ClaimsCoordinator::new(dir.path().join("claims.json"))),
            Arc::new(ConfigLoader::new(dir.path().join("config.json"))),
            Arc::new(NullHostClient),
            Arc::new(TokenRefresher::new(Arc::new(AlwaysOkRefresher), "Test")),
            "Test",
        ))
    }

    #[test]
    fn get_runtime_caches_same_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let manager = build_manager(&dir);
        let factory = RuntimeFactory::new(manager, Arc::new(EchoTransport));

        let a = factory.get_runtime("u1");
        let b = factory.get_runtime("u1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn invalidate_drops_cached_entry() {
        let dir = tempfile::tempdir().unwrap();
        let manager = build_manager(&dir);
        let factory = RuntimeFactory::new(manager, Arc::new(EchoTransport));

        let a = factory.get_runtime("u1");
        factory.invalidate("u1");
        let b = factory.get_runtime("u1");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn invalidate_all_clears_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let manager = build_manager(&dir);
        let factory = RuntimeFactory::new(manager, Arc::new(EchoTransport));

        factory.get_runtime("u1");
        factory.get_runtime("u2");
        factory.invalidate_all();
        assert!(factory.cache.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_refreshes_expired_token_before_sending() {
        let dir = tempfile::tempdir().unwrap();
        let manager = build_manager(&dir);
        let store = AccountStore::new(dir.path().join("accounts.json"));
        store
            .add_account(StoredAccount::new("u1".into(), "rt".into()))
            .await
            .unwrap();

        let factory = RuntimeFactory::new(manager.clone(), Arc::new(EchoTransport));
        let runtime = factory.get_runtime("u1");
        let request = reqwest::Client::new()
            .get("http://127.0.0.1:0/unreachable")
            .build()
            .unwrap();

        // The transport itself fails (nothing listening), but this proves
        // ensure_valid_token ran and populated the access token first.
        let _ = runtime.fetch(request).await;
        let account = manager.account_snapshot("u1").await.unwrap();
        assert_eq!(account.access_token.as_deref(), Some("at"));
    }
}
