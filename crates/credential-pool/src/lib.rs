//! Multi-account OAuth credential pool engine: selection, rotation,
//! cross-process coordination, and proactive refresh for a pool of
//! provider accounts sharing one on-disk state directory.
//!
//! Construct one [`Engine`] per provider via [`Engine::start`]; it wires
//! together the Account Store, Account Manager, Runtime Factory, Rate-Limit
//! Handler, Proactive Refresh Queue, and Executor, running Auth Migration
//! and the startup token-validation sweep before returning.

pub mod claims;
pub mod codec;
pub mod collab;
pub mod config;
pub mod error;
pub mod executor;
pub mod lock;
pub mod manager;
pub mod migration;
pub mod model;
pub mod paths;
pub mod proactive;
pub mod ratelimit;
pub mod refresher;
pub mod runtime;
pub mod store;

use std::sync::Arc;

pub use collab::{HostClient, HostCredentials, NullHostClient, RefreshOutcome, RefreshPatch, Refresher, RequestTransport, ToastVariant, UsageFetcher};
pub use config::{Config, ConfigLoader, SelectionStrategy};
pub use error::{Error, Result};
pub use executor::Executor;
pub use manager::AccountManager;
pub use model::{StoredAccount, UsageLimits};
pub use paths::{EnginePaths, Provider};
pub use proactive::ProactiveRefreshQueue;
pub use ratelimit::RateLimitHandler;
pub use runtime::RuntimeFactory;
pub use store::AccountStore;

use claims::ClaimsCoordinator;
use refresher::TokenRefresher;

/// A fully wired credential pool for one provider. Holds every long-lived
/// component so dropping it tears the proactive queue down with it (callers
/// that need orderly shutdown should call [`Engine::shutdown`] instead).
pub struct Engine {
    pub manager: Arc<AccountManager>,
    pub runtime_factory: Arc<RuntimeFactory>,
    pub executor: Executor,
    pub proactive: Arc<ProactiveRefreshQueue>,
    store: Arc<AccountStore>,
    config: Arc<ConfigLoader>,
    provider_name: &'static str,
}

impl Engine {
    /// Resolves on-disk paths for `provider`, runs Auth Migration if
    /// storage is empty, validates non-active tokens, and starts the
    /// Proactive Refresh Queue.
    pub async fn start(
        provider: Provider,
        refresher: Arc<dyn Refresher>,
        usage_fetcher: Arc<dyn UsageFetcher>,
        transport: Arc<dyn RequestTransport>,
        host: Arc<dyn HostClient>,
    ) -> Arc<Self> {
        let paths = EnginePaths::resolve(provider);

        let store = Arc::new(AccountStore::new(paths.accounts_file));
        let claims = Arc::new(ClaimsCoordinator::new(paths.claims_file));
        let config = Arc::new(ConfigLoader::new(paths.config_file));
        let token_refresher = Arc::new(TokenRefresher::new(refresher, provider.name()));

        migration::migrate_if_empty(&store, &paths.legacy_auth_file, provider.legacy_auth_key()).await;

        let manager = Arc::new(AccountManager::new(
            store.clone(),
            claims,
            config.clone(),
            host.clone(),
            token_refresher.clone(),
            provider.name(),
        ));
        manager.refresh().await;
        manager.validate_non_active_tokens().await;

        let runtime_factory = Arc::new(RuntimeFactory::new(manager.clone(), transport));
        manager.set_runtime_invalidator(runtime_factory.clone());

        let rate_limit_handler = Arc::new(RateLimitHandler::new(usage_fetcher, host.clone()));
        let executor = Executor::new(
            manager.clone(),
            runtime_factory.clone(),
            rate_limit_handler,
            host,
            provider.name(),
        );

        let proactive = Arc::new(ProactiveRefreshQueue::new(store.clone(), config.clone(), token_refresher));
        proactive.start().await;

        Arc::new(Self {
            manager,
            runtime_factory,
            executor,
            proactive,
            store,
            config,
            provider_name: provider.name(),
        })
    }

    /// Drives one logical request to completion, rotating accounts and
    /// refreshing tokens per the Executor's retry policy.
    pub async fn execute(
        &self,
        build_request: impl Fn() -> reqwest::Request,
    ) -> Result<reqwest::Response> {
        self.executor.execute(build_request).await
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider_name
    }

    /// Stops the Proactive Refresh Queue, waiting for any in-flight check
    /// to settle.
    pub async fn shutdown(&self) {
        self.proactive.stop().await;
    }

    /// Every account currently on disk, refreshed from storage first so
    /// admin listings never show a stale in-memory projection.
    pub async fn list_accounts(&self) -> Vec<StoredAccount> {
        self.manager.refresh().await;
        self.store.load().await.accounts
    }

    /// Adds a new account (no-op on a duplicate uuid/refresh token per
    /// invariant #2) and makes it the active account if none is set yet.
    pub async fn add_account(&self, account: StoredAccount) -> Result<()> {
        let uuid = account.uuid.clone();
        self.store.add_account(account).await?;
        let doc = self.store.load().await;
        if doc.active_account_uuid.is_none() {
            self.store.set_active_uuid(Some(uuid)).await?;
        }
        self.manager.refresh().await;
        Ok(())
    }

    /// Removes an account from storage and drops its cached runtime.
    pub async fn remove_account(&self, uuid: &str) -> Result<()> {
        self.store.remove_account(uuid).await?;
        self.runtime_factory.invalidate(uuid);
        self.manager.refresh().await;
        Ok(())
    }

    pub fn config_snapshot(&self) -> Config {
        self.config.load()
    }

    pub fn update_config_field(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.config.update_field(key, value)
    }

    pub async fn active_uuid(&self) -> Option<String> {
        self.store.load().await.active_account_uuid
    }
}
