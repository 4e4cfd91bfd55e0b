//! Account Store: the single choke point for mutating the accounts file.
//!
//! All writes are serialized through the file lock (`crate::lock`);
//! `load`/`readCredentials` are lock-free reads of the last committed
//! (post-rename) state.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::codec::{load_accounts, write_storage};
use crate::error::Result;
use crate::lock;
use crate::model::{now_ms, AccountStorage, StoredAccount};

/// Credentials as read without taking the file lock.
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub refresh_token: String,
    pub access_token: Option<String>,
    pub expires_at: Option<u64>,
    pub account_id: Option<String>,
}

pub struct AccountStore {
    path: PathBuf,
}

impl AccountStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the current document; a missing or corrupt file yields an empty
    /// one rather than an error.
    pub async fn load(&self) -> AccountStorage {
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || load_accounts(&path)).await;
        match result {
            Ok(Ok(Some(doc))) => doc,
            Ok(Ok(None)) => AccountStorage::default(),
            Ok(Err(e)) => {
                warn!(error = %e, "failed to load accounts, treating as empty");
                AccountStorage::default()
            }
            Err(e) => {
                warn!(error = %e, "load_accounts task panicked, treating as empty");
                AccountStorage::default()
            }
        }
    }

    /// Lock-free credential read for a single `uuid`.
    pub async fn read_credentials(&self, uuid: &str) -> Option<Credentials> {
        let doc = self.load().await;
        doc.accounts
            .into_iter()
            .find(|a| a.uuid == uuid)
            .map(|a| Credentials {
                refresh_token: a.refresh_token,
                access_token: a.access_token,
                expires_at: a.expires_at,
                account_id: a.account_id,
            })
    }

    /// Lock, read, locate the row, apply `f` in place, write, release.
    /// Returns the post-mutation row, or `None` if no row matched.
    pub async fn mutate_account<F>(&self, uuid: &str, f: F) -> Result<Option<StoredAccount>>
    where
        F: FnOnce(&mut StoredAccount) + Send + 'static,
    {
        let uuid = uuid.to_string();
        self.mutate_storage(move |doc| {
            if let Some(account) = doc.accounts.iter_mut().find(|a| a.uuid == uuid) {
                f(account);
            }
        })
        .await?;

        Ok(self
            .load()
            .await
            .accounts
            .into_iter()
            .find(|a| a.uuid == uuid))
    }

    /// Lock, read (or default on missing/corrupt), apply `f`, write, release.
    pub async fn mutate_storage<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AccountStorage) + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let _guard = lock::acquire(&path)?;
            let mut doc = load_accounts(&path)?.unwrap_or_default();
            f(&mut doc);
            write_storage(&path, &doc)?;
            Ok(())
        })
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))??;
        Ok(())
    }

    /// No-ops when `uuid` or `refreshToken` matches an existing row
    /// (invariant #2).
    pub async fn add_account(&self, account: StoredAccount) -> Result<()> {
        self.mutate_storage(move |doc| {
            let duplicate = doc
                .accounts
                .iter()
                .any(|a| a.uuid == account.uuid || a.refresh_token == account.refresh_token);
            if !duplicate {
                doc.accounts.push(account);
            }
        })
        .await
    }

    /// Falls `activeAccountUuid` back to the first remaining row if the
    /// removed row was active.
    pub async fn remove_account(&self, uuid: &str) -> Result<()> {
        let uuid = uuid.to_string();
        self.mutate_storage(move |doc| {
            doc.accounts.retain(|a| a.uuid != uuid);
            if doc.active_account_uuid.as_deref() == Some(uuid.as_str()) {
                doc.active_account_uuid = doc.accounts.first().map(|a| a.uuid.clone());
            }
        })
        .await
    }

    pub async fn set_active_uuid(&self, uuid: Option<String>) -> Result<()> {
        self.mutate_storage(move |doc| {
            doc.active_account_uuid = uuid;
        })
        .await
    }

    pub async fn clear(&self) -> Result<()> {
        self.mutate_storage(|doc| {
            doc.accounts.clear();
            doc.active_account_uuid = None;
        })
        .await
    }
}

pub fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn account_seed_timestamps() -> u64 {
    now_ms()
}
