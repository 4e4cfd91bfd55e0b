//! Auth Migration: one-shot import of a legacy single-credential `auth.json`
//! when storage is empty, run once on Manager initialization (§4.10).

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::model::StoredAccount;
use crate::store::{new_uuid, AccountStore};

#[derive(Debug, Deserialize)]
struct LegacyEntry {
    #[serde(rename = "type")]
    kind: String,
    refresh: String,
    #[serde(default)]
    access: Option<String>,
    #[serde(default)]
    expires: Option<u64>,
}

/// Reads `auth_json_path`, looking for `{<provider>: {type:"oauth",
/// refresh:<non-empty>, ...}}`, and inserts it as the active account if
/// `store` currently has zero accounts. Any failure (missing file, bad
/// JSON, missing provider key, empty refresh token) is swallowed.
pub async fn migrate_if_empty(store: &AccountStore, auth_json_path: &Path, provider_key: &str) {
    let doc = store.load().await;
    if !doc.accounts.is_empty() {
        return;
    }

    let Some(entry) = read_legacy_entry(auth_json_path, provider_key) else {
        return;
    };
    if entry.kind != "oauth" || entry.refresh.is_empty() {
        return;
    }

    let uuid = new_uuid();
    let mut account = StoredAccount::new(uuid.clone(), entry.refresh);
    account.access_token = entry.access;
    account.expires_at = entry.expires;

    if store.add_account(account).await.is_ok() {
        let _ = store.set_active_uuid(Some(uuid)).await;
        debug!(provider_key, "migrated legacy auth.json into account storage");
    }
}

fn read_legacy_entry(path: &Path, provider_key: &str) -> Option<LegacyEntry> {
    let bytes = std::fs::read(path).ok()?;
    let mut root: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&bytes).ok()?;
    let value = root.remove(provider_key)?;
    serde_json::from_value(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrates_legacy_entry_when_storage_empty() {
        let dir = tempfile::tempdir().unwrap();
        let auth_path = dir.path().join("auth.json");
        std::fs::write(
            &auth_path,
            r#"{"anthropic": {"type":"oauth","refresh":"legacy-rt","access":"legacy-at","expires":1999999999000}}"#,
        )
        .unwrap();
        let store = AccountStore::new(dir.path().join("accounts.json"));

        migrate_if_empty(&store, &auth_path, "anthropic").await;

        let doc = store.load().await;
        assert_eq!(doc.accounts.len(), 1);
        assert_eq!(doc.accounts[0].refresh_token, "legacy-rt");
        assert_eq!(doc.active_account_uuid.as_deref(), Some(doc.accounts[0].uuid.as_str()));
    }

    #[tokio::test]
    async fn skips_migration_when_storage_already_has_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let auth_path = dir.path().join("auth.json");
        std::fs::write(
            &auth_path,
            r#"{"anthropic": {"type":"oauth","refresh":"legacy-rt"}}"#,
        )
        .unwrap();
        let store = AccountStore::new(dir.path().join("accounts.json"));
        store
            .add_account(StoredAccount::new("existing".into(), "rt".into()))
            .await
            .unwrap();

        migrate_if_empty(&store, &auth_path, "anthropic").await;

        let doc = store.load().await;
        assert_eq!(doc.accounts.len(), 1);
        assert_eq!(doc.accounts[0].uuid, "existing");
    }

    #[tokio::test]
    async fn missing_auth_file_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("accounts.json"));

        migrate_if_empty(&store, &dir.path().join("nonexistent.json"), "anthropic").await;

        let doc = store.load().await;
        assert!(doc.accounts.is_empty());
    }

    #[tokio::test]
    async fn empty_refresh_token_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let auth_path = dir.path().join("auth.json");
        std::fs::write(&auth_path, r#"{"anthropic": {"type":"oauth","refresh":""}}"#).unwrap();
        let store = AccountStore::new(dir.path().join("accounts.json"));

        migrate_if_empty(&store, &auth_path, "anthropic").await;

        let doc = store.load().await;
        assert!(doc.accounts.is_empty());
    }

    #[tokio::test]
    async fn wrong_provider_key_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let auth_path = dir.path().join("auth.json");
        std::fs::write(&auth_path, r#"{"openai": {"type":"oauth","refresh":"rt"}}"#).unwrap();
        let store = AccountStore::new(dir.path().join("accounts.json"));

        migrate_if_empty(&store, &auth_path, "anthropic").await;

        let doc = store.load().await;
        assert!(doc.accounts.is_empty());
    }
}
