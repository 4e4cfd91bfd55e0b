//! Storage Codec: read/validate/atomic-write the accounts file.
//!
//! Corrupt content is renamed to `<file>.corrupt.<ms>.bak` and treated as
//! absent rather than surfaced as an error (invariant #1).

use std::collections::HashMap;
use std::path::Path;

use tracing::warn;

use crate::error::Result;
use crate::model::{now_ms, AccountStorage};

/// Read and schema-validate the accounts file. Returns `Ok(None)` if the
/// file is missing, corrupt, or fails to parse — in the corrupt case a
/// best-effort backup copy is left for operator inspection.
pub fn read_storage(path: &Path) -> Result<Option<AccountStorage>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_slice::<AccountStorage>(&bytes) {
        Ok(doc) => Ok(Some(doc)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "accounts file failed to parse, backing up");
            backup_corrupt(path, &bytes);
            Ok(None)
        }
    }
}

fn backup_corrupt(path: &Path, bytes: &[u8]) {
    let backup_path = path.with_extension(format!("corrupt.{}.bak", now_ms()));
    if let Err(e) = std::fs::write(&backup_path, bytes) {
        warn!(path = %backup_path.display(), error = %e, "failed to write corrupt backup");
    }
}

/// Atomically write the accounts document: write to a temp sibling, set
/// `0600` perms where supported, then rename over the target.
pub fn write_storage(path: &Path, doc: &AccountStorage) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let bytes = serde_json::to_vec_pretty(doc)?;
    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));

    let write_result = (|| -> Result<()> {
        std::fs::write(&tmp_path, &bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    if write_result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    write_result
}

/// Deduplicate by `uuid` (keeping greatest `lastUsed`), then by
/// `refreshToken` under the same rule, per invariant #2.
pub fn deduplicate(accounts: Vec<crate::model::StoredAccount>) -> Vec<crate::model::StoredAccount> {
    let mut by_uuid: HashMap<String, crate::model::StoredAccount> = HashMap::new();
    for account in accounts {
        by_uuid
            .entry(account.uuid.clone())
            .and_modify(|existing| {
                if account.last_used > existing.last_used {
                    *existing = account.clone();
                }
            })
            .or_insert(account);
    }

    let mut by_refresh_token: HashMap<String, crate::model::StoredAccount> = HashMap::new();
    for account in by_uuid.into_values() {
        by_refresh_token
            .entry(account.refresh_token.clone())
            .and_modify(|existing| {
                if account.last_used > existing.last_used {
                    *existing = account.clone();
                }
            })
            .or_insert(account);
    }

    let mut result: Vec<_> = by_refresh_token.into_values().collect();
    result.sort_by_key(|a| a.added_at);
    result
}

/// Read then dedupe. Returns `None` if the file is missing or corrupt.
pub fn load_accounts(path: &Path) -> Result<Option<AccountStorage>> {
    let Some(mut doc) = read_storage(path)? else {
        return Ok(None);
    };
    doc.accounts = deduplicate(doc.accounts);
    Ok(Some(doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StoredAccount;

    #[test]
    fn missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        assert!(read_storage(&path).unwrap().is_none());
    }

    #[test]
    fn round_trips_through_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let mut doc = AccountStorage::default();
        doc.accounts.push(StoredAccount::new("u1".into(), "rt1".into()));
        write_storage(&path, &doc).unwrap();

        let loaded = read_storage(&path).unwrap().unwrap();
        assert_eq!(loaded, doc);
    }

    #[cfg(unix)]
    #[test]
    fn written_file_has_0600_perms() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        write_storage(&path, &AccountStorage::default()).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn corrupt_file_treated_as_absent_and_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        std::fs::write(&path, b"not json").unwrap();

        assert!(read_storage(&path).unwrap().is_none());

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("corrupt"))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn deduplicate_keeps_greatest_last_used_per_uuid() {
        let mut older = StoredAccount::new("u1".into(), "rt1".into());
        older.last_used = 100;
        let mut newer = StoredAccount::new("u1".into(), "rt2".into());
        newer.last_used = 200;

        let result = deduplicate(vec![older, newer.clone()]);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].last_used, 200);
    }

    #[test]
    fn deduplicate_keeps_greatest_last_used_per_refresh_token() {
        let mut a = StoredAccount::new("u1".into(), "shared-rt".into());
        a.last_used = 100;
        let mut b = StoredAccount::new("u2".into(), "shared-rt".into());
        b.last_used = 300;

        let result = deduplicate(vec![a, b]);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].uuid, "u2");
    }

    #[test]
    fn deduplicate_preserves_distinct_accounts() {
        let a = StoredAccount::new("u1".into(), "rt1".into());
        let b = StoredAccount::new("u2".into(), "rt2".into());
        let result = deduplicate(vec![a, b]);
        assert_eq!(result.len(), 2);
    }
}
