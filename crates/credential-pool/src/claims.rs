//! Claims Coordinator: a best-effort, lock-free hint file mapping
//! `uuid -> {pid, at}` so cooperating processes avoid picking the same
//! account. Not a lock — correctness comes from self-expiry and
//! zombie-PID detection, not mutual exclusion (§9 design notes).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::Result;
use crate::model::{now_ms, Claim};

pub struct ClaimsCoordinator {
    path: PathBuf,
    pid: i32,
}

impl ClaimsCoordinator {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            pid: std::process::id() as i32,
        }
    }

    /// Read the claims map, dropping entries whose claim has expired or
    /// whose PID is no longer alive. If anything was dropped, best-effort
    /// rewrite the file.
    pub fn read_claims(&self) -> HashMap<String, Claim> {
        let claims = self.read_raw().unwrap_or_default();
        let now = now_ms();
        let (keep, drop): (HashMap<_, _>, HashMap<_, _>) = claims
            .into_iter()
            .partition(|(_, claim)| !claim.is_expired(now) && is_pid_alive(claim.pid));

        if !drop.is_empty() {
            if let Err(e) = self.write_raw(&keep) {
                warn!(error = %e, "failed to rewrite claims after pruning");
            }
        }
        keep
    }

    pub fn write_claim(&self, uuid: &str) -> Result<()> {
        let mut claims = self.read_claims();
        claims.insert(
            uuid.to_string(),
            Claim {
                pid: self.pid,
                at: now_ms(),
            },
        );
        self.write_raw(&claims)
    }

    /// Deletes the entry only if owned by self.
    pub fn release_claim(&self, uuid: &str) -> Result<()> {
        let mut claims = self.read_claims();
        if claims.get(uuid).map(|c| c.pid) == Some(self.pid) {
            claims.remove(uuid);
            self.write_raw(&claims)?;
        }
        Ok(())
    }

    pub fn is_claimed_by_other(&self, claims: &HashMap<String, Claim>, uuid: &str) -> bool {
        match claims.get(uuid) {
            Some(claim) => {
                !claim.is_expired(now_ms()) && is_pid_alive(claim.pid) && claim.pid != self.pid
            }
            None => false,
        }
    }

    fn read_raw(&self) -> Result<HashMap<String, Claim>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_raw(&self, claims: &HashMap<String, Claim>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(claims)?;
        let tmp_path = self.path.with_extension(format!("tmp.{}", self.pid));
        let result = (|| -> Result<()> {
            std::fs::write(&tmp_path, &bytes)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
            }
            std::fs::rename(&tmp_path, &self.path)?;
            Ok(())
        })();
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        result
    }
}

/// Check PID liveness by sending signal 0 — delivers no signal but fails
/// if the process does not exist or is not ours to signal.
fn is_pid_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}
