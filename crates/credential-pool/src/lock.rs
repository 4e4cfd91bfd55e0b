//! Cross-process file lock serializing Account Store writers.
//!
//! Uses atomic `O_EXCL` lock-file creation with stale-lock reclamation and
//! exponential backoff, the same shape as other fcntl-free advisory locks
//! in this ecosystem, but with the stale timeout and retry budget this
//! engine's storage layer requires: 10s, ~10 attempts, 50ms-2000ms backoff.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{Error, Result};

const STALE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 10;
const INITIAL_BACKOFF_MS: u64 = 50;
const MAX_BACKOFF_MS: u64 = 2000;

/// RAII guard; removes the lock file on drop.
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Acquire the lock file next to `target_path` (named `<target>.lock`),
/// blocking the calling thread with exponential backoff. Intended to be
/// called from `spawn_blocking`.
pub fn acquire(target_path: &Path) -> Result<LockGuard> {
    let lock_path = lock_path_for(target_path);
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let start = Instant::now();
    let mut wait_ms = INITIAL_BACKOFF_MS;
    let mut attempts = 0u32;

    loop {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(_file) => {
                return Ok(LockGuard { path: lock_path });
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if let Ok(metadata) = std::fs::metadata(&lock_path) {
                    if let Ok(modified) = metadata.modified() {
                        let age = modified.elapsed().unwrap_or(Duration::ZERO);
                        if age > STALE_TIMEOUT {
                            warn!(path = %lock_path.display(), age_ms = age.as_millis(), "stale lock detected, reclaiming");
                            let _ = std::fs::remove_file(&lock_path);
                            continue;
                        }
                    }
                }

                attempts += 1;
                if attempts >= MAX_ATTEMPTS || start.elapsed() >= STALE_TIMEOUT {
                    return Err(Error::LockTimeout(STALE_TIMEOUT.as_secs()));
                }

                std::thread::sleep(Duration::from_millis(wait_ms));
                wait_ms = (wait_ms * 2).min(MAX_BACKOFF_MS);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn lock_path_for(target_path: &Path) -> PathBuf {
    let mut os_string = target_path.as_os_str().to_os_string();
    os_string.push(".lock");
    PathBuf::from(os_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_when_unlocked() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("accounts.json");
        let guard = acquire(&target).unwrap();
        assert!(lock_path_for(&target).exists());
        drop(guard);
        assert!(!lock_path_for(&target).exists());
    }

    #[test]
    fn reclaims_stale_lock() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("accounts.json");
        let lock_path = lock_path_for(&target);
        std::fs::write(&lock_path, b"").unwrap();

        let stale_time = std::time::SystemTime::now() - Duration::from_secs(20);
        let file = std::fs::File::open(&lock_path).unwrap();
        file.set_modified(stale_time).unwrap();

        let guard = acquire(&target).unwrap();
        drop(guard);
    }

    #[test]
    fn second_acquire_blocks_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("accounts.json");
        let first = acquire(&target).unwrap();

        let target_clone = target.clone();
        let handle = std::thread::spawn(move || acquire(&target_clone));

        std::thread::sleep(Duration::from_millis(100));
        drop(first);

        let second = handle.join().unwrap().unwrap();
        drop(second);
    }
}
