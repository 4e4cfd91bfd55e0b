//! Config Loader: a typed configuration record with documented defaults,
//! loaded from a provider-specific JSON file and updated field-by-field
//! without disturbing unknown keys a future version might have written.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    Sticky,
    RoundRobin,
    Hybrid,
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        SelectionStrategy::Sticky
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
    pub account_selection_strategy: SelectionStrategy,
    pub cross_process_claims: bool,
    pub soft_quota_threshold_percent: f64,
    pub rate_limit_min_backoff_ms: u64,
    pub default_retry_after_ms: u64,
    pub max_consecutive_auth_failures: u32,
    pub token_failure_backoff_ms: u64,
    pub proactive_refresh: bool,
    pub proactive_refresh_buffer_seconds: u64,
    pub proactive_refresh_interval_seconds: u64,
    pub quiet_mode: bool,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            account_selection_strategy: SelectionStrategy::default(),
            cross_process_claims: true,
            soft_quota_threshold_percent: 100.0,
            rate_limit_min_backoff_ms: 30_000,
            default_retry_after_ms: 60_000,
            max_consecutive_auth_failures: 3,
            token_failure_backoff_ms: 30_000,
            proactive_refresh: true,
            proactive_refresh_buffer_seconds: 1800,
            proactive_refresh_interval_seconds: 300,
            quiet_mode: false,
            debug: false,
        }
    }
}

pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the typed config, falling back to defaults for a missing or
    /// unparseable file.
    pub fn load(&self) -> Config {
        self.load_raw()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    fn load_raw(&self) -> Option<serde_json::Value> {
        let bytes = std::fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Set a single field by name, preserving every other key already in
    /// the file (including ones this version doesn't know about).
    pub fn update_field(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let mut raw = self
            .load_raw()
            .unwrap_or_else(|| serde_json::to_value(Config::default()).unwrap());
        if let serde_json::Value::Object(map) = &mut raw {
            map.insert(key.to_string(), value);
        }
        write_json_atomic(&self.path, &raw)
    }
}

fn write_json_atomic(path: &Path, value: &serde_json::Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    let result = (|| -> Result<()> {
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}
