//! Configuration types and loading.
//!
//! Unlike the engine's own per-provider config (JSON, spec §6), the
//! gateway binary's own server configuration is an ordinary `toml` file —
//! nothing in spec.md constrains this file's format, so it stays on the
//! teacher's habit.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub admin: AdminConfig,
    #[serde(default)]
    pub headers: Vec<HeaderInjection>,
    #[serde(default)]
    pub anthropic: Option<ProviderConfig>,
    #[serde(default)]
    pub openai: Option<ProviderConfig>,
}

/// Proxy listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Admin API listener settings. Kept on a separate address, matching the
/// teacher's "admin runs on a separate port, not exposed via the public
/// ingress" posture.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    pub listen_addr: SocketAddr,
}

/// Per-provider upstream target.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub upstream_url: String,
}

/// Header to inject on every proxied request (e.g. a required system
/// prompt prefix header, a client identification header).
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

fn default_timeout() -> u64 {
    60
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?;
        if config.anthropic.is_none() && config.openai.is_none() {
            anyhow::bail!("config must configure at least one of [anthropic] / [openai]");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_single_provider_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(
            &path,
            r#"
            [proxy]
            listen_addr = "127.0.0.1:8787"

            [admin]
            listen_addr = "127.0.0.1:9090"

            [anthropic]
            upstream_url = "https://api.anthropic.com"
            "#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.proxy.timeout_secs, 60);
        assert!(config.anthropic.is_some());
        assert!(config.openai.is_none());
    }

    #[test]
    fn rejects_config_with_no_providers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(
            &path,
            r#"
            [proxy]
            listen_addr = "127.0.0.1:8787"

            [admin]
            listen_addr = "127.0.0.1:9090"
            "#,
        )
        .unwrap();

        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn header_injections_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(
            &path,
            r#"
            [proxy]
            listen_addr = "127.0.0.1:8787"

            [admin]
            listen_addr = "127.0.0.1:9090"

            [[headers]]
            name = "x-client"
            value = "multiauth-gateway"

            [openai]
            upstream_url = "https://chatgpt.com/backend-api/codex"
            "#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.headers.len(), 1);
        assert_eq!(config.headers[0].name, "x-client");
    }
}
