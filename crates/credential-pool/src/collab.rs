//! Collaborator interfaces injected per provider (§6, §9 "dynamic dispatch
//! via injection"): refresh, usage-fetch, and the request issuer's
//! URL/header transforms. Each is a small trait the engine accepts as
//! `Arc<dyn Trait>`; Anthropic/OpenAI-specific implementations live in
//! their own crates and are composed at the gateway's construction site.
//!
//! `Pin<Box<dyn Future>>` return types keep these trait objects
//! dyn-compatible, the same pattern the host's existing `Provider`
//! abstraction uses.

use std::future::Future;
use std::pin::Pin;

use crate::model::UsageLimits;

/// Outcome of one refresh attempt, matching §4.4's classification exactly.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Ok(RefreshPatch),
    Err { permanent: bool, status: Option<u16> },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RefreshPatch {
    pub access_token: String,
    pub expires_at: u64,
    pub refresh_token: Option<String>,
    pub account_id: Option<String>,
    pub email: Option<String>,
}

/// Performs OAuth refresh HTTP calls for one provider. Implementations own
/// their own `reqwest::Client` and token-endpoint shape (JSON vs.
/// form-encoded); the engine only sees the classified outcome.
pub trait Refresher: Send + Sync {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = RefreshOutcome> + Send + 'a>>;
}

/// Fetches usage/quota data for one provider, already mapped onto the
/// internal `five_hour`/`seven_day`/`seven_day_sonnet` naming.
pub trait UsageFetcher: Send + Sync {
    fn fetch_usage<'a>(
        &'a self,
        access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<UsageLimits>> + Send + 'a>>;
}

/// Provider-specific URL/header transforms plus the actual network call.
/// Implementations apply whatever rewrites their provider needs (beta
/// headers, user-agent, tool-name prefixing) before delegating to the
/// host's fetch.
pub trait RequestTransport: Send + Sync {
    fn send<'a>(
        &'a self,
        access_token: &'a str,
        request: reqwest::Request,
    ) -> Pin<Box<dyn Future<Output = Result<reqwest::Response, reqwest::Error>> + Send + 'a>>;
}

/// Credentials synced back to the host after a successful refresh of the
/// active account.
#[derive(Debug, Clone, PartialEq)]
pub struct HostCredentials {
    pub refresh_token: String,
    pub access_token: String,
    pub expires_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastVariant {
    Info,
    Warning,
    Error,
}

/// The host environment the engine reports back to: syncing the active
/// account's credentials, surfacing user-visible toasts, and structured
/// logging (§6 "Collaborator interfaces"). A no-op implementation is
/// appropriate for headless deployments.
pub trait HostClient: Send + Sync {
    fn auth_set(&self, provider_id: &str, credentials: HostCredentials);
    fn show_toast(&self, message: &str, variant: ToastVariant);
}

/// A `HostClient` that does nothing; used where no host integration is
/// configured.
pub struct NullHostClient;

impl HostClient for NullHostClient {
    fn auth_set(&self, _provider_id: &str, _credentials: HostCredentials) {}
    fn show_toast(&self, _message: &str, _variant: ToastVariant) {}
}
