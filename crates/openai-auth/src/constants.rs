//! OpenAI/Codex OAuth constants
//!
//! Public client configuration matching the Codex CLI. Not secrets — they
//! identify the public client application.

/// OpenAI's auth host (distinct from the `chatgpt.com` API host).
pub const OPENAI_AUTH_BASE: &str = "https://auth.openai.com";

/// OpenAI's public OAuth client ID (same as Codex CLI).
pub const OPENAI_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

/// Codex Responses API endpoint.
pub const CODEX_API_ENDPOINT: &str = "https://chatgpt.com/backend-api/codex/responses";

/// Codex usage/quota endpoint.
pub const USAGE_ENDPOINT: &str = "https://chatgpt.com/backend-api/wham/usage";

/// Local OAuth callback port used during the interactive login flow (out of
/// scope for this engine — recorded here because it is part of the public
/// client identity, not because this crate implements the callback server).
pub const OAUTH_CALLBACK_PORT: u16 = 1455;

/// Local OAuth callback path.
pub const OAUTH_CALLBACK_PATH: &str = "/auth/callback";
