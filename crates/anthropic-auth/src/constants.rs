//! Anthropic OAuth constants
//!
//! Public OAuth client configuration matching the Claude CLI. These values
//! are not secrets — they identify the public client application. The actual
//! secrets (access/refresh tokens) are managed by the account store.

/// Anthropic's public OAuth client ID (same as Claude CLI)
pub const ANTHROPIC_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// OAuth redirect URI (Anthropic's hosted callback page)
pub const REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";

/// Token endpoint for code exchange and token refresh
pub const TOKEN_ENDPOINT: &str = "https://console.anthropic.com/v1/oauth/token";

/// Authorization endpoint for Pro/Max subscriptions (claude.ai, not console)
pub const AUTHORIZE_ENDPOINT: &str = "https://claude.ai/oauth/authorize";

/// Usage endpoint reporting per-tier utilization and reset times
pub const USAGE_ENDPOINT: &str = "https://api.anthropic.com/api/oauth/usage";

/// Profile endpoint, used to recover account/email metadata post-auth
pub const PROFILE_ENDPOINT: &str = "https://api.anthropic.com/api/oauth/profile";

/// OAuth scopes required for inference access.
/// `user:sessions:claude_code` is required for Sonnet/Opus access.
/// `org:create_api_key` is deliberately excluded — that's for Console OAuth
/// (API key creation), which is out of scope for this gateway.
pub const SCOPES: &str = "user:profile user:inference user:sessions:claude_code";

/// Required beta header flags for OAuth-authenticated requests.
pub const BETA_HEADER: &str = "oauth-2025-04-20,interleaved-thinking-2025-05-14";

/// User-Agent identifying the pool as the Claude CLI.
pub const USER_AGENT: &str = "claude-cli/2.1.2 (external, cli)";

/// Required system prompt prefix for Opus/Sonnet access.
/// Anthropic requires this exact string at the start of the system prompt
/// to authorize Claude Code sessions.
pub const REQUIRED_SYSTEM_PROMPT_PREFIX: &str =
    "You are Claude Code, Anthropic's official CLI for Claude.";
