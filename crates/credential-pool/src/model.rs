//! On-disk and in-memory data model for accounts, usage, and claims.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub const EXPIRY_BUFFER_MS: u64 = 60_000;
pub const CLAIM_EXPIRY_MS: u64 = 60_000;
pub const RECENT_429_COOLDOWN_MS: u64 = 30_000;
pub const USAGE_STALE_MS: u64 = 30_000;

/// A single usage-tier reading: utilization percentage plus an optional
/// ISO-8601 reset timestamp. `utilization >= 100` means the tier is
/// exhausted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UsageTier {
    pub utilization: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<String>,
}

impl UsageTier {
    pub fn is_exhausted(&self) -> bool {
        self.utilization >= 100.0
    }
}

/// Up to three named usage tiers. OpenAI only populates `five_hour` and
/// `seven_day`; Anthropic also reports `seven_day_sonnet`. The mapping from
/// each provider's native schema happens in the usage-fetcher collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub five_hour: Option<UsageTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seven_day: Option<UsageTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seven_day_sonnet: Option<UsageTier>,
}

impl UsageLimits {
    /// Highest utilization among populated tiers, or `None` if no tier is
    /// present.
    pub fn max_tier_utilization(&self) -> Option<f64> {
        [
            self.five_hour.as_ref(),
            self.seven_day.as_ref(),
            self.seven_day_sonnet.as_ref(),
        ]
        .into_iter()
        .flatten()
        .map(|t| t.utilization)
        .fold(None, |acc, u| Some(acc.map_or(u, |a: f64| a.max(u))))
    }

    /// Earliest future reset timestamp among exhausted tiers, parsed as a
    /// millisecond epoch. Returns `None` if no tier is exhausted or none
    /// carry a parseable reset.
    pub fn earliest_exhausted_reset_ms(&self) -> Option<u64> {
        [
            self.five_hour.as_ref(),
            self.seven_day.as_ref(),
            self.seven_day_sonnet.as_ref(),
        ]
        .into_iter()
        .flatten()
        .filter(|t| t.is_exhausted())
        .filter_map(|t| t.resets_at.as_deref())
        .filter_map(parse_iso8601_ms)
        .min()
    }

    pub fn any_tier_at_least(&self, threshold: f64) -> bool {
        [
            self.five_hour.as_ref(),
            self.seven_day.as_ref(),
            self.seven_day_sonnet.as_ref(),
        ]
        .into_iter()
        .flatten()
        .any(|t| t.utilization >= threshold)
    }
}

/// Minimal ISO-8601 / RFC 3339 UTC parser good enough for provider reset
/// timestamps (`2026-01-01T00:00:00Z`-style strings). Returns `None` on any
/// deviation rather than guessing.
fn parse_iso8601_ms(s: &str) -> Option<u64> {
    let s = s.strip_suffix('Z').unwrap_or(s);
    let (date, time) = s.split_once('T')?;
    let mut date_parts = date.split('-');
    let year: i64 = date_parts.next()?.parse().ok()?;
    let month: i64 = date_parts.next()?.parse().ok()?;
    let day: i64 = date_parts.next()?.parse().ok()?;
    let time = time.split('.').next().unwrap_or(time);
    let mut time_parts = time.split(':');
    let hour: i64 = time_parts.next()?.parse().ok()?;
    let minute: i64 = time_parts.next()?.parse().ok()?;
    let second: i64 = time_parts.next()?.parse().ok()?;

    // Days since epoch via a civil-calendar algorithm (Howard Hinnant's).
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era * 146_097 + doe - 719_468;

    let total_seconds = days * 86_400 + hour * 3600 + minute * 60 + second;
    if total_seconds < 0 {
        return None;
    }
    Some(total_seconds as u64 * 1000)
}

/// A persisted OAuth account row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredAccount {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_tier: Option<String>,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    pub added_at: u64,
    pub last_used: u64,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_reset_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_usage: Option<UsageLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_usage_at: Option<u64>,
    #[serde(default)]
    pub consecutive_auth_failures: u32,
    #[serde(default)]
    pub is_auth_disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_disabled_reason: Option<String>,
}

impl StoredAccount {
    pub fn new(uuid: String, refresh_token: String) -> Self {
        let now = now_ms();
        Self {
            uuid,
            account_id: None,
            label: None,
            email: None,
            plan_tier: None,
            refresh_token,
            access_token: None,
            expires_at: None,
            added_at: now,
            last_used: now,
            enabled: true,
            rate_limit_reset_at: None,
            cached_usage: None,
            cached_usage_at: None,
            consecutive_auth_failures: 0,
            is_auth_disabled: false,
            auth_disabled_reason: None,
        }
    }

    /// Invariant #4: a token is expired iff there is no access token, no
    /// expiry, or the expiry is within `EXPIRY_BUFFER_MS` of now.
    pub fn is_token_expired(&self, now: u64) -> bool {
        match (&self.access_token, self.expires_at) {
            (Some(_), Some(expires_at)) => expires_at <= now + EXPIRY_BUFFER_MS,
            _ => true,
        }
    }

    pub fn is_rate_limited(&self, now: u64) -> bool {
        if let Some(reset) = self.rate_limit_reset_at {
            if reset > now {
                return true;
            }
        }
        if let Some(usage) = &self.cached_usage {
            if let Some(reset) = usage.earliest_exhausted_reset_ms() {
                return reset > now;
            }
        }
        false
    }
}

/// Root persisted document: `{version, accounts, activeAccountUuid?}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountStorage {
    pub version: u32,
    pub accounts: Vec<StoredAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_account_uuid: Option<String>,
}

impl Default for AccountStorage {
    fn default() -> Self {
        Self {
            version: 1,
            accounts: Vec::new(),
            active_account_uuid: None,
        }
    }
}

/// In-memory projection of a `StoredAccount` plus a position in the
/// manager's cached list and a transient last-429 timestamp used for the
/// 30s post-429 cooldown. Not persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedAccount {
    pub account: StoredAccount,
    pub index: usize,
    pub last_429_at: Option<u64>,
}

impl ManagedAccount {
    pub fn is_usable(&self, now: u64, soft_quota_threshold_percent: f64) -> bool {
        if !self.account.enabled || self.account.is_auth_disabled {
            return false;
        }
        if self.account.is_rate_limited(now) {
            return false;
        }
        if let Some(last_429) = self.last_429_at {
            if now.saturating_sub(last_429) < RECENT_429_COOLDOWN_MS {
                return false;
            }
        }
        if soft_quota_threshold_percent < 100.0 {
            if let Some(usage) = &self.account.cached_usage {
                if usage.any_tier_at_least(soft_quota_threshold_percent) {
                    return false;
                }
            }
        }
        true
    }
}

/// A cross-process claim: `{pid, at}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claim {
    pub pid: i32,
    pub at: u64,
}

impl Claim {
    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.at) > CLAIM_EXPIRY_MS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_expired_when_missing_access_or_expiry() {
        let mut a = StoredAccount::new("u1".into(), "rt".into());
        assert!(a.is_token_expired(now_ms()));
        a.access_token = Some("at".into());
        assert!(a.is_token_expired(now_ms()));
    }

    #[test]
    fn token_not_expired_with_future_buffer() {
        let mut a = StoredAccount::new("u1".into(), "rt".into());
        a.access_token = Some("at".into());
        a.expires_at = Some(now_ms() + EXPIRY_BUFFER_MS + 10_000);
        assert!(!a.is_token_expired(now_ms()));
    }

    #[test]
    fn token_expired_within_buffer() {
        let mut a = StoredAccount::new("u1".into(), "rt".into());
        a.access_token = Some("at".into());
        a.expires_at = Some(now_ms() + 1_000);
        assert!(a.is_token_expired(now_ms()));
    }

    #[test]
    fn usage_max_tier_utilization_picks_highest() {
        let usage = UsageLimits {
            five_hour: Some(UsageTier {
                utilization: 42.0,
                resets_at: None,
            }),
            seven_day: Some(UsageTier {
                utilization: 91.0,
                resets_at: None,
            }),
            seven_day_sonnet: None,
        };
        assert_eq!(usage.max_tier_utilization(), Some(91.0));
    }

    #[test]
    fn usage_empty_has_no_max() {
        assert_eq!(UsageLimits::default().max_tier_utilization(), None);
    }

    #[test]
    fn earliest_exhausted_reset_ignores_non_exhausted_tiers() {
        let usage = UsageLimits {
            five_hour: Some(UsageTier {
                utilization: 50.0,
                resets_at: Some("2026-01-01T00:00:00Z".into()),
            }),
            seven_day: Some(UsageTier {
                utilization: 100.0,
                resets_at: Some("2026-06-01T00:00:00Z".into()),
            }),
            seven_day_sonnet: None,
        };
        assert!(usage.earliest_exhausted_reset_ms().is_some());
    }

    #[test]
    fn claim_expiry_boundary() {
        let now = now_ms();
        let fresh = Claim {
            pid: 1,
            at: now - 1_000,
        };
        let stale = Claim {
            pid: 1,
            at: now - CLAIM_EXPIRY_MS - 1_000,
        };
        assert!(!fresh.is_expired(now));
        assert!(stale.is_expired(now));
    }

    #[test]
    fn account_storage_default_is_empty() {
        let storage = AccountStorage::default();
        assert_eq!(storage.version, 1);
        assert!(storage.accounts.is_empty());
        assert!(storage.active_account_uuid.is_none());
    }

    #[test]
    fn parses_known_iso8601_timestamp() {
        let ms = parse_iso8601_ms("1970-01-01T00:00:01Z").unwrap();
        assert_eq!(ms, 1000);
    }
}
