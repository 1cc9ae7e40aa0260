// uhdslave/src/types.rs
//
// Shared domain types flowing through the gateway: fingerprints, policy
// rules, enforcement directives, store records, telemetry entries, and the
// access decision rendered to the transport layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

// ── Request fingerprint ───────────────────────────────────────────────────────

/// Identity attributes extracted from a single request. `user_id` and
/// `device_id` may be back-filled from the store after header extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fingerprint {
    pub client_ip:       IpAddr,
    pub client_name:     Option<String>,
    pub client_version:  Option<String>,
    pub device_id:       Option<String>,
    pub device_name:     Option<String>,
    pub user_id:         Option<String>,
    pub token:           Option<String>,
    pub play_session_id: Option<String>,
    pub uri:             String,
    pub method:          String,
}

// ── Policy dimensions ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Ip,
    User,
    Device,
    Global,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ip     => "ip",
            Self::User   => "user",
            Self::Device => "device",
            Self::Global => "global",
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QuotaKind {
    Req,
    Bw,
}

impl QuotaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Req => "req",
            Self::Bw  => "bw",
        }
    }
}

/// Quota accounting periods. Counters are written for daily and monthly;
/// remaining-capacity mirrors exist for all three.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Daily,
    Weekly,
    Monthly,
}

impl Period {
    pub const MIRROR: [Period; 3]  = [Period::Daily, Period::Weekly, Period::Monthly];
    pub const COUNTER: [Period; 2] = [Period::Daily, Period::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily   => "daily",
            Self::Weekly  => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// Counter key TTL. One period window plus nothing — an expiring key
    /// resets to absent, never to a smaller value.
    pub fn counter_ttl_secs(&self) -> u64 {
        match self {
            Self::Daily   => 86_400,
            Self::Weekly  => 604_800,
            Self::Monthly => 2_678_400,
        }
    }

    /// UTC period key: `2026-08-01` (daily), `2026-W31` (weekly), `2026-08`
    /// (monthly).
    pub fn period_key(&self, now: DateTime<Utc>) -> String {
        match self {
            Self::Daily   => now.format("%Y-%m-%d").to_string(),
            Self::Weekly  => now.format("%G-W%V").to_string(),
            Self::Monthly => now.format("%Y-%m").to_string(),
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── URI rules ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Regex,
    Prefix,
    Exact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UriRule {
    pub pattern:    String,
    pub match_type: MatchType,
}

// ── Rate-limit rules ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverAction {
    Reject,
    Throttle,
}

impl Default for OverAction {
    fn default() -> Self {
        Self::Reject
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub id:       String,
    pub apply_to: Dimension,
    /// Literal dimension value, or `"*"` / absent for wildcard.
    #[serde(default)]
    pub apply_value:      Option<String>,
    #[serde(default)]
    pub rate_per_second:  Option<u32>,
    #[serde(default)]
    pub rate_burst:       Option<u32>,
    #[serde(default)]
    pub rate_per_minute:  Option<u32>,
    #[serde(default)]
    pub over_action:      OverAction,
    #[serde(default)]
    pub throttle_rate_bps: Option<u64>,
}

impl RateLimitRule {
    /// Wildcard (`"*"` or null) matches any non-nil dimension value; a
    /// literal must equal the request's value exactly.
    pub fn applies_to(&self, value: &str) -> bool {
        match self.apply_value.as_deref() {
            None | Some("*") => true,
            Some(literal)    => literal == value,
        }
    }
}

// ── Enforcement directives ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnforceAction {
    Reject,
    Throttle,
}

pub const ENFORCE_DEFAULT_TTL_SECS: u64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementDirective {
    pub dimension:       Dimension,
    pub dimension_value: String,
    pub action:          EnforceAction,
    #[serde(default)]
    pub reason:          Option<String>,
    #[serde(default)]
    pub throttle_rate_bps: Option<u64>,
    /// RFC 3339 expiry; the store key TTL is derived from it.
    #[serde(default)]
    pub effective_until: Option<String>,
}

impl EnforcementDirective {
    /// Seconds until `effective_until`, defaulting to 600 when absent or
    /// unparseable, clamped to at least 1.
    pub fn ttl_secs(&self, now: DateTime<Utc>) -> u64 {
        let Some(raw) = self.effective_until.as_deref() else {
            return ENFORCE_DEFAULT_TTL_SECS;
        };
        match DateTime::parse_from_rfc3339(raw) {
            Ok(until) => (until.with_timezone(&Utc) - now).num_seconds().max(1) as u64,
            Err(_)    => ENFORCE_DEFAULT_TTL_SECS,
        }
    }
}

// ── Store records ─────────────────────────────────────────────────────────────

pub const TOKEN_MAP_TTL_SECS: u64 = 7 * 86_400;
pub const DEVICE_USER_TTL_SECS: u64 = 7 * 86_400;
pub const ACTIVE_SESSION_TTL_SECS: u64 = 90;
pub const TOKEN_REPORT_TTL_SECS: u64 = 600;
pub const REMAIN_TTL_SECS: u64 = 600;

/// `token_map:<token>` — learned at login, refreshed on use.
/// Invariant: `user_id` is non-empty whenever the record exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub user_id:  String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub client_version: Option<String>,
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub login_time: i64,
    #[serde(default)]
    pub is_admin: bool,
}

/// `device_user:<device_id>` — populated only by the sessions polling loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceUserRecord {
    pub user_id:  String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub client_version: Option<String>,
    pub resolved_from: String,
}

/// `active_session:<user_id>:<play_session_id>` — sliding 90 s TTL, natural
/// expiry is session end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSession {
    #[serde(default)]
    pub device_id:   Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    pub client_ip:   String,
    pub started_at:  i64,
    pub last_seen:   i64,
    #[serde(default)]
    pub bytes_sent:  u64,
}

/// Login event queued under `token_report:*` at capture time and reported
/// upstream by the telemetry flush loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginEvent {
    pub event_type:    String,
    pub emby_user_id:  String,
    pub emby_username: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub client_version: Option<String>,
    pub client_ip: String,
    pub success:   bool,
}

// ── Telemetry entries ─────────────────────────────────────────────────────────

pub const TELEMETRY_ENTRY_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub timestamp:  i64,
    pub client_ip:  String,
    pub uri:        String,
    pub method:     String,
    pub status:     u16,
    pub bytes_sent: u64,
    pub request_time_ms:  u64,
    pub upstream_time_ms: u64,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub client_version: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub play_session_id: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedLogEntry {
    pub timestamp: i64,
    pub client_ip: String,
    pub uri:       String,
    pub method:    String,
    pub reason:    String,
    #[serde(default)]
    pub message: Option<String>,
    /// Matched URI pattern, when the denial came from a URI rule.
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

// ── Access decision ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    UriBlocked,
    EnforcementReject,
    RateLimitRps,
    RateLimitRpm,
    QuotaExhausted,
    ConcurrentStreamLimit,
    ClientNotWhitelisted,
    VersionTooOld,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UriBlocked            => "uri_blocked",
            Self::EnforcementReject     => "enforcement_reject",
            Self::RateLimitRps          => "rate_limit_rps",
            Self::RateLimitRpm          => "rate_limit_rpm",
            Self::QuotaExhausted        => "quota_exhausted",
            Self::ConcurrentStreamLimit => "concurrent_stream_limit",
            Self::ClientNotWhitelisted  => "client_not_whitelisted",
            Self::VersionTooOld         => "version_too_old",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured denial rendered by the transport: plain-text body, the
/// cache-suppression header set, and the policy status code.
#[derive(Debug, Clone)]
pub struct Denial {
    pub status:  u16,
    pub reason:  DenyReason,
    pub message: String,
}

impl Denial {
    pub fn forbidden(reason: DenyReason, message: impl Into<String>) -> Self {
        Self { status: 403, reason, message: message.into() }
    }

    pub fn too_many(reason: DenyReason, message: impl Into<String>) -> Self {
        Self { status: 429, reason, message: message.into() }
    }

    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Content-Type", "text/plain; charset=utf-8".to_string()),
            ("X-DetailPreload-Bytes", "-1".to_string()),
            ("Cache-Control", "no-store, no-cache, must-revalidate".to_string()),
        ]
    }
}

/// Locally rendered response that never reaches the upstream (fake counts).
#[derive(Debug, Clone)]
pub struct SyntheticResponse {
    pub status: u16,
    pub body:   String,
}

impl SyntheticResponse {
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Content-Type", "application/json; charset=utf-8".to_string()),
            ("X-DetailPreload-Bytes", "-1".to_string()),
            ("Cache-Control", "no-store, no-cache, must-revalidate".to_string()),
        ]
    }
}

#[derive(Debug, Clone)]
pub enum AccessDecision {
    /// Forward to upstream. A throttle directive, if any, was stashed on the
    /// request context for the transport to apply while streaming.
    Allow,
    Deny(Denial),
    Synthetic(SyntheticResponse),
}

impl AccessDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn period_keys_are_utc_calendar_buckets() {
        let t = Utc.with_ymd_and_hms(2026, 8, 1, 23, 59, 59).unwrap();
        assert_eq!(Period::Daily.period_key(t), "2026-08-01");
        assert_eq!(Period::Monthly.period_key(t), "2026-08");
    }

    #[test]
    fn counter_ttls_cover_one_window() {
        assert_eq!(Period::Daily.counter_ttl_secs(), 86_400);
        assert_eq!(Period::Monthly.counter_ttl_secs(), 2_678_400);
    }

    #[test]
    fn wildcard_rule_matches_any_value() {
        let mut rule = RateLimitRule {
            id: "r1".into(),
            apply_to: Dimension::Ip,
            apply_value: Some("*".into()),
            rate_per_second: Some(10),
            rate_burst: None,
            rate_per_minute: None,
            over_action: OverAction::Reject,
            throttle_rate_bps: None,
        };
        assert!(rule.applies_to("10.0.0.1"));
        rule.apply_value = None;
        assert!(rule.applies_to("anything"));
        rule.apply_value = Some("10.0.0.1".into());
        assert!(rule.applies_to("10.0.0.1"));
        assert!(!rule.applies_to("10.0.0.2"));
    }

    #[test]
    fn enforcement_ttl_from_effective_until() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let d = EnforcementDirective {
            dimension: Dimension::Ip,
            dimension_value: "1.2.3.4".into(),
            action: EnforceAction::Reject,
            reason: None,
            throttle_rate_bps: None,
            effective_until: Some("2026-08-01T12:05:00Z".into()),
        };
        assert_eq!(d.ttl_secs(now), 300);

        let expired = EnforcementDirective { effective_until: Some("2026-08-01T11:00:00Z".into()), ..d.clone() };
        assert_eq!(expired.ttl_secs(now), 1);

        let unparseable = EnforcementDirective { effective_until: Some("soon".into()), ..d.clone() };
        assert_eq!(unparseable.ttl_secs(now), ENFORCE_DEFAULT_TTL_SECS);

        let absent = EnforcementDirective { effective_until: None, ..d };
        assert_eq!(absent.ttl_secs(now), ENFORCE_DEFAULT_TTL_SECS);
    }

    #[test]
    fn denial_headers_suppress_caching() {
        let d = Denial::too_many(DenyReason::QuotaExhausted, "quota exhausted");
        let headers = d.headers();
        assert!(headers.iter().any(|(k, v)| *k == "X-DetailPreload-Bytes" && v == "-1"));
        assert!(headers.iter().any(|(k, v)| *k == "Cache-Control" && v.contains("no-store")));
    }
}
