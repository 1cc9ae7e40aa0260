// uhdslave/src/config.rs
//
// Runtime settings (environment-driven) and the policy snapshot.
//
// The snapshot is the cyclic-state seam: the agent's config-pull loop is the
// single writer, the per-request pipeline is a lock-free reader. Replacement
// is atomic at snapshot granularity — a reader sees the old snapshot fully or
// the new one fully, never mixed fields. A nil snapshot means cold start and
// the pipeline allows through.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{EnforcementDirective, MatchType, RateLimitRule, UriRule};

// ── Settings ──────────────────────────────────────────────────────────────────

/// Process configuration, resolved once at bootstrap from CLI/environment.
/// `admin_url` and `app_token` are mandatory; everything else has defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub admin_url: String,
    pub app_token: String,

    pub redis_host:     String,
    pub redis_port:     u16,
    pub redis_db:       u32,
    pub redis_password: Option<String>,

    pub config_pull_interval:       Duration,
    pub telemetry_flush_interval:   Duration,
    pub quota_sync_interval:        Duration,
    pub heartbeat_interval:         Duration,
    pub session_heartbeat_interval: Duration,
    pub token_resolve_interval:     Duration,

    pub emby_server_url: Option<String>,
    pub emby_api_key:    Option<String>,

    /// Only worker 0 runs the background agent.
    pub worker_id: u32,
}

impl Settings {
    pub fn redis_url(&self) -> String {
        let auth = self
            .redis_password
            .as_deref()
            .map(|p| format!(":{}@", p))
            .unwrap_or_default();
        format!("redis://{}{}:{}/{}", auth, self.redis_host, self.redis_port, self.redis_db)
    }

    pub fn upstream_configured(&self) -> bool {
        self.emby_server_url.is_some() && self.emby_api_key.is_some()
    }
}

// ── Policy config (wire name: lua_config) ─────────────────────────────────────

fn default_block_message() -> String {
    "访问已被拦截".to_string()
}
fn default_whitelist_deny_message() -> String {
    "当前客户端不被允许访问".to_string()
}
fn default_version_deny_template() -> String {
    "请使用 {client} {version} 或更高版本进行访问".to_string()
}
fn default_stream_limit_message() -> String {
    "并发播放数量已达上限".to_string()
}
fn default_quota_message() -> String {
    "配额已用尽，请稍后再试".to_string()
}
fn default_rate_limit_message() -> String {
    "请求过于频繁，请稍后再试".to_string()
}
fn default_fake_counts_value() -> i64 {
    888
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub uri_skip_rules:  Vec<UriRule>,
    #[serde(default)]
    pub uri_block_rules: Vec<UriRule>,
    #[serde(default = "default_block_message")]
    pub block_message: String,

    #[serde(default)]
    pub client_whitelist: Vec<String>,
    #[serde(default = "default_whitelist_deny_message")]
    pub whitelist_deny_message: String,
    /// client_name → minimum acceptable version.
    #[serde(default)]
    pub min_versions: HashMap<String, String>,
    #[serde(default = "default_version_deny_template")]
    pub version_deny_template: String,

    /// 0 disables the concurrent-stream gate.
    #[serde(default)]
    pub max_streams: u32,
    #[serde(default = "default_stream_limit_message")]
    pub stream_limit_message: String,

    #[serde(default = "default_quota_message")]
    pub quota_exhausted_message: String,
    #[serde(default = "default_rate_limit_message")]
    pub rate_limit_message: String,

    #[serde(default)]
    pub fake_counts_enabled: bool,
    #[serde(default = "default_fake_counts_value")]
    pub fake_counts_value: i64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            uri_skip_rules:          Vec::new(),
            uri_block_rules:         Vec::new(),
            block_message:           default_block_message(),
            client_whitelist:        Vec::new(),
            whitelist_deny_message:  default_whitelist_deny_message(),
            min_versions:            HashMap::new(),
            version_deny_template:   default_version_deny_template(),
            max_streams:             0,
            stream_limit_message:    default_stream_limit_message(),
            quota_exhausted_message: default_quota_message(),
            rate_limit_message:      default_rate_limit_message(),
            fake_counts_enabled:     false,
            fake_counts_value:       default_fake_counts_value(),
        }
    }
}

impl PolicyConfig {
    pub fn version_deny_message(&self, client: &str, version: &str) -> String {
        self.version_deny_template
            .replace("{client}", client)
            .replace("{version}", version)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub rules:        Vec<RateLimitRule>,
    #[serde(default)]
    pub enforcements: Vec<EnforcementDirective>,
}

/// `GET /config` payload. Each field is applied only when present; absent
/// fields keep their current values across a pull.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub version: u64,
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(rename = "lua_config", default)]
    pub policy: Option<PolicyConfig>,
    #[serde(default)]
    pub rate_limit_config: Option<RateLimitConfig>,
}

// ── Compiled snapshot ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Matcher {
    Regex(regex::Regex),
    Prefix(String),
    Exact(String),
}

/// A URI rule with its matcher pre-built. Regex rules are case-insensitive;
/// prefix is a byte prefix; exact is full-string equality.
#[derive(Debug, Clone)]
pub struct CompiledUriRule {
    pub pattern: String,
    matcher:     Matcher,
}

impl CompiledUriRule {
    pub fn compile(rule: &UriRule) -> Option<Self> {
        let matcher = match rule.match_type {
            MatchType::Regex => {
                match RegexBuilder::new(&rule.pattern).case_insensitive(true).build() {
                    Ok(re) => Matcher::Regex(re),
                    Err(e) => {
                        warn!("Skipping unparseable URI rule {:?}: {}", rule.pattern, e);
                        return None;
                    }
                }
            }
            MatchType::Prefix => Matcher::Prefix(rule.pattern.clone()),
            MatchType::Exact  => Matcher::Exact(rule.pattern.clone()),
        };
        Some(Self { pattern: rule.pattern.clone(), matcher })
    }

    pub fn matches(&self, uri: &str) -> bool {
        match &self.matcher {
            Matcher::Regex(re)  => re.is_match(uri),
            Matcher::Prefix(p)  => uri.starts_with(p.as_str()),
            Matcher::Exact(p)   => uri == p,
        }
    }
}

/// The versioned policy bundle the pipeline reads on every request.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub version:      u64,
    pub service_type: String,
    pub policy:       PolicyConfig,
    pub skip_rules:   Vec<CompiledUriRule>,
    pub block_rules:  Vec<CompiledUriRule>,
    pub rate_rules:   Vec<RateLimitRule>,
}

fn compile_rules(rules: &[UriRule]) -> Vec<CompiledUriRule> {
    rules.iter().filter_map(CompiledUriRule::compile).collect()
}

// ── Cache ─────────────────────────────────────────────────────────────────────

pub struct ConfigCache {
    current: ArcSwapOption<Snapshot>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self { current: ArcSwapOption::const_empty() }
    }

    pub fn load(&self) -> Option<Arc<Snapshot>> {
        self.current.load_full()
    }

    /// 0 before the first successful pull.
    pub fn version(&self) -> u64 {
        self.load().map(|s| s.version).unwrap_or(0)
    }

    /// Build and install a new snapshot from a remote config, overlaying
    /// present fields on top of the current snapshot.
    pub fn apply(&self, remote: RemoteConfig) -> Arc<Snapshot> {
        let prev = self.load();

        let policy = remote
            .policy
            .or_else(|| prev.as_ref().map(|p| p.policy.clone()))
            .unwrap_or_default();
        let rate_rules = remote
            .rate_limit_config
            .map(|rl| rl.rules)
            .or_else(|| prev.as_ref().map(|p| p.rate_rules.clone()))
            .unwrap_or_default();
        let service_type = remote
            .service_type
            .or_else(|| prev.as_ref().map(|p| p.service_type.clone()))
            .unwrap_or_default();

        let snapshot = Arc::new(Snapshot {
            version: remote.version,
            service_type,
            skip_rules:  compile_rules(&policy.uri_skip_rules),
            block_rules: compile_rules(&policy.uri_block_rules),
            rate_rules,
            policy,
        });
        self.current.store(Some(Arc::clone(&snapshot)));
        info!(
            version = snapshot.version,
            skip = snapshot.skip_rules.len(),
            block = snapshot.block_rules.len(),
            rate_rules = snapshot.rate_rules.len(),
            "Config snapshot applied"
        );
        snapshot
    }

    /// Replace only the rate-limit rules (out-of-band `/rate-limits` refresh).
    /// No-op during cold start — rules arrive with the first full pull.
    pub fn replace_rate_rules(&self, rules: Vec<RateLimitRule>) {
        if let Some(prev) = self.load() {
            let mut next = (*prev).clone();
            next.rate_rules = rules;
            self.current.store(Some(Arc::new(next)));
        }
    }
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(version: u64, policy: Option<PolicyConfig>) -> RemoteConfig {
        RemoteConfig { version, service_type: Some("emby".into()), policy, rate_limit_config: None }
    }

    #[test]
    fn cold_start_has_no_snapshot() {
        let cache = ConfigCache::new();
        assert!(cache.load().is_none());
        assert_eq!(cache.version(), 0);
    }

    #[test]
    fn apply_replaces_snapshot_atomically() {
        let cache = ConfigCache::new();
        cache.apply(remote(3, Some(PolicyConfig::default())));
        let snap = cache.load().unwrap();
        assert_eq!(snap.version, 3);
        assert_eq!(snap.policy.fake_counts_value, 888);

        // Absent fields keep their current values
        cache.apply(RemoteConfig { version: 4, service_type: None, policy: None, rate_limit_config: None });
        let snap = cache.load().unwrap();
        assert_eq!(snap.version, 4);
        assert_eq!(snap.service_type, "emby");
    }

    #[test]
    fn bad_regex_rules_are_skipped_not_fatal() {
        let mut policy = PolicyConfig::default();
        policy.uri_block_rules = vec![
            UriRule { pattern: "(unclosed".into(), match_type: MatchType::Regex },
            UriRule { pattern: "/web/".into(), match_type: MatchType::Prefix },
        ];
        let cache = ConfigCache::new();
        let snap = cache.apply(remote(1, Some(policy)));
        assert_eq!(snap.block_rules.len(), 1);
        assert!(snap.block_rules[0].matches("/web/index.html"));
    }

    #[test]
    fn regex_rules_match_case_insensitively() {
        let rule = CompiledUriRule::compile(&UriRule {
            pattern: "/Items/Counts(/|$)".into(),
            match_type: MatchType::Regex,
        })
        .unwrap();
        assert!(rule.matches("/items/counts"));
        assert!(rule.matches("/Items/Counts/"));
        assert!(!rule.matches("/Items/CountsX"));
    }

    #[test]
    fn version_deny_message_fills_template() {
        let policy = PolicyConfig::default();
        assert_eq!(
            policy.version_deny_message("Infuse", "7.9.0"),
            "请使用 Infuse 7.9.0 或更高版本进行访问"
        );
    }
}
