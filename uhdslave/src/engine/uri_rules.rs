// uhdslave/src/engine/uri_rules.rs
//
// Stages 1–2: ordered URI rule lists. First match wins in each list; a skip
// match bypasses the rest of the pipeline, a block match denies with 403 and
// the configured text body.

use crate::config::Snapshot;
use crate::context::RequestHead;
use crate::engine::blocked_entry;
use crate::state::telemetry::TelemetryBuffer;
use crate::types::{Denial, DenyReason};

pub fn matches_skip(snapshot: &Snapshot, path: &str) -> bool {
    snapshot.skip_rules.iter().any(|r| r.matches(path))
}

pub fn check_block(
    snapshot: &Snapshot,
    head: &RequestHead,
    telemetry: &TelemetryBuffer,
) -> Option<Denial> {
    let rule = snapshot.block_rules.iter().find(|r| r.matches(&head.path))?;
    let denial = Denial::forbidden(DenyReason::UriBlocked, snapshot.policy.block_message.clone());
    telemetry.push_blocked(blocked_entry(head, None, &denial, Some(rule.pattern.clone())));
    Some(denial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigCache, PolicyConfig, RemoteConfig};
    use crate::types::{MatchType, UriRule};

    fn snapshot_with(skip: Vec<UriRule>, block: Vec<UriRule>) -> std::sync::Arc<Snapshot> {
        let mut policy = PolicyConfig::default();
        policy.uri_skip_rules = skip;
        policy.uri_block_rules = block;
        let cache = ConfigCache::new();
        cache.apply(RemoteConfig {
            version: 1,
            service_type: None,
            policy: Some(policy),
            rate_limit_config: None,
        })
    }

    fn head(path: &str) -> RequestHead {
        RequestHead::new("GET", path, vec![], "10.0.0.1".parse().unwrap())
    }

    #[test]
    fn skip_list_first_match_wins() {
        let snap = snapshot_with(
            vec![UriRule { pattern: "/web/".into(), match_type: MatchType::Prefix }],
            vec![UriRule { pattern: "/web/secret".into(), match_type: MatchType::Prefix }],
        );
        // the skip stage runs first in the pipeline, so this path never
        // reaches the block list
        assert!(matches_skip(&snap, "/web/secret/index.html"));
    }

    #[test]
    fn block_match_records_pattern_in_telemetry() {
        let snap = snapshot_with(
            vec![],
            vec![UriRule { pattern: r"^/debug(/|$)".into(), match_type: MatchType::Regex }],
        );
        let telemetry = TelemetryBuffer::new();
        let denial = check_block(&snap, &head("/Debug/info"), &telemetry).unwrap();
        assert_eq!(denial.status, 403);
        assert_eq!(denial.reason, DenyReason::UriBlocked);
        let drained = telemetry.drain_blocked(10, chrono::Utc::now().timestamp());
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].pattern.as_deref(), Some(r"^/debug(/|$)"));
    }

    #[test]
    fn exact_rules_require_full_match() {
        let snap = snapshot_with(
            vec![],
            vec![UriRule { pattern: "/System/Info".into(), match_type: MatchType::Exact }],
        );
        let telemetry = TelemetryBuffer::new();
        assert!(check_block(&snap, &head("/System/Info"), &telemetry).is_some());
        assert!(check_block(&snap, &head("/System/Info/Public"), &telemetry).is_none());
    }
}
