// uhdslave/src/engine/fake_counts.rs
//
// Stage 9: library-count interception. When enabled, requests for item
// counts never reach the upstream — the gateway answers with every count
// field set to the configured integer. Matches `/Items/Counts` (optionally
// trailing slash) and the per-user `/Users/<id>/Items/Counts` shape,
// case-insensitively.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde_json::json;

use crate::config::Snapshot;
use crate::types::SyntheticResponse;

static RE_COUNTS: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"(^|/)Items/Counts(/|$)")
        .case_insensitive(true)
        .build()
        .expect("static regex")
});
static RE_USER_COUNTS: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"^/Users/[^/]+/Items/Counts(/|$)")
        .case_insensitive(true)
        .build()
        .expect("static regex")
});

pub fn path_matches(path: &str) -> bool {
    RE_COUNTS.is_match(path) || RE_USER_COUNTS.is_match(path)
}

pub fn intercept(snapshot: &Snapshot, path: &str) -> Option<SyntheticResponse> {
    if !snapshot.policy.fake_counts_enabled || !path_matches(path) {
        return None;
    }
    let n = snapshot.policy.fake_counts_value;
    let body = json!({
        "MovieCount":      n,
        "SeriesCount":     n,
        "EpisodeCount":    n,
        "GameCount":       n,
        "ArtistCount":     n,
        "ProgramCount":    n,
        "GameSystemCount": n,
        "TrailerCount":    n,
        "SongCount":       n,
        "AlbumCount":      n,
        "MusicVideoCount": n,
        "BoxSetCount":     n,
        "BookCount":       n,
        "ItemCount":       n,
    });
    Some(SyntheticResponse { status: 200, body: body.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigCache, PolicyConfig, RemoteConfig};
    use std::sync::Arc;

    fn snapshot(enabled: bool, value: i64) -> Arc<Snapshot> {
        let mut policy = PolicyConfig::default();
        policy.fake_counts_enabled = enabled;
        policy.fake_counts_value = value;
        let cache = ConfigCache::new();
        cache.apply(RemoteConfig {
            version: 1,
            service_type: None,
            policy: Some(policy),
            rate_limit_config: None,
        })
    }

    #[test]
    fn matches_both_count_shapes_case_insensitively() {
        assert!(path_matches("/Items/Counts"));
        assert!(path_matches("/items/counts/"));
        assert!(path_matches("/emby/Items/Counts"));
        assert!(path_matches("/Users/abc123/Items/Counts"));
        assert!(!path_matches("/Items/CountsSummary"));
        assert!(!path_matches("/Items/Latest"));
    }

    #[test]
    fn synthetic_body_uses_the_configured_value() {
        let snap = snapshot(true, 42);
        let resp = intercept(&snap, "/Items/Counts").unwrap();
        assert_eq!(resp.status, 200);
        let v: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(v["MovieCount"], 42);
        assert_eq!(v["BookCount"], 42);
        assert_eq!(v["ItemCount"], 42);
        assert_eq!(v.as_object().unwrap().len(), 14);
        let headers = resp.headers();
        assert!(headers.iter().any(|(k, v)| *k == "X-DetailPreload-Bytes" && v == "-1"));
        assert!(headers.iter().any(|(k, _)| *k == "Cache-Control"));
    }

    #[test]
    fn disabled_or_other_paths_pass_through() {
        assert!(intercept(&snapshot(false, 42), "/Items/Counts").is_none());
        assert!(intercept(&snapshot(true, 42), "/Videos/x/stream").is_none());
    }
}
