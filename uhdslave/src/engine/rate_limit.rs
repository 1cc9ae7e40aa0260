// uhdslave/src/engine/rate_limit.rs
//
// Stage 5: configured rate-limit rules against the local counters. Rules are
// evaluated in declaration order and every applicable rule is checked — a
// throttle outcome stashes its cap and evaluation continues; a reject
// outcome denies with 429 immediately. Rules whose dimension value is
// missing from the request are skipped, as are rules with no positive rate.

use chrono::Utc;

use crate::config::Snapshot;
use crate::context::{RequestContext, RequestHead};
use crate::engine::blocked_entry;
use crate::state::limits::LocalLimits;
use crate::state::telemetry::TelemetryBuffer;
use crate::types::{Denial, DenyReason, Dimension, Fingerprint, OverAction, RateLimitRule};

fn dimension_value(rule: &RateLimitRule, fp: &Fingerprint) -> Option<String> {
    match rule.apply_to {
        Dimension::Ip     => Some(fp.client_ip.to_string()),
        Dimension::User   => fp.user_id.clone(),
        Dimension::Device => fp.device_id.clone(),
        Dimension::Global => Some("global".to_string()),
    }
}

pub fn check(
    limits: &LocalLimits,
    snapshot: &Snapshot,
    fp: &Fingerprint,
    ctx: &mut RequestContext,
    head: &RequestHead,
    telemetry: &TelemetryBuffer,
) -> Option<Denial> {
    let now_unix = Utc::now().timestamp();

    for rule in &snapshot.rate_rules {
        let Some(value) = dimension_value(rule, fp) else { continue };
        if !rule.applies_to(&value) {
            continue;
        }
        let key = format!("{}:{}:{}", rule.id, rule.apply_to.as_str(), value);

        if let Some(rate) = rule.rate_per_second.filter(|r| *r > 0) {
            let burst = rule.rate_burst.filter(|b| *b > 0).unwrap_or(rate);
            if !limits.check_rps(&key, rate, burst) {
                if let Some(denial) = over_limit(rule, snapshot, fp, ctx, head, telemetry, DenyReason::RateLimitRps) {
                    return Some(denial);
                }
            }
        }

        if let Some(limit) = rule.rate_per_minute.filter(|r| *r > 0) {
            if !limits.check_rpm(&key, limit, now_unix) {
                if let Some(denial) = over_limit(rule, snapshot, fp, ctx, head, telemetry, DenyReason::RateLimitRpm) {
                    return Some(denial);
                }
            }
        }
    }
    None
}

/// A rule fired. Record the blocked event, then either deny or downgrade to
/// a throttle depending on the rule's over_action.
fn over_limit(
    rule: &RateLimitRule,
    snapshot: &Snapshot,
    fp: &Fingerprint,
    ctx: &mut RequestContext,
    head: &RequestHead,
    telemetry: &TelemetryBuffer,
    reason: DenyReason,
) -> Option<Denial> {
    let denial = Denial::too_many(reason, snapshot.policy.rate_limit_message.clone());
    telemetry.push_blocked(blocked_entry(head, Some(fp), &denial, None));
    match rule.over_action {
        OverAction::Reject => Some(denial),
        OverAction::Throttle => {
            if let Some(bps) = rule.throttle_rate_bps {
                ctx.throttle_rate_bps.get_or_insert(bps);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigCache, RateLimitConfig, RemoteConfig};
    use std::sync::Arc;

    fn snapshot_with(rules: Vec<RateLimitRule>) -> Arc<Snapshot> {
        let cache = ConfigCache::new();
        cache.apply(RemoteConfig {
            version: 1,
            service_type: None,
            policy: None,
            rate_limit_config: Some(RateLimitConfig { rules, enforcements: vec![] }),
        })
    }

    fn rule(apply_to: Dimension, rps: Option<u32>, rpm: Option<u32>, over: OverAction) -> RateLimitRule {
        RateLimitRule {
            id: "r1".into(),
            apply_to,
            apply_value: Some("*".into()),
            rate_per_second: rps,
            rate_burst: None,
            rate_per_minute: rpm,
            over_action: over,
            throttle_rate_bps: Some(512_000),
        }
    }

    fn fingerprint(user: Option<&str>) -> Fingerprint {
        Fingerprint {
            client_ip: "10.0.0.1".parse().unwrap(),
            client_name: None,
            client_version: None,
            device_id: None,
            device_name: None,
            user_id: user.map(str::to_string),
            token: None,
            play_session_id: None,
            uri: "/x".into(),
            method: "GET".into(),
        }
    }

    fn head() -> RequestHead {
        RequestHead::new("GET", "/x", vec![], "10.0.0.1".parse().unwrap())
    }

    #[test]
    fn burst_then_reject() {
        let snap = snapshot_with(vec![rule(Dimension::Ip, Some(10), None, OverAction::Reject)]);
        let limits = LocalLimits::new();
        let telemetry = TelemetryBuffer::new();
        let fp = fingerprint(None);

        for _ in 0..10 {
            let mut ctx = RequestContext::default();
            assert!(check(&limits, &snap, &fp, &mut ctx, &head(), &telemetry).is_none());
        }
        let mut ctx = RequestContext::default();
        let denial = check(&limits, &snap, &fp, &mut ctx, &head(), &telemetry).unwrap();
        assert_eq!(denial.status, 429);
        assert_eq!(denial.reason, DenyReason::RateLimitRps);
    }

    #[test]
    fn throttle_action_stashes_and_passes() {
        let snap = snapshot_with(vec![rule(Dimension::Ip, Some(1), None, OverAction::Throttle)]);
        let limits = LocalLimits::new();
        let telemetry = TelemetryBuffer::new();
        let fp = fingerprint(None);

        let mut ctx = RequestContext::default();
        assert!(check(&limits, &snap, &fp, &mut ctx, &head(), &telemetry).is_none());
        let mut ctx = RequestContext::default();
        assert!(check(&limits, &snap, &fp, &mut ctx, &head(), &telemetry).is_none());
        assert_eq!(ctx.throttle_rate_bps, Some(512_000));
        assert_eq!(telemetry.blocked_len(), 1);
    }

    #[test]
    fn user_rule_skipped_when_user_missing() {
        let snap = snapshot_with(vec![rule(Dimension::User, Some(1), None, OverAction::Reject)]);
        let limits = LocalLimits::new();
        let telemetry = TelemetryBuffer::new();
        let fp = fingerprint(None);
        for _ in 0..5 {
            let mut ctx = RequestContext::default();
            assert!(check(&limits, &snap, &fp, &mut ctx, &head(), &telemetry).is_none());
        }
    }

    #[test]
    fn zero_rate_disables_the_check() {
        let snap = snapshot_with(vec![rule(Dimension::Ip, Some(0), Some(0), OverAction::Reject)]);
        let limits = LocalLimits::new();
        let telemetry = TelemetryBuffer::new();
        let fp = fingerprint(None);
        for _ in 0..20 {
            let mut ctx = RequestContext::default();
            assert!(check(&limits, &snap, &fp, &mut ctx, &head(), &telemetry).is_none());
        }
    }

    #[test]
    fn literal_apply_value_must_match() {
        let mut r = rule(Dimension::Ip, Some(1), None, OverAction::Reject);
        r.apply_value = Some("10.9.9.9".into());
        let snap = snapshot_with(vec![r]);
        let limits = LocalLimits::new();
        let telemetry = TelemetryBuffer::new();
        let fp = fingerprint(None);
        for _ in 0..5 {
            let mut ctx = RequestContext::default();
            assert!(check(&limits, &snap, &fp, &mut ctx, &head(), &telemetry).is_none());
        }
    }

    #[test]
    fn rpm_window_denies_at_limit() {
        let snap = snapshot_with(vec![rule(Dimension::User, None, Some(3), OverAction::Reject)]);
        let limits = LocalLimits::new();
        let telemetry = TelemetryBuffer::new();
        let fp = fingerprint(Some("U1"));
        for _ in 0..3 {
            let mut ctx = RequestContext::default();
            assert!(check(&limits, &snap, &fp, &mut ctx, &head(), &telemetry).is_none());
        }
        let mut ctx = RequestContext::default();
        let denial = check(&limits, &snap, &fp, &mut ctx, &head(), &telemetry).unwrap();
        assert_eq!(denial.reason, DenyReason::RateLimitRpm);
    }
}
