// uhdslave/src/engine/mod.rs
//
// The access-phase pipeline. Stages run strictly in order; any stage may
// short-circuit with a denial, and at most one stage denies:
//
//   1. URI skip            — allow + bypass everything else
//   2. URI block           — 403
//   3. Identity            — fingerprint + store back-fill (never denies)
//   4. Enforcement         — control-plane reject/throttle directives
//   5. Rate limiting       — local token buckets / minute windows
//   6. Quota remaining     — store mirrors of central headroom
//   7. Concurrent streams  — per-user playback admission
//   8. Client whitelist    — client name + minimum version
//   9. Fake counts         — synthetic /Items/Counts response
//
// With no config snapshot (cold start) the pipeline allows through without
// touching the store. Store failures inside a stage degrade to "no data":
// a request that would otherwise pass is never failed by the store.

pub mod enforcement;
pub mod fake_counts;
pub mod quota;
pub mod rate_limit;
pub mod stream_gate;
pub mod uri_rules;
pub mod whitelist;

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::config::ConfigCache;
use crate::context::{RequestContext, RequestHead};
use crate::identity;
use crate::state::limits::LocalLimits;
use crate::state::telemetry::TelemetryBuffer;
use crate::state::GatewayStats;
use crate::store::KvStore;
use crate::types::{AccessDecision, BlockedLogEntry, Denial, Fingerprint};

pub struct AccessPipeline {
    store:     Arc<dyn KvStore>,
    config:    Arc<ConfigCache>,
    limits:    Arc<LocalLimits>,
    telemetry: Arc<TelemetryBuffer>,
    stats:     Arc<GatewayStats>,
}

impl AccessPipeline {
    pub fn new(
        store: Arc<dyn KvStore>,
        config: Arc<ConfigCache>,
        limits: Arc<LocalLimits>,
        telemetry: Arc<TelemetryBuffer>,
        stats: Arc<GatewayStats>,
    ) -> Self {
        Self { store, config, limits, telemetry, stats }
    }

    pub async fn evaluate(&self, head: &RequestHead, ctx: &mut RequestContext) -> AccessDecision {
        let decision = self.run_stages(head, ctx).await;
        self.stats.record(&decision);
        decision
    }

    async fn run_stages(&self, head: &RequestHead, ctx: &mut RequestContext) -> AccessDecision {
        // Cold start: no snapshot yet, fail open
        let Some(snapshot) = self.config.load() else {
            return AccessDecision::Allow;
        };

        // 1. URI skip
        if uri_rules::matches_skip(&snapshot, &head.path) {
            return AccessDecision::Allow;
        }

        // 2. URI block
        if let Some(denial) = uri_rules::check_block(&snapshot, head, &self.telemetry) {
            return AccessDecision::Deny(denial);
        }

        // 3. Identity
        let mut fp = identity::extract(head);
        identity::backfill(&mut fp, self.store.as_ref()).await;
        ctx.user_agent = head.user_agent().map(str::to_string);
        ctx.fingerprint = Some(fp.clone());
        debug!(
            user = fp.user_id.as_deref().unwrap_or("-"),
            client = fp.client_name.as_deref().unwrap_or("-"),
            "identity resolved"
        );

        // 4. Enforcement directives
        if let Some(denial) =
            enforcement::check(self.store.as_ref(), &fp, ctx, head, &self.telemetry).await
        {
            return AccessDecision::Deny(denial);
        }

        // 5. Rate limiting
        if let Some(denial) =
            rate_limit::check(&self.limits, &snapshot, &fp, ctx, head, &self.telemetry)
        {
            return AccessDecision::Deny(denial);
        }

        // 6. Quota remaining
        if let Some(denial) =
            quota::check(self.store.as_ref(), &snapshot, &fp, head, &self.telemetry).await
        {
            return AccessDecision::Deny(denial);
        }

        // 7. Concurrent-stream gate
        if let Some(denial) =
            stream_gate::check(self.store.as_ref(), &snapshot, &fp, ctx, head, &self.telemetry).await
        {
            return AccessDecision::Deny(denial);
        }

        // 8. Client whitelist
        if let Some(denial) = whitelist::check(&snapshot, &fp, head, &self.telemetry) {
            return AccessDecision::Deny(denial);
        }

        // 9. Fake counts
        if let Some(response) = fake_counts::intercept(&snapshot, &head.path) {
            return AccessDecision::Synthetic(response);
        }

        AccessDecision::Allow
    }
}

/// Shared shape for blocked-event telemetry. `fp` is None only for stages
/// that run before identity resolution.
pub(crate) fn blocked_entry(
    head: &RequestHead,
    fp: Option<&Fingerprint>,
    denial: &Denial,
    pattern: Option<String>,
) -> BlockedLogEntry {
    BlockedLogEntry {
        timestamp:  Utc::now().timestamp(),
        client_ip:  head.client_ip.to_string(),
        uri:        head.path.clone(),
        method:     head.method.clone(),
        reason:     denial.reason.as_str().to_string(),
        message:    Some(denial.message.clone()),
        pattern,
        client_name: fp.and_then(|f| f.client_name.clone()),
        device_id:   fp.and_then(|f| f.device_id.clone()),
        user_id:     fp.and_then(|f| f.user_id.clone()),
        user_agent:  head.user_agent().map(str::to_string),
    }
}
