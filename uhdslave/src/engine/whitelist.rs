// uhdslave/src/engine/whitelist.rs
//
// Stage 8: client whitelist and minimum versions. Only active when the
// whitelist is non-empty. A request with no resolvable client name cannot be
// on the list and is denied. Version floors apply after membership: a client
// with a `min_versions` entry must present a version that satisfies the
// numeric comparison.

use crate::config::Snapshot;
use crate::context::RequestHead;
use crate::engine::blocked_entry;
use crate::identity::is_sufficient;
use crate::state::telemetry::TelemetryBuffer;
use crate::types::{Denial, DenyReason, Fingerprint};

pub fn check(
    snapshot: &Snapshot,
    fp: &Fingerprint,
    head: &RequestHead,
    telemetry: &TelemetryBuffer,
) -> Option<Denial> {
    let policy = &snapshot.policy;
    if policy.client_whitelist.is_empty() {
        return None;
    }

    let listed = fp
        .client_name
        .as_deref()
        .map(|name| policy.client_whitelist.iter().any(|w| w == name))
        .unwrap_or(false);
    if !listed {
        let denial = Denial::forbidden(
            DenyReason::ClientNotWhitelisted,
            policy.whitelist_deny_message.clone(),
        );
        telemetry.push_blocked(blocked_entry(head, Some(fp), &denial, None));
        return Some(denial);
    }

    let client = fp.client_name.as_deref().unwrap_or_default();
    if let Some(required) = policy.min_versions.get(client) {
        let ok = fp
            .client_version
            .as_deref()
            .map(|current| is_sufficient(current, required))
            .unwrap_or(false);
        if !ok {
            let denial = Denial::forbidden(
                DenyReason::VersionTooOld,
                policy.version_deny_message(client, required),
            );
            telemetry.push_blocked(blocked_entry(head, Some(fp), &denial, None));
            return Some(denial);
        }
    }
    None
}
