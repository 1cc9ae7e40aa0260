// uhdslave/src/engine/quota.rs
//
// Stage 6: remaining-capacity mirrors. One pipelined read covers
// `remain:{req,bw}:<dim>:<val>:{daily,weekly,monthly}` for every dimension
// the request carries; the per-dimension minimum over present values
// decides. An absent mirror means no quota is configured for that axis and
// never denies. Negative values count as exhausted — the log phase
// decrements mirrors between syncs, and the 600 s mirror TTL bounds how far
// they can drift.

use tracing::error;

use crate::config::Snapshot;
use crate::context::RequestHead;
use crate::engine::blocked_entry;
use crate::state::telemetry::TelemetryBuffer;
use crate::store::{keys, KvStore};
use crate::types::{Denial, DenyReason, Dimension, Fingerprint, Period, QuotaKind};

/// The mirror keys for one dimension, in a fixed order.
pub fn mirror_keys(dimension: Dimension, value: &str) -> Vec<String> {
    let mut out = Vec::with_capacity(6);
    for kind in [QuotaKind::Req, QuotaKind::Bw] {
        for period in Period::MIRROR {
            out.push(keys::remain(kind, dimension, value, period));
        }
    }
    out
}

pub fn dimensions(fp: &Fingerprint) -> Vec<(Dimension, String)> {
    let mut out = vec![(Dimension::Ip, fp.client_ip.to_string())];
    if let Some(user) = &fp.user_id {
        out.push((Dimension::User, user.clone()));
    }
    if let Some(device) = &fp.device_id {
        out.push((Dimension::Device, device.clone()));
    }
    out
}

pub async fn check(
    store: &dyn KvStore,
    snapshot: &Snapshot,
    fp: &Fingerprint,
    head: &RequestHead,
    telemetry: &TelemetryBuffer,
) -> Option<Denial> {
    let dims = dimensions(fp);
    let key_list: Vec<String> = dims
        .iter()
        .flat_map(|(dim, val)| mirror_keys(*dim, val))
        .collect();

    let values = match store.mget(&key_list).await {
        Ok(v) => v,
        Err(e) => {
            error!("quota mirror lookup failed: {}", e);
            return None;
        }
    };

    for (i, (dim, _)) in dims.iter().enumerate() {
        let Some(slice) = values.get(i * 6..(i + 1) * 6) else { break };
        let min = slice
            .iter()
            .filter_map(|v| v.as_deref().and_then(|s| s.parse::<i64>().ok()))
            .min();
        if let Some(min) = min {
            if min <= 0 {
                let denial = Denial::too_many(
                    DenyReason::QuotaExhausted,
                    snapshot.policy.quota_exhausted_message.clone(),
                );
                telemetry.push_blocked(blocked_entry(head, Some(fp), &denial, None));
                tracing::debug!(dimension = %dim, remaining = min, "quota exhausted");
                return Some(denial);
            }
        }
    }
    None
}
