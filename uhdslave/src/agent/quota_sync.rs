// uhdslave/src/agent/quota_sync.rs
//
// Quota sync loop. Uploads every local quota counter as an absolute value
// (idempotent across retries), applies the returned remaining-capacity
// mirrors and enforcement set, then refreshes rate-limit rules out-of-band
// from `/rate-limits`.
//
// The scan+read pattern can observe a req counter without its bw pair (or
// the reverse) while a request is mid-log-phase; the missing side reports
// as zero and corrects itself next tick.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::control_plane::QuotaCounterEntry;
use crate::store::keys;
use crate::types::{QuotaKind, REMAIN_TTL_SECS};

use super::Agent;

const INITIAL_DELAY: Duration = Duration::from_secs(10);

pub async fn run(agent: Arc<Agent>) {
    tokio::time::sleep(INITIAL_DELAY).await;
    loop {
        if let Err(e) = tick(&agent).await {
            error!("quota sync failed: {:#}", e);
        }
        if let Err(e) = refresh_rate_limits(&agent).await {
            error!("rate-limit refresh failed: {:#}", e);
        }
        tokio::time::sleep(agent.settings.quota_sync_interval).await;
    }
}

async fn tick(agent: &Agent) -> anyhow::Result<()> {
    let counters = collect_counters(agent).await?;
    if counters.is_empty() {
        return Ok(());
    }

    let response = agent.control.post_quota_sync(&counters).await?;
    debug!(
        counters = counters.len(),
        remaining = response.remaining.len(),
        enforcements = response.enforcements.len(),
        "quota sync complete"
    );

    let mirrors: Vec<(String, String, u64)> = response
        .remaining
        .iter()
        .map(|r| {
            (
                keys::remain(r.kind, r.dimension, &r.value, r.period),
                r.remaining.to_string(),
                REMAIN_TTL_SECS,
            )
        })
        .collect();
    agent.store.set_ex_many(&mirrors).await?;

    agent.replace_enforcements(&response.enforcements).await?;
    Ok(())
}

async fn collect_counters(agent: &Agent) -> anyhow::Result<Vec<QuotaCounterEntry>> {
    let req_keys = agent.store.scan(keys::QUOTA_REQ_ALL, 200).await?;
    if req_keys.is_empty() {
        return Ok(Vec::new());
    }
    let bw_keys: Vec<String> = req_keys
        .iter()
        .filter_map(|k| keys::quota_bw_counterpart(k))
        .collect();

    let req_values = agent.store.mget(&req_keys).await?;
    let bw_values = agent.store.mget(&bw_keys).await?;

    let mut counters = Vec::with_capacity(req_keys.len() * 2);
    for ((req_key, req_value), bw_value) in req_keys.iter().zip(req_values).zip(bw_values) {
        let Some(parts) = keys::parse_quota(req_key) else { continue };
        let req_count = req_value.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
        let bw_count = bw_value.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
        counters.push(QuotaCounterEntry {
            kind:       QuotaKind::Req,
            dimension:  parts.dimension,
            value:      parts.value.to_string(),
            period:     parts.period,
            period_key: parts.period_key.to_string(),
            count:      req_count,
        });
        counters.push(QuotaCounterEntry {
            kind:       QuotaKind::Bw,
            dimension:  parts.dimension,
            value:      parts.value.to_string(),
            period:     parts.period,
            period_key: parts.period_key.to_string(),
            count:      bw_count,
        });
    }
    Ok(counters)
}

async fn refresh_rate_limits(agent: &Agent) -> anyhow::Result<()> {
    let payload = agent.control.get_rate_limits().await?;
    agent.config.replace_rate_rules(payload.rules);
    agent.replace_enforcements(&payload.enforcements).await?;
    Ok(())
}
