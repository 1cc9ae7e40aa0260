// uhdslave/src/agent/telemetry_flush.rs
//
// Telemetry flush loop. Drains the access and blocked buffers (bounded batch
// per flush) and the queued `token_report:*` login events. A failed POST
// loses that batch — entries are counted as lost and not re-queued; the
// buffers keep filling for the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::store::keys;
use crate::types::LoginEvent;

use super::Agent;

const INITIAL_DELAY: Duration = Duration::from_secs(5);
const MAX_ACCESS_PER_FLUSH: usize = 500;
const MAX_BLOCKED_PER_FLUSH: usize = 200;
const MAX_REPORTS_PER_FLUSH: usize = 100;

pub async fn run(agent: Arc<Agent>) {
    tokio::time::sleep(INITIAL_DELAY).await;
    loop {
        tick(&agent).await;
        tokio::time::sleep(agent.settings.telemetry_flush_interval).await;
    }
}

async fn tick(agent: &Agent) {
    let now = Utc::now().timestamp();

    let access = agent.telemetry.drain_access(MAX_ACCESS_PER_FLUSH, now);
    if !access.is_empty() {
        match agent.control.post_access_logs(&access).await {
            Ok(()) => debug!(entries = access.len(), "access logs flushed"),
            Err(e) => {
                agent.telemetry.mark_lost(access.len());
                error!("access-log flush failed, {} entries lost: {}", access.len(), e);
            }
        }
    }

    let blocked = agent.telemetry.drain_blocked(MAX_BLOCKED_PER_FLUSH, now);
    if !blocked.is_empty() {
        match agent.control.post_blocked(&blocked).await {
            Ok(()) => debug!(entries = blocked.len(), "blocked logs flushed"),
            Err(e) => {
                agent.telemetry.mark_lost(blocked.len());
                error!("blocked-log flush failed, {} entries lost: {}", blocked.len(), e);
            }
        }
    }

    if let Err(e) = flush_login_reports(agent).await {
        error!("login-report flush failed: {:#}", e);
    }
}

async fn flush_login_reports(agent: &Agent) -> anyhow::Result<()> {
    let mut report_keys = agent.store.scan(keys::TOKEN_REPORT_ALL, 200).await?;
    report_keys.truncate(MAX_REPORTS_PER_FLUSH);

    for key in report_keys {
        let Some(raw) = agent.store.get(&key).await? else { continue };
        // consumed either way — login reports are fire-and-forget
        agent.store.del(&key).await?;
        match serde_json::from_str::<LoginEvent>(&raw) {
            Ok(event) => {
                if let Err(e) = agent.control.post_login_event(&event).await {
                    agent.telemetry.mark_lost(1);
                    error!("login event for {} lost: {}", event.emby_user_id, e);
                }
            }
            Err(e) => warn!("Discarding malformed token report {}: {}", key, e),
        }
    }
    Ok(())
}
