// uhdslave/src/agent/heartbeat.rs
//
// Agent heartbeat loop: version, current config version, and operational
// metadata (buffer depths, loss counters, live session count, request
// counters).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::error;

use crate::control_plane::{HeartbeatPayload, AGENT_VERSION};
use crate::store::keys;

use super::Agent;

const INITIAL_DELAY: Duration = Duration::from_secs(3);

pub async fn run(agent: Arc<Agent>) {
    tokio::time::sleep(INITIAL_DELAY).await;
    loop {
        if let Err(e) = tick(&agent).await {
            error!("heartbeat failed: {:#}", e);
        }
        tokio::time::sleep(agent.settings.heartbeat_interval).await;
    }
}

async fn tick(agent: &Agent) -> anyhow::Result<()> {
    let active_sessions = agent
        .store
        .scan(keys::ACTIVE_SESSION_ALL, 200)
        .await
        .map(|k| k.len())
        .unwrap_or(0);
    let (requests, allowed, denied, synthetic) = agent.stats.snapshot();

    let payload = HeartbeatPayload {
        agent_version:          AGENT_VERSION,
        current_config_version: agent.config.version(),
        status:                 "ok",
        metadata: json!({
            "access_buffered":  agent.telemetry.access_len(),
            "blocked_buffered": agent.telemetry.blocked_len(),
            "telemetry_lost":   agent.telemetry.lost.load(Ordering::Relaxed),
            "active_sessions":  active_sessions,
            "requests":         requests,
            "allowed":          allowed,
            "denied":           denied,
            "synthetic":        synthetic,
        }),
    };
    agent.control.heartbeat(&payload).await?;
    Ok(())
}
