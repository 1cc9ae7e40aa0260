// uhdslave/src/agent/session_heartbeat.rs
//
// Realtime session heartbeat loop: snapshot every `active_session:*` record
// and POST it to the control plane. An empty snapshot is still sent — that
// is what clears stale central state after the last viewer stops.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::control_plane::RealtimeSession;
use crate::store::keys;
use crate::types::ActiveSession;

use super::Agent;

const INITIAL_DELAY: Duration = Duration::from_secs(8);

pub async fn run(agent: Arc<Agent>) {
    tokio::time::sleep(INITIAL_DELAY).await;
    loop {
        if let Err(e) = tick(&agent).await {
            error!("session heartbeat failed: {:#}", e);
        }
        tokio::time::sleep(agent.settings.session_heartbeat_interval).await;
    }
}

async fn tick(agent: &Agent) -> anyhow::Result<()> {
    let session_keys = agent.store.scan(keys::ACTIVE_SESSION_ALL, 200).await?;
    let values = agent.store.mget(&session_keys).await?;

    let mut sessions = Vec::with_capacity(session_keys.len());
    for (key, value) in session_keys.iter().zip(values) {
        let Some((user_id, psid)) = keys::parse_active_session(key) else { continue };
        let Some(raw) = value else { continue };
        let record: ActiveSession = match serde_json::from_str(&raw) {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping malformed active session {}: {}", key, e);
                continue;
            }
        };
        sessions.push(RealtimeSession {
            user_id:         user_id.to_string(),
            play_session_id: psid.to_string(),
            device_id:       record.device_id,
            device_name:     record.device_name,
            client_name:     record.client_name,
            client_ip:       record.client_ip,
            started_at:      record.started_at,
            last_seen:       record.last_seen,
            bytes_sent:      record.bytes_sent,
        });
    }

    agent.control.post_realtime_sessions(&sessions).await?;
    debug!(sessions = sessions.len(), "realtime snapshot sent");
    Ok(())
}
