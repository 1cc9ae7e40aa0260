// uhdslave/src/agent/token_resolve.rs
//
// Out-of-band identity learning. Polls the upstream media server's session
// list and records device→user bindings for devices the gateway has not yet
// resolved — the fallback path for legacy clients that never send a token.
// Only runs when upstream API credentials are configured, and never
// overwrites an existing binding.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::store::keys;
use crate::types::{DeviceUserRecord, DEVICE_USER_TTL_SECS};

use super::Agent;

const INITIAL_DELAY: Duration = Duration::from_secs(7);

pub async fn run(agent: Arc<Agent>) {
    tokio::time::sleep(INITIAL_DELAY).await;
    loop {
        if let Err(e) = tick(&agent).await {
            error!("token resolve failed: {:#}", e);
        }
        tokio::time::sleep(agent.settings.token_resolve_interval).await;
    }
}

async fn tick(agent: &Agent) -> anyhow::Result<()> {
    let Some(upstream) = agent.upstream.as_ref() else {
        return Ok(());
    };

    let mut resolved = 0usize;
    for session in upstream.sessions().await? {
        let (Some(user_id), Some(device_id)) = (&session.user_id, &session.device_id) else {
            continue;
        };
        let key = keys::device_user(device_id);
        if agent.store.exists(&key).await? {
            continue;
        }
        let record = DeviceUserRecord {
            user_id:        user_id.clone(),
            username:       session.user_name.clone().unwrap_or_default(),
            device_name:    session.device_name.clone(),
            client_name:    session.client.clone(),
            client_version: session.application_version.clone(),
            resolved_from:  "sessions_poll".to_string(),
        };
        let raw = serde_json::to_string(&record)?;
        agent.store.set_ex(&key, &raw, DEVICE_USER_TTL_SECS).await?;
        resolved += 1;
    }
    if resolved > 0 {
        debug!(resolved, "device bindings learned from upstream sessions");
    }
    Ok(())
}
