// uhdslave/src/agent/config_pull.rs
//
// Config pull loop. Polls the version endpoint; a no-op unless the control
// plane flags an update or carries a newer version than the local snapshot.
// On change: fetch, swap the snapshot, replace the enforcement set, ack.

use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use super::Agent;

const INITIAL_DELAY: Duration = Duration::from_secs(1);

pub async fn run(agent: Arc<Agent>) {
    tokio::time::sleep(INITIAL_DELAY).await;
    loop {
        if let Err(e) = tick(&agent).await {
            error!("config pull failed: {:#}", e);
        }
        tokio::time::sleep(agent.settings.config_pull_interval).await;
    }
}

async fn tick(agent: &Agent) -> anyhow::Result<()> {
    let remote = agent.control.get_config_version().await?;
    let local = agent.config.version();
    if !remote.has_update && remote.version <= local {
        return Ok(());
    }

    let config = agent.control.get_config().await?;
    let enforcements = config
        .rate_limit_config
        .as_ref()
        .map(|rl| rl.enforcements.clone());
    agent.config.apply(config);

    if let Some(enforcements) = enforcements {
        agent.replace_enforcements(&enforcements).await?;
    }

    if let Some(snapshot_id) = remote.snapshot_id.as_deref() {
        agent.control.ack(snapshot_id).await?;
    }
    Ok(())
}
