// uhdslave/src/agent/mod.rs
//
// The background agent: six independent periodic loops, all owned by worker
// 0. Loops share this struct but never each other's state; a loop body that
// errors logs and re-arms — the sleep runs on every exit path, so one bad
// tick never kills a loop, and one loop's failure never reaches another.
// Staggered initial delays keep a fleet of restarting instances from
// stampeding the control plane.

pub mod config_pull;
pub mod heartbeat;
pub mod quota_sync;
pub mod session_heartbeat;
pub mod telemetry_flush;
pub mod token_resolve;

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{ConfigCache, Settings};
use crate::control_plane::ControlPlaneClient;
use crate::state::telemetry::TelemetryBuffer;
use crate::state::GatewayStats;
use crate::store::{keys, KvStore};
use crate::types::EnforcementDirective;
use crate::upstream::UpstreamClient;

pub struct Agent {
    pub store:     Arc<dyn KvStore>,
    pub control:   Arc<ControlPlaneClient>,
    pub config:    Arc<ConfigCache>,
    pub telemetry: Arc<TelemetryBuffer>,
    pub stats:     Arc<GatewayStats>,
    pub upstream:  Option<UpstreamClient>,
    pub settings:  Settings,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn KvStore>,
        control: Arc<ControlPlaneClient>,
        config: Arc<ConfigCache>,
        telemetry: Arc<TelemetryBuffer>,
        stats: Arc<GatewayStats>,
        upstream: Option<UpstreamClient>,
        settings: Settings,
    ) -> Arc<Self> {
        Arc::new(Self { store, control, config, telemetry, stats, upstream, settings })
    }

    /// Spawn every loop this instance owns. Workers other than 0 run only
    /// the inline pipeline and spawn nothing.
    pub fn spawn_all(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        if self.settings.worker_id != 0 {
            info!(worker = self.settings.worker_id, "not the agent owner — loops not started");
            return Vec::new();
        }

        let mut handles = vec![
            tokio::spawn(config_pull::run(Arc::clone(self))),
            tokio::spawn(heartbeat::run(Arc::clone(self))),
            tokio::spawn(telemetry_flush::run(Arc::clone(self))),
            tokio::spawn(session_heartbeat::run(Arc::clone(self))),
            tokio::spawn(quota_sync::run(Arc::clone(self))),
        ];
        if self.upstream.is_some() {
            handles.push(tokio::spawn(token_resolve::run(Arc::clone(self))));
        }
        info!(loops = handles.len(), "background agent started");
        handles
    }

    /// Replace the `enforce:*` key set: delete the old set, then write each
    /// directive with its TTL. Readers between the delete and the writes see
    /// no directives, which fails open by design.
    pub async fn replace_enforcements(&self, directives: &[EnforcementDirective]) -> anyhow::Result<()> {
        let old = self.store.scan(keys::ENFORCE_ALL, 200).await?;
        self.store.del_many(&old).await?;

        let now = Utc::now();
        let mut entries = Vec::with_capacity(directives.len());
        for directive in directives {
            let key = keys::enforce(directive.dimension, &directive.dimension_value);
            let raw = serde_json::to_string(directive)?;
            entries.push((key, raw, directive.ttl_secs(now)));
        }
        self.store.set_ex_many(&entries).await?;
        Ok(())
    }
}
