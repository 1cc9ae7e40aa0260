// uhdslave/src/main.rs
//
// UHD media-slave gateway agent.
//
// The binary owns everything that is not inline with a request: bootstrap,
// the store connection, the background agent loops, and the health endpoint.
// The reverse-proxy transport links the library and drives the access
// pipeline / log phase per request.
//
// Bootstrap is strict: missing UHDADMIN_URL/APP_TOKEN or an unreachable
// store exits non-zero. After that the process stays up through control
// plane and store outages — loops log and retry on their own schedule.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use uhdslave::agent::Agent;
use uhdslave::config::{ConfigCache, Settings};
use uhdslave::control_plane::ControlPlaneClient;
use uhdslave::health;
use uhdslave::state::telemetry::TelemetryBuffer;
use uhdslave::state::GatewayStats;
use uhdslave::store::{KvStore, RedisStore};
use uhdslave::upstream::UpstreamClient;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "uhdslave",
    about   = "Access-control gateway agent for Emby/Jellyfin reverse proxies",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, env = "UHDADMIN_URL", help = "Control-plane base URL")]
    admin_url: String,

    #[arg(long, env = "APP_TOKEN", hide_env_values = true)]
    app_token: String,

    #[arg(long, env = "REDIS_HOST", default_value = "127.0.0.1")]
    redis_host: String,

    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    redis_port: u16,

    #[arg(long, env = "REDIS_DB", default_value_t = 0)]
    redis_db: u32,

    #[arg(long, env = "REDIS_PASSWORD", hide_env_values = true)]
    redis_password: Option<String>,

    #[arg(long, env = "CONFIG_PULL_INTERVAL", default_value_t = 30)]
    config_pull_interval: u64,

    #[arg(long, env = "TELEMETRY_FLUSH_INTERVAL", default_value_t = 60)]
    telemetry_flush_interval: u64,

    #[arg(long, env = "QUOTA_SYNC_INTERVAL", default_value_t = 300)]
    quota_sync_interval: u64,

    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value_t = 60)]
    heartbeat_interval: u64,

    #[arg(long, env = "SESSION_HEARTBEAT_INTERVAL", default_value_t = 30)]
    session_heartbeat_interval: u64,

    #[arg(long, env = "TOKEN_RESOLVE_INTERVAL", default_value_t = 30)]
    token_resolve_interval: u64,

    #[arg(long, env = "EMBY_SERVER_URL")]
    emby_server_url: Option<String>,

    #[arg(long, env = "EMBY_API_KEY", hide_env_values = true)]
    emby_api_key: Option<String>,

    #[arg(long, env = "WORKER_ID", default_value_t = 0,
          help = "Worker index; only worker 0 runs the background agent")]
    worker_id: u32,

    #[arg(long, default_value = "0.0.0.0:9190")]
    health_addr: SocketAddr,
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings {
            admin_url:      self.admin_url.clone(),
            app_token:      self.app_token.clone(),
            redis_host:     self.redis_host.clone(),
            redis_port:     self.redis_port,
            redis_db:       self.redis_db,
            redis_password: self.redis_password.clone(),
            config_pull_interval:       Duration::from_secs(self.config_pull_interval),
            telemetry_flush_interval:   Duration::from_secs(self.telemetry_flush_interval),
            quota_sync_interval:        Duration::from_secs(self.quota_sync_interval),
            heartbeat_interval:         Duration::from_secs(self.heartbeat_interval),
            session_heartbeat_interval: Duration::from_secs(self.session_heartbeat_interval),
            token_resolve_interval:     Duration::from_secs(self.token_resolve_interval),
            emby_server_url: self.emby_server_url.clone(),
            emby_api_key:    self.emby_api_key.clone(),
            worker_id:       self.worker_id,
        }
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("uhdslave=info".parse()?))
        .compact()
        .init();

    let cli = Cli::parse();
    let settings = cli.settings();

    let store = RedisStore::connect(&settings.redis_url())
        .await
        .context("store bootstrap failed")?;
    let store: Arc<dyn KvStore> = Arc::new(store);
    info!("store connected at {}:{}", settings.redis_host, settings.redis_port);

    let control = Arc::new(ControlPlaneClient::new(&settings.admin_url, &settings.app_token)?);
    let config = Arc::new(ConfigCache::new());
    let telemetry = Arc::new(TelemetryBuffer::new());
    let stats = Arc::new(GatewayStats::new());

    let upstream = match (&settings.emby_server_url, &settings.emby_api_key) {
        (Some(url), Some(key)) => Some(UpstreamClient::new(url, key)?),
        _ => None,
    };

    let agent = Agent::new(
        Arc::clone(&store),
        Arc::clone(&control),
        Arc::clone(&config),
        Arc::clone(&telemetry),
        Arc::clone(&stats),
        upstream,
        settings.clone(),
    );
    agent.spawn_all();

    tokio::spawn(health::serve(cli.health_addr));
    tokio::spawn(stats_loop(Arc::clone(&stats), Arc::clone(&config)));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    Ok(())
}

async fn stats_loop(stats: Arc<GatewayStats>, config: Arc<ConfigCache>) {
    loop {
        tokio::time::sleep(Duration::from_secs(60)).await;
        let (requests, allowed, denied, synthetic) = stats.snapshot();
        info!(
            requests, allowed, denied, synthetic,
            config_version = config.version(),
            "gateway stats"
        );
    }
}
