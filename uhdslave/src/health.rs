// uhdslave/src/health.rs
//
// Liveness endpoint. `GET /health` answers 200 as long as the process is up;
// deeper state (store reachability, config version) travels via the agent
// heartbeat instead.

use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

pub fn router() -> Router {
    Router::new().route("/health", get(|| async { StatusCode::OK }))
}

pub async fn serve(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("health endpoint listening on {}", addr);
    axum::serve(listener, router()).await?;
    Ok(())
}
