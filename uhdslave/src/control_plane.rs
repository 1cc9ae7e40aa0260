// uhdslave/src/control_plane.rs
//
// Typed HTTP client for the UHDadmin control plane.
//
// Auth is `Authorization: App <token>` on every call, responses unwrap the
// `{data: …}` envelope, and every request carries a 10 s deadline. The
// source composed telemetry paths with a literal `/../`; here the two bases
// are encoded directly: config/ack/heartbeat/rate-limits live under
// `/api/v1/media-slave`, telemetry under `/api/v1/slave/telemetry`.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::RemoteConfig;
use crate::types::{
    AccessLogEntry, BlockedLogEntry, Dimension, EnforcementDirective, LoginEvent, Period,
    QuotaKind, RateLimitRule,
};

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control plane request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("control plane configuration invalid: {0}")]
    Config(String),
}

// ── Wire shapes ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigVersion {
    pub version: u64,
    #[serde(default)]
    pub has_update: bool,
    #[serde(default)]
    pub snapshot_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitsPayload {
    #[serde(default)]
    pub rules:        Vec<RateLimitRule>,
    #[serde(default)]
    pub enforcements: Vec<EnforcementDirective>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatPayload {
    pub agent_version:          &'static str,
    pub current_config_version: u64,
    pub status:                 &'static str,
    pub metadata:               serde_json::Value,
}

#[derive(Debug, Serialize)]
struct AckPayload<'a> {
    snapshot_id: &'a str,
    status:      &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaCounterEntry {
    pub kind:       QuotaKind,
    pub dimension:  Dimension,
    pub value:      String,
    pub period:     Period,
    pub period_key: String,
    pub count:      i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemainingEntry {
    pub kind:      QuotaKind,
    pub dimension: Dimension,
    pub value:     String,
    pub period:    Period,
    pub remaining: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuotaSyncResponse {
    #[serde(default)]
    pub remaining:    Vec<RemainingEntry>,
    #[serde(default)]
    pub enforcements: Vec<EnforcementDirective>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RealtimeSession {
    pub user_id:         String,
    pub play_session_id: String,
    pub device_id:       Option<String>,
    pub device_name:     Option<String>,
    pub client_name:     Option<String>,
    pub client_ip:  String,
    pub started_at: i64,
    pub last_seen:  i64,
    pub bytes_sent: u64,
}

#[derive(Serialize)]
struct Entries<'a, T: Serialize> {
    entries: &'a [T],
}

#[derive(Serialize)]
struct Counters<'a> {
    counters: &'a [QuotaCounterEntry],
}

#[derive(Serialize)]
struct Sessions<'a> {
    sessions: &'a [RealtimeSession],
}

// ── Client ────────────────────────────────────────────────────────────────────

pub struct ControlPlaneClient {
    http:           reqwest::Client,
    control_base:   String,
    telemetry_base: String,
}

impl ControlPlaneClient {
    pub fn new(admin_url: &str, app_token: &str) -> Result<Self, ControlError> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("App {app_token}"))
            .map_err(|e| ControlError::Config(e.to_string()))?;
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .timeout(CONTROL_TIMEOUT)
            .user_agent(format!("UHDSlave/{AGENT_VERSION}"))
            .default_headers(headers)
            .build()?;

        let base = admin_url.trim_end_matches('/');
        Ok(Self {
            http,
            control_base:   format!("{base}/api/v1/media-slave"),
            telemetry_base: format!("{base}/api/v1/slave/telemetry"),
        })
    }

    pub async fn get_config_version(&self) -> Result<ConfigVersion, ControlError> {
        let url = format!("{}/config/version", self.control_base);
        let env: Envelope<ConfigVersion> =
            self.http.get(url).send().await?.error_for_status()?.json().await?;
        Ok(env.data)
    }

    pub async fn get_config(&self) -> Result<RemoteConfig, ControlError> {
        let url = format!("{}/config", self.control_base);
        let env: Envelope<RemoteConfig> =
            self.http.get(url).send().await?.error_for_status()?.json().await?;
        Ok(env.data)
    }

    pub async fn ack(&self, snapshot_id: &str) -> Result<(), ControlError> {
        let url = format!("{}/ack", self.control_base);
        self.http
            .post(url)
            .json(&AckPayload { snapshot_id, status: "applied" })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn heartbeat(&self, payload: &HeartbeatPayload) -> Result<(), ControlError> {
        let url = format!("{}/heartbeat", self.control_base);
        self.http.post(url).json(payload).send().await?.error_for_status()?;
        Ok(())
    }

    pub async fn get_rate_limits(&self) -> Result<RateLimitsPayload, ControlError> {
        let url = format!("{}/rate-limits", self.control_base);
        let env: Envelope<RateLimitsPayload> =
            self.http.get(url).send().await?.error_for_status()?.json().await?;
        Ok(env.data)
    }

    pub async fn post_access_logs(&self, entries: &[AccessLogEntry]) -> Result<(), ControlError> {
        let url = format!("{}/access-logs", self.telemetry_base);
        self.http.post(url).json(&Entries { entries }).send().await?.error_for_status()?;
        Ok(())
    }

    pub async fn post_blocked(&self, entries: &[BlockedLogEntry]) -> Result<(), ControlError> {
        let url = format!("{}/blocked-requests", self.telemetry_base);
        self.http.post(url).json(&Entries { entries }).send().await?.error_for_status()?;
        Ok(())
    }

    pub async fn post_login_event(&self, event: &LoginEvent) -> Result<(), ControlError> {
        let url = format!("{}/login", self.telemetry_base);
        self.http.post(url).json(event).send().await?.error_for_status()?;
        Ok(())
    }

    pub async fn post_quota_sync(
        &self,
        counters: &[QuotaCounterEntry],
    ) -> Result<QuotaSyncResponse, ControlError> {
        let url = format!("{}/quota-sync", self.telemetry_base);
        let env: Envelope<QuotaSyncResponse> = self
            .http
            .post(url)
            .json(&Counters { counters })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(env.data)
    }

    pub async fn post_realtime_sessions(
        &self,
        sessions: &[RealtimeSession],
    ) -> Result<(), ControlError> {
        let url = format!("{}/realtime/heartbeat", self.telemetry_base);
        self.http.post(url).json(&Sessions { sessions }).send().await?.error_for_status()?;
        Ok(())
    }
}
