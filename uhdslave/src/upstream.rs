// uhdslave/src/upstream.rs
//
// Optional upstream media-server API client, used only by the token-resolve
// loop to learn device→user bindings from live sessions. 5 s deadline; an
// unreachable upstream just skips that tick.

use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use std::time::Duration;

use crate::control_plane::ControlError;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
pub struct EmbySession {
    #[serde(rename = "UserId", default)]
    pub user_id: Option<String>,
    #[serde(rename = "UserName", default)]
    pub user_name: Option<String>,
    #[serde(rename = "DeviceId", default)]
    pub device_id: Option<String>,
    #[serde(rename = "DeviceName", default)]
    pub device_name: Option<String>,
    #[serde(rename = "Client", default)]
    pub client: Option<String>,
    #[serde(rename = "ApplicationVersion", default)]
    pub application_version: Option<String>,
}

pub struct UpstreamClient {
    http: reqwest::Client,
    base: String,
}

impl UpstreamClient {
    pub fn new(server_url: &str, api_key: &str) -> Result<Self, ControlError> {
        let mut headers = HeaderMap::new();
        let token = HeaderValue::from_str(api_key).map_err(|e| ControlError::Config(e.to_string()))?;
        headers.insert("X-Emby-Token", token);
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .default_headers(headers)
            .build()?;
        Ok(Self { http, base: server_url.trim_end_matches('/').to_string() })
    }

    pub async fn sessions(&self) -> Result<Vec<EmbySession>, ControlError> {
        let url = format!("{}/emby/Sessions", self.base);
        let sessions = self.http.get(url).send().await?.error_for_status()?.json().await?;
        Ok(sessions)
    }
}
