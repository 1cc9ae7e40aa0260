// uhdslave/src/login_capture.rs
//
// Inline login-response interception.
//
// Two phases, driven by the transport: the header phase decides whether this
// response is worth capturing (authentication endpoint, status 200); the
// body phase accumulates response chunks and, once complete, learns the
// token→user binding from the JSON. The response bytes themselves are only
// read — they are forwarded to the client untouched, and any parse failure
// is logged and dropped.
//
// A successful capture writes two records: the `token_map` binding the
// identity extractor resolves against, and a short-lived `token_report`
// entry the telemetry flush loop turns into a login event upstream.

use std::sync::Arc;
use std::sync::LazyLock;

use bytes::Bytes;
use chrono::Utc;
use regex::RegexBuilder;
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::store::{keys, KvStore};
use crate::types::{
    Fingerprint, LoginEvent, TokenRecord, TOKEN_MAP_TTL_SECS, TOKEN_REPORT_TTL_SECS,
};

/// Response bodies larger than this abandon capture rather than buffer on.
const MAX_BODY_BYTES: usize = 1 << 20;

static RE_LOGIN_PATH: LazyLock<regex::Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"/Users/(AuthenticateByName|AuthenticateWithQuickConnect)$")
        .case_insensitive(true)
        .build()
        .expect("static regex")
});

/// Header-phase predicate: capture only successful authentication responses.
pub fn should_capture(method: &str, path: &str, status: u16) -> bool {
    status == 200 && method.eq_ignore_ascii_case("POST") && RE_LOGIN_PATH.is_match(path)
}

// ── Body accumulation ─────────────────────────────────────────────────────────

/// Collects response chunks for a marked request. Oversized bodies flip the
/// accumulator into a pass-through that keeps nothing.
#[derive(Default)]
pub struct BodyAccumulator {
    buf:        Vec<u8>,
    overflowed: bool,
}

impl BodyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &Bytes) {
        if self.overflowed {
            return;
        }
        if self.buf.len() + chunk.len() > MAX_BODY_BYTES {
            warn!("Login response body exceeded {} bytes — capture abandoned", MAX_BODY_BYTES);
            self.buf.clear();
            self.overflowed = true;
            return;
        }
        self.buf.extend_from_slice(chunk);
    }

    pub fn finish(self) -> Option<Vec<u8>> {
        (!self.overflowed).then_some(self.buf)
    }
}

// ── Wire shapes (Emby authentication response) ────────────────────────────────

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(rename = "AccessToken")]
    access_token: Option<String>,
    #[serde(rename = "User")]
    user: Option<AuthUser>,
    #[serde(rename = "SessionInfo")]
    session_info: Option<AuthSession>,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    #[serde(rename = "Id")]
    id: Option<String>,
    #[serde(rename = "Name")]
    name: Option<String>,
    #[serde(rename = "Policy")]
    policy: Option<AuthPolicy>,
}

#[derive(Debug, Deserialize)]
struct AuthPolicy {
    #[serde(rename = "IsAdministrator", default)]
    is_administrator: bool,
}

#[derive(Debug, Deserialize)]
struct AuthSession {
    #[serde(rename = "DeviceId")]
    device_id: Option<String>,
    #[serde(rename = "DeviceName")]
    device_name: Option<String>,
    #[serde(rename = "Client")]
    client: Option<String>,
    #[serde(rename = "ApplicationVersion")]
    application_version: Option<String>,
}

// ── Capture ───────────────────────────────────────────────────────────────────

pub struct LoginCapture {
    store: Arc<dyn KvStore>,
}

impl LoginCapture {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Body-phase completion. `fp` carries the request-side identity; the
    /// response body supplies the token and user. Never errors out to the
    /// transport.
    pub async fn on_body_complete(&self, fp: &Fingerprint, body: &[u8]) {
        let auth: AuthResponse = match serde_json::from_slice(body) {
            Ok(a) => a,
            Err(e) => {
                warn!("Ignoring unparseable login response body: {}", e);
                return;
            }
        };

        let Some(token) = auth.access_token.filter(|t| !t.is_empty()) else {
            return;
        };
        let Some(user_id) = auth.user.as_ref().and_then(|u| u.id.clone()).filter(|u| !u.is_empty())
        else {
            return;
        };
        let username = auth
            .user
            .as_ref()
            .and_then(|u| u.name.clone())
            .unwrap_or_default();
        let is_admin = auth
            .user
            .as_ref()
            .and_then(|u| u.policy.as_ref())
            .map(|p| p.is_administrator)
            .unwrap_or(false);
        let session = auth.session_info;

        // Response-side session info wins; request headers fill the gaps
        let record = TokenRecord {
            user_id:  user_id.clone(),
            username: username.clone(),
            device_id: session
                .as_ref()
                .and_then(|s| s.device_id.clone())
                .or_else(|| fp.device_id.clone()),
            device_name: session
                .as_ref()
                .and_then(|s| s.device_name.clone())
                .or_else(|| fp.device_name.clone()),
            client_name: session
                .as_ref()
                .and_then(|s| s.client.clone())
                .or_else(|| fp.client_name.clone()),
            client_version: session
                .as_ref()
                .and_then(|s| s.application_version.clone())
                .or_else(|| fp.client_version.clone()),
            client_ip:  Some(fp.client_ip.to_string()),
            login_time: Utc::now().timestamp(),
            is_admin,
        };

        let Ok(raw) = serde_json::to_string(&record) else { return };
        if let Err(e) = self
            .store
            .set_ex(&keys::token_map(&token), &raw, TOKEN_MAP_TTL_SECS)
            .await
        {
            error!("token_map write failed: {}", e);
            return;
        }

        let event = LoginEvent {
            event_type:     "login".to_string(),
            emby_user_id:   user_id,
            emby_username:  username,
            device_id:      record.device_id.clone(),
            device_name:    record.device_name.clone(),
            client_name:    record.client_name.clone(),
            client_version: record.client_version.clone(),
            client_ip:      fp.client_ip.to_string(),
            success:        true,
        };
        let report_key = keys::token_report(Utc::now().timestamp(), rand::random::<u32>());
        if let Ok(raw) = serde_json::to_string(&event) {
            if let Err(e) = self.store.set_ex(&report_key, &raw, TOKEN_REPORT_TTL_SECS).await {
                error!("token_report write failed: {}", e);
            }
        }
        debug!(user = %record.user_id, "login captured");
    }
}
