// uhdslave/src/identity.rs
//
// Identity extraction — reconstructs (client, device, user, token) from the
// heterogeneous header shapes Emby/Jellyfin clients actually send.
//
// Each field is resolved by an ordered list of sources; the first non-empty
// value wins. Quoted key="value" pairs inside the authorization headers are
// matched quote-aware (device names may contain commas). Values arriving via
// query parameters are URL-decoded by `RequestHead`.
//
// Back-fill runs after extraction: a token learned at login resolves the
// user even when the client stops sending UserId, and a device seen by the
// sessions poller resolves users for token-less legacy clients.

use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::context::RequestHead;
use crate::store::{keys, KvStore};
use crate::types::{
    DeviceUserRecord, Fingerprint, TokenRecord, DEVICE_USER_TTL_SECS, TOKEN_MAP_TTL_SECS,
};

// ── Quoted-pair extraction ────────────────────────────────────────────────────

static RE_CLIENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?:^|[ ,])Client="([^"]*)""#).expect("static regex"));
static RE_DEVICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?:^|[ ,])Device="([^"]*)""#).expect("static regex"));
static RE_DEVICE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?:^|[ ,])DeviceId="([^"]*)""#).expect("static regex"));
static RE_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?:^|[ ,])Version="([^"]*)""#).expect("static regex"));
static RE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?:^|[ ,])Token="([^"]*)""#).expect("static regex"));
static RE_USER_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?:^|[ ,])UserId="([^"]*)""#).expect("static regex"));

static RE_UA_VER3: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.\d+\.\d+").expect("static regex"));
static RE_UA_VER2: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.\d+").expect("static regex"));

fn quoted(re: &Regex, value: &str) -> Option<String> {
    re.captures(value)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|s| !s.is_empty())
}

/// Look through `X-Emby-Authorization` then `Authorization` for a quoted pair.
fn auth_param(head: &RequestHead, re: &Regex) -> Option<String> {
    head.header("X-Emby-Authorization")
        .and_then(|v| quoted(re, v))
        .or_else(|| head.header("Authorization").and_then(|v| quoted(re, v)))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

// ── Per-field source chains ───────────────────────────────────────────────────

fn client_name(head: &RequestHead) -> Option<String> {
    auth_param(head, &RE_CLIENT)
        .or_else(|| non_empty(head.header("X-Emby-Client")))
        .or_else(|| non_empty(head.query_param("X-Emby-Client")))
        .or_else(|| ua_client_name(head.user_agent()?))
}

fn ua_client_name(ua: &str) -> Option<String> {
    let (name, _) = ua.split_once('/')?;
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn client_version(head: &RequestHead) -> Option<String> {
    auth_param(head, &RE_VERSION)
        .or_else(|| non_empty(head.header("X-Emby-Client-Version")))
        .or_else(|| non_empty(head.query_param("X-Emby-Client-Version")))
        .or_else(|| ua_version(head.user_agent()?))
}

fn ua_version(ua: &str) -> Option<String> {
    RE_UA_VER3
        .find(ua)
        .or_else(|| RE_UA_VER2.find(ua))
        .map(|m| m.as_str().to_string())
}

fn device_id(head: &RequestHead) -> Option<String> {
    auth_param(head, &RE_DEVICE_ID)
        .or_else(|| non_empty(head.query_param("DeviceId")))
        .or_else(|| non_empty(head.query_param("deviceId")))
}

fn device_name(head: &RequestHead) -> Option<String> {
    auth_param(head, &RE_DEVICE)
}

fn user_id(head: &RequestHead) -> Option<String> {
    auth_param(head, &RE_USER_ID)
        .or_else(|| non_empty(head.query_param("UserId")))
        .or_else(|| non_empty(head.query_param("userId")))
}

fn token(head: &RequestHead) -> Option<String> {
    non_empty(head.header("X-Emby-Token"))
        .or_else(|| auth_param(head, &RE_TOKEN))
        .or_else(|| non_empty(head.query_param("X-Emby-Token")))
        .or_else(|| non_empty(head.query_param("api_key")))
}

fn play_session_id(head: &RequestHead) -> Option<String> {
    non_empty(head.query_param("PlaySessionId"))
        .or_else(|| non_empty(head.query_param("playSessionId")))
}

/// Extract the request fingerprint from headers and query.
pub fn extract(head: &RequestHead) -> Fingerprint {
    Fingerprint {
        client_ip:       head.client_ip,
        client_name:     client_name(head),
        client_version:  client_version(head),
        device_id:       device_id(head),
        device_name:     device_name(head),
        user_id:         user_id(head),
        token:           token(head),
        play_session_id: play_session_id(head),
        uri:             head.path.clone(),
        method:          head.method.clone(),
    }
}

// ── Version comparison ────────────────────────────────────────────────────────

fn version_components(v: &str) -> Vec<u64> {
    let mut out = Vec::new();
    let mut current = String::new();
    for c in v.chars() {
        if c.is_ascii_digit() {
            current.push(c);
        } else if !current.is_empty() {
            out.extend(current.parse::<u64>().ok());
            current.clear();
        }
    }
    if !current.is_empty() {
        out.extend(current.parse::<u64>().ok());
    }
    out
}

/// Numeric component-wise version comparison: `current >= required`, shorter
/// side zero-padded. Anything without a single numeric component fails.
pub fn is_sufficient(current: &str, required: &str) -> bool {
    let cur = version_components(current);
    let req = version_components(required);
    if cur.is_empty() || req.is_empty() {
        return false;
    }
    let len = cur.len().max(req.len());
    for i in 0..len {
        let c = cur.get(i).copied().unwrap_or(0);
        let r = req.get(i).copied().unwrap_or(0);
        if c != r {
            return c > r;
        }
    }
    true
}

// ── Back-fill ─────────────────────────────────────────────────────────────────

/// Resolve missing identity fields from the store. Store failures degrade to
/// "no data" — this step never denies and never errors.
pub async fn backfill(fp: &mut Fingerprint, store: &dyn KvStore) {
    if let Some(token) = fp.token.clone() {
        let key = keys::token_map(&token);
        if fp.user_id.is_none() {
            match store.get(&key).await {
                Ok(Some(raw)) => match serde_json::from_str::<TokenRecord>(&raw) {
                    Ok(rec) => {
                        fp.user_id = Some(rec.user_id);
                        if fp.device_id.is_none() {
                            fp.device_id = rec.device_id;
                        }
                        if fp.device_name.is_none() {
                            fp.device_name = rec.device_name;
                        }
                        if fp.client_name.is_none() {
                            fp.client_name = rec.client_name;
                        }
                        let _ = store.expire(&key, TOKEN_MAP_TTL_SECS).await;
                    }
                    Err(e) => warn!("Ignoring malformed token_map record: {}", e),
                },
                Ok(None) => {}
                Err(e) => tracing::error!("token_map lookup failed: {}", e),
            }
        } else {
            // Known user — keep the binding warm
            let _ = store.expire(&key, TOKEN_MAP_TTL_SECS).await;
        }
    }

    if fp.user_id.is_none() {
        if let Some(device_id) = fp.device_id.clone() {
            let key = keys::device_user(&device_id);
            match store.get(&key).await {
                Ok(Some(raw)) => match serde_json::from_str::<DeviceUserRecord>(&raw) {
                    Ok(rec) => {
                        fp.user_id = Some(rec.user_id);
                        if fp.device_name.is_none() {
                            fp.device_name = rec.device_name;
                        }
                        let _ = store.expire(&key, DEVICE_USER_TTL_SECS).await;
                    }
                    Err(e) => warn!("Ignoring malformed device_user record: {}", e),
                },
                Ok(None) => {}
                Err(e) => tracing::error!("device_user lookup failed: {}", e),
            }
        }
    }
}
