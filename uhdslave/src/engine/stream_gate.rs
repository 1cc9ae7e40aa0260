// uhdslave/src/engine/stream_gate.rs
//
// Stage 7: concurrent-stream admission. Only runs when the request carries
// both a user and a play session. A session that already has its
// `active_session` record is a continuation and passes without counting.
// New sessions count the user's live records by pattern scan; at or over the
// cap they are denied, otherwise the record is written with a 90 s TTL.
//
// Two requests admitting the same (user, psid) can race the existence check;
// both writing the record is harmless (the TTLs unify) and over-admission is
// bounded by the record TTL. The gate is per-instance — the session
// heartbeat gives the control plane the global view.

use chrono::Utc;
use tracing::error;

use crate::config::Snapshot;
use crate::context::{RequestContext, RequestHead};
use crate::engine::blocked_entry;
use crate::state::telemetry::TelemetryBuffer;
use crate::store::{keys, KvStore};
use crate::types::{ActiveSession, Denial, DenyReason, Fingerprint, ACTIVE_SESSION_TTL_SECS};

pub async fn check(
    store: &dyn KvStore,
    snapshot: &Snapshot,
    fp: &Fingerprint,
    ctx: &mut RequestContext,
    head: &RequestHead,
    telemetry: &TelemetryBuffer,
) -> Option<Denial> {
    let max_streams = snapshot.policy.max_streams;
    if max_streams == 0 {
        return None;
    }
    let (Some(user_id), Some(psid)) = (&fp.user_id, &fp.play_session_id) else {
        return None;
    };

    let key = keys::active_session(user_id, psid);
    match store.exists(&key).await {
        Ok(true) => {
            ctx.session_continued = true;
            return None;
        }
        Ok(false) => {}
        Err(e) => {
            error!("active_session existence check failed: {}", e);
            return None;
        }
    }

    let live = match store.scan(&keys::active_session_pattern(user_id), 100).await {
        Ok(keys) => keys.len() as u32,
        Err(e) => {
            error!("active_session count failed: {}", e);
            return None;
        }
    };
    if live >= max_streams {
        let denial = Denial::too_many(
            DenyReason::ConcurrentStreamLimit,
            snapshot.policy.stream_limit_message.clone(),
        );
        telemetry.push_blocked(blocked_entry(head, Some(fp), &denial, None));
        return Some(denial);
    }

    let now = Utc::now().timestamp();
    let session = ActiveSession {
        device_id:   fp.device_id.clone(),
        device_name: fp.device_name.clone(),
        client_name: fp.client_name.clone(),
        client_ip:   fp.client_ip.to_string(),
        started_at:  now,
        last_seen:   now,
        bytes_sent:  0,
    };
    if let Ok(raw) = serde_json::to_string(&session) {
        if let Err(e) = store.set_ex(&key, &raw, ACTIVE_SESSION_TTL_SECS).await {
            error!("active_session write failed: {}", e);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigCache, PolicyConfig, RemoteConfig};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn snapshot(max_streams: u32) -> Arc<Snapshot> {
        let mut policy = PolicyConfig::default();
        policy.max_streams = max_streams;
        let cache = ConfigCache::new();
        cache.apply(RemoteConfig {
            version: 1,
            service_type: None,
            policy: Some(policy),
            rate_limit_config: None,
        })
    }

    fn fingerprint(psid: &str) -> Fingerprint {
        Fingerprint {
            client_ip: "10.0.0.1".parse().unwrap(),
            client_name: Some("Infuse".into()),
            client_version: None,
            device_id: Some("D1".into()),
            device_name: None,
            user_id: Some("U1".into()),
            token: None,
            play_session_id: Some(psid.into()),
            uri: "/Videos/abc/stream".into(),
            method: "GET".into(),
        }
    }

    fn head() -> RequestHead {
        RequestHead::new("GET", "/Videos/abc/stream", vec![], "10.0.0.1".parse().unwrap())
    }

    #[tokio::test]
    async fn admission_writes_the_session_record() {
        let store = MemoryStore::new();
        let telemetry = TelemetryBuffer::new();
        let mut ctx = RequestContext::default();
        let denial = check(&store, &snapshot(2), &fingerprint("P1"), &mut ctx, &head(), &telemetry).await;
        assert!(denial.is_none());
        assert!(store.exists("active_session:U1:P1").await.unwrap());
        let ttl = store.ttl_of("active_session:U1:P1").unwrap();
        assert!(ttl > 80 && ttl <= 90);
    }

    #[tokio::test]
    async fn at_cap_new_sessions_are_denied() {
        let store = MemoryStore::new();
        store.set_ex("active_session:U1:P1", "{}", 90).await.unwrap();
        store.set_ex("active_session:U1:P2", "{}", 90).await.unwrap();
        let telemetry = TelemetryBuffer::new();
        let mut ctx = RequestContext::default();
        let denial = check(&store, &snapshot(2), &fingerprint("P3"), &mut ctx, &head(), &telemetry)
            .await
            .unwrap();
        assert_eq!(denial.status, 429);
        assert_eq!(denial.reason, DenyReason::ConcurrentStreamLimit);
        assert!(!store.exists("active_session:U1:P3").await.unwrap());
        assert_eq!(telemetry.blocked_len(), 1);
    }

    #[tokio::test]
    async fn continuation_skips_the_count() {
        let store = MemoryStore::new();
        store.set_ex("active_session:U1:P1", "{}", 90).await.unwrap();
        store.set_ex("active_session:U1:P2", "{}", 90).await.unwrap();
        store.set_ex("active_session:U1:P3", "{}", 90).await.unwrap();
        let telemetry = TelemetryBuffer::new();
        let mut ctx = RequestContext::default();
        // three live sessions with a cap of two, but P1 is a continuation
        let denial = check(&store, &snapshot(2), &fingerprint("P1"), &mut ctx, &head(), &telemetry).await;
        assert!(denial.is_none());
        assert!(ctx.session_continued);
    }

    #[tokio::test]
    async fn gate_disabled_when_max_streams_is_zero() {
        let store = MemoryStore::new();
        let telemetry = TelemetryBuffer::new();
        let mut ctx = RequestContext::default();
        let denial = check(&store, &snapshot(0), &fingerprint("P1"), &mut ctx, &head(), &telemetry).await;
        assert!(denial.is_none());
        assert!(!store.exists("active_session:U1:P1").await.unwrap());
    }
}
