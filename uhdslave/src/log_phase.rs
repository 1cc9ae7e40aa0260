// uhdslave/src/log_phase.rs
//
// Post-response bookkeeping. Runs after the transport has finished sending
// the response, so nothing here can affect the client: store failures are
// logged and swallowed.
//
//   1. access-log entry into the telemetry buffer
//   2. active-session refresh (sliding 90 s TTL, byte accumulation)
//   3. quota counter increments (req +1, bw +bytes; daily and monthly)
//   4. remaining-mirror decrements, only against keys that exist
//
// Counter increments always refresh the period TTL; an expired counter
// simply restarts from absent. Mirror decrements are read-then-write and may
// race with concurrent requests or a sync refresh — the mirrors are
// approximations by design and resynchronise every quota-sync tick.

use std::sync::Arc;

use chrono::Utc;
use tracing::error;

use crate::context::{RequestContext, RequestHead, ResponseMeta};
use crate::engine::quota;
use crate::state::telemetry::TelemetryBuffer;
use crate::store::{keys, KvStore};
use crate::types::{
    AccessLogEntry, ActiveSession, Fingerprint, Period, QuotaKind, ACTIVE_SESSION_TTL_SECS,
};

pub struct LogPhase {
    store:     Arc<dyn KvStore>,
    telemetry: Arc<TelemetryBuffer>,
}

impl LogPhase {
    pub fn new(store: Arc<dyn KvStore>, telemetry: Arc<TelemetryBuffer>) -> Self {
        Self { store, telemetry }
    }

    pub async fn record(&self, head: &RequestHead, ctx: &RequestContext, resp: &ResponseMeta) {
        let now = Utc::now().timestamp();
        let fp = ctx.fingerprint.as_ref();

        self.telemetry.push_access(AccessLogEntry {
            timestamp:        now,
            client_ip:        head.client_ip.to_string(),
            uri:              head.path.clone(),
            method:           head.method.clone(),
            status:           resp.status,
            bytes_sent:       resp.bytes_sent,
            request_time_ms:  resp.request_time_ms,
            upstream_time_ms: resp.upstream_time_ms,
            client_name:      fp.and_then(|f| f.client_name.clone()),
            client_version:   fp.and_then(|f| f.client_version.clone()),
            device_id:        fp.and_then(|f| f.device_id.clone()),
            device_name:      fp.and_then(|f| f.device_name.clone()),
            user_id:          fp.and_then(|f| f.user_id.clone()),
            play_session_id:  fp.and_then(|f| f.play_session_id.clone()),
            user_agent:       ctx.user_agent.clone(),
        });

        let Some(fp) = fp else { return };

        // 2. Session refresh
        if let (Some(user_id), Some(psid)) = (&fp.user_id, &fp.play_session_id) {
            self.refresh_session(user_id, psid, fp, resp, now).await;
        }

        // 3. Quota counters
        let dims = quota::dimensions(fp);
        let now_utc = Utc::now();
        let mut counters: Vec<(String, i64, u64)> = Vec::with_capacity(dims.len() * 4);
        for (dim, value) in &dims {
            for period in Period::COUNTER {
                let period_key = period.period_key(now_utc);
                let ttl = period.counter_ttl_secs();
                counters.push((
                    keys::quota(QuotaKind::Req, *dim, value, period, &period_key),
                    1,
                    ttl,
                ));
                counters.push((
                    keys::quota(QuotaKind::Bw, *dim, value, period, &period_key),
                    resp.bytes_sent as i64,
                    ttl,
                ));
            }
        }
        if let Err(e) = self.store.incr_with_ttl_many(&counters).await {
            error!("quota counter update failed: {}", e);
        }

        // 4. Remaining mirrors — decrement only what exists
        let mirror_keys: Vec<String> = dims
            .iter()
            .flat_map(|(dim, value)| quota::mirror_keys(*dim, value))
            .collect();
        let present = match self.store.mget(&mirror_keys).await {
            Ok(v) => v,
            Err(e) => {
                error!("remaining mirror read failed: {}", e);
                return;
            }
        };
        let deltas: Vec<(String, i64)> = mirror_keys
            .into_iter()
            .zip(present)
            .enumerate()
            .filter(|(_, (_, value))| value.is_some())
            .map(|(i, (key, _))| {
                // per-dimension layout is req × 3 periods then bw × 3 periods
                let is_req = i % 6 < 3;
                (key, if is_req { -1 } else { -(resp.bytes_sent as i64) })
            })
            .collect();
        if let Err(e) = self.store.incr_many(&deltas).await {
            error!("remaining mirror decrement failed: {}", e);
        }
    }

    async fn refresh_session(
        &self,
        user_id: &str,
        psid: &str,
        fp: &Fingerprint,
        resp: &ResponseMeta,
        now: i64,
    ) {
        let key = keys::active_session(user_id, psid);
        let mut session = match self.store.get(&key).await {
            Ok(Some(raw)) => serde_json::from_str::<ActiveSession>(&raw).unwrap_or_else(|_| {
                new_session(fp, now)
            }),
            Ok(None) => new_session(fp, now),
            Err(e) => {
                error!("active_session read failed: {}", e);
                return;
            }
        };
        session.last_seen = now;
        session.bytes_sent = session.bytes_sent.saturating_add(resp.bytes_sent);
        if let Ok(raw) = serde_json::to_string(&session) {
            if let Err(e) = self.store.set_ex(&key, &raw, ACTIVE_SESSION_TTL_SECS).await {
                error!("active_session refresh failed: {}", e);
            }
        }
    }
}

fn new_session(fp: &Fingerprint, now: i64) -> ActiveSession {
    ActiveSession {
        device_id:   fp.device_id.clone(),
        device_name: fp.device_name.clone(),
        client_name: fp.client_name.clone(),
        client_ip:   fp.client_ip.to_string(),
        started_at:  now,
        last_seen:   now,
        bytes_sent:  0,
    }
}
