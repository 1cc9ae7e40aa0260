// uhdslave/src/engine/enforcement.rs
//
// Stage 4: control-plane enforcement directives. One pipelined read over
// `enforce:<dim>:<val>` for the dimensions this request carries. A reject
// directive denies with 403 and the directive's reason; a throttle directive
// stashes its bytes-per-second cap on the request context and evaluation
// continues. Store failures and malformed directives read as "no directive".

use tracing::{error, warn};

use crate::context::{RequestContext, RequestHead};
use crate::engine::blocked_entry;
use crate::state::telemetry::TelemetryBuffer;
use crate::store::{keys, KvStore};
use crate::types::{Denial, DenyReason, Dimension, EnforceAction, EnforcementDirective, Fingerprint};

fn default_reject_message() -> String {
    "访问已被管理员限制".to_string()
}

pub async fn check(
    store: &dyn KvStore,
    fp: &Fingerprint,
    ctx: &mut RequestContext,
    head: &RequestHead,
    telemetry: &TelemetryBuffer,
) -> Option<Denial> {
    let mut lookups: Vec<(Dimension, String)> =
        vec![(Dimension::Ip, fp.client_ip.to_string())];
    if let Some(user) = &fp.user_id {
        lookups.push((Dimension::User, user.clone()));
    }
    if let Some(device) = &fp.device_id {
        lookups.push((Dimension::Device, device.clone()));
    }

    let key_list: Vec<String> =
        lookups.iter().map(|(dim, val)| keys::enforce(*dim, val)).collect();
    let values = match store.mget(&key_list).await {
        Ok(v) => v,
        Err(e) => {
            error!("enforcement lookup failed: {}", e);
            return None;
        }
    };

    for ((dim, _), raw) in lookups.iter().zip(values) {
        let Some(raw) = raw else { continue };
        let directive: EnforcementDirective = match serde_json::from_str(&raw) {
            Ok(d) => d,
            Err(e) => {
                warn!(dimension = %dim, "Ignoring malformed enforcement directive: {}", e);
                continue;
            }
        };
        match directive.action {
            EnforceAction::Reject => {
                let message = directive.reason.unwrap_or_else(default_reject_message);
                let denial = Denial::forbidden(DenyReason::EnforcementReject, message);
                telemetry.push_blocked(blocked_entry(head, Some(fp), &denial, None));
                return Some(denial);
            }
            EnforceAction::Throttle => {
                if let Some(bps) = directive.throttle_rate_bps {
                    ctx.throttle_rate_bps.get_or_insert(bps);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            client_ip: "10.0.0.1".parse().unwrap(),
            client_name: None,
            client_version: None,
            device_id: Some("D1".into()),
            device_name: None,
            user_id: Some("U1".into()),
            token: None,
            play_session_id: None,
            uri: "/x".into(),
            method: "GET".into(),
        }
    }

    fn head() -> RequestHead {
        RequestHead::new("GET", "/x", vec![], "10.0.0.1".parse().unwrap())
    }

    async fn put_directive(store: &MemoryStore, key: &str, directive: &EnforcementDirective) {
        store
            .set_ex(key, &serde_json::to_string(directive).unwrap(), 600)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reject_directive_denies_with_its_reason() {
        let store = MemoryStore::new();
        put_directive(
            &store,
            "enforce:user:U1",
            &EnforcementDirective {
                dimension: Dimension::User,
                dimension_value: "U1".into(),
                action: EnforceAction::Reject,
                reason: Some("流量异常".into()),
                throttle_rate_bps: None,
                effective_until: None,
            },
        )
        .await;

        let telemetry = TelemetryBuffer::new();
        let mut ctx = RequestContext::default();
        let denial = check(&store, &fingerprint(), &mut ctx, &head(), &telemetry)
            .await
            .unwrap();
        assert_eq!(denial.status, 403);
        assert_eq!(denial.message, "流量异常");
        assert_eq!(telemetry.blocked_len(), 1);
    }

    #[tokio::test]
    async fn throttle_directive_stashes_and_continues() {
        let store = MemoryStore::new();
        put_directive(
            &store,
            "enforce:ip:10.0.0.1",
            &EnforcementDirective {
                dimension: Dimension::Ip,
                dimension_value: "10.0.0.1".into(),
                action: EnforceAction::Throttle,
                reason: None,
                throttle_rate_bps: Some(1_048_576),
                effective_until: None,
            },
        )
        .await;

        let telemetry = TelemetryBuffer::new();
        let mut ctx = RequestContext::default();
        let denial = check(&store, &fingerprint(), &mut ctx, &head(), &telemetry).await;
        assert!(denial.is_none());
        assert_eq!(ctx.throttle_rate_bps, Some(1_048_576));
    }

    #[tokio::test]
    async fn malformed_directive_is_ignored() {
        let store = MemoryStore::new();
        store.set_ex("enforce:device:D1", "{broken", 600).await.unwrap();
        let telemetry = TelemetryBuffer::new();
        let mut ctx = RequestContext::default();
        assert!(check(&store, &fingerprint(), &mut ctx, &head(), &telemetry).await.is_none());
    }
}
