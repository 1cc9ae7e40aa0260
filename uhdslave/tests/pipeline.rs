// uhdslave/tests/pipeline.rs
//
// End-to-end pipeline scenarios over the in-memory store: the access phase,
// the log phase, and login capture wired together the way the transport
// wires them in production.

use std::sync::Arc;

use uhdslave::config::{ConfigCache, PolicyConfig, RateLimitConfig, RemoteConfig};
use uhdslave::context::{RequestContext, RequestHead, ResponseMeta};
use uhdslave::engine::AccessPipeline;
use uhdslave::log_phase::LogPhase;
use uhdslave::login_capture::{should_capture, LoginCapture};
use uhdslave::state::limits::LocalLimits;
use uhdslave::state::telemetry::TelemetryBuffer;
use uhdslave::state::GatewayStats;
use uhdslave::store::{KvStore, MemoryStore};
use uhdslave::types::{
    AccessDecision, Dimension, OverAction, RateLimitRule, TokenRecord,
};

struct Gateway {
    store:     Arc<MemoryStore>,
    config:    Arc<ConfigCache>,
    telemetry: Arc<TelemetryBuffer>,
    pipeline:  AccessPipeline,
    log_phase: LogPhase,
}

fn gateway(policy: Option<PolicyConfig>, rules: Vec<RateLimitRule>) -> Gateway {
    let store = Arc::new(MemoryStore::new());
    let kv: Arc<dyn KvStore> = store.clone();
    let config = Arc::new(ConfigCache::new());
    let telemetry = Arc::new(TelemetryBuffer::new());
    let limits = Arc::new(LocalLimits::new());
    let stats = Arc::new(GatewayStats::new());

    if policy.is_some() || !rules.is_empty() {
        config.apply(RemoteConfig {
            version: 1,
            service_type: Some("emby".into()),
            policy,
            rate_limit_config: Some(RateLimitConfig { rules, enforcements: vec![] }),
        });
    }

    let pipeline = AccessPipeline::new(
        kv.clone(),
        config.clone(),
        limits,
        telemetry.clone(),
        stats,
    );
    let log_phase = LogPhase::new(kv, telemetry.clone());
    Gateway { store, config, telemetry, pipeline, log_phase }
}

fn stream_head(psid: &str, token: &str) -> RequestHead {
    RequestHead::new(
        "GET",
        &format!("/Videos/abc/stream?PlaySessionId={psid}&api_key={token}"),
        vec![("User-Agent".into(), "Infuse/7.9.1".into())],
        "10.1.1.1".parse().unwrap(),
    )
}

async fn seed_token(store: &MemoryStore, token: &str, user: &str) {
    let record = TokenRecord {
        user_id: user.into(),
        username: "alice".into(),
        device_id: Some("D1".into()),
        device_name: None,
        client_name: Some("Infuse".into()),
        client_version: None,
        client_ip: None,
        login_time: 0,
        is_admin: false,
    };
    store
        .set_ex(
            &format!("token_map:{token}"),
            &serde_json::to_string(&record).unwrap(),
            7 * 86_400,
        )
        .await
        .unwrap();
}

fn streaming_policy(max_streams: u32) -> PolicyConfig {
    let mut policy = PolicyConfig::default();
    policy.max_streams = max_streams;
    policy
}

#[tokio::test]
async fn cold_start_allows_everything() {
    let gw = gateway(None, vec![]);
    let mut ctx = RequestContext::default();
    let head = RequestHead::new("GET", "/anything", vec![], "10.1.1.1".parse().unwrap());
    assert!(gw.pipeline.evaluate(&head, &mut ctx).await.is_allow());
    assert!(ctx.fingerprint.is_none());
}

#[tokio::test]
async fn stream_request_is_admitted_and_logged() {
    let gw = gateway(Some(streaming_policy(2)), vec![]);
    seed_token(&gw.store, "T", "U").await;

    let head = stream_head("P1", "T");
    let mut ctx = RequestContext::default();
    let decision = gw.pipeline.evaluate(&head, &mut ctx).await;
    assert!(decision.is_allow());

    // identity resolved through the token map
    let fp = ctx.fingerprint.as_ref().unwrap();
    assert_eq!(fp.user_id.as_deref(), Some("U"));

    // admission record with the sliding TTL
    let ttl = gw.store.ttl_of("active_session:U:P1").unwrap();
    assert!(ttl > 80 && ttl <= 90);

    gw.log_phase
        .record(&head, &ctx, &ResponseMeta { status: 200, bytes_sent: 4096, request_time_ms: 20, upstream_time_ms: 15 })
        .await;
    let access = gw.telemetry.drain_access(10, chrono::Utc::now().timestamp());
    assert_eq!(access.len(), 1);
    assert_eq!(access[0].user_id.as_deref(), Some("U"));
    assert_eq!(access[0].bytes_sent, 4096);
}

#[tokio::test]
async fn third_stream_is_rejected_at_cap_two() {
    let gw = gateway(Some(streaming_policy(2)), vec![]);
    seed_token(&gw.store, "T", "U").await;
    gw.store.set_ex("active_session:U:P1", "{\"client_ip\":\"x\",\"started_at\":0,\"last_seen\":0}", 90).await.unwrap();
    gw.store.set_ex("active_session:U:P2", "{\"client_ip\":\"x\",\"started_at\":0,\"last_seen\":0}", 90).await.unwrap();

    let mut ctx = RequestContext::default();
    let decision = gw.pipeline.evaluate(&stream_head("P3", "T"), &mut ctx).await;
    let AccessDecision::Deny(denial) = decision else { panic!("expected denial") };
    assert_eq!(denial.status, 429);

    let blocked = gw.telemetry.drain_blocked(10, chrono::Utc::now().timestamp());
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].reason, "concurrent_stream_limit");
}

#[tokio::test]
async fn fake_counts_never_reach_upstream() {
    let mut policy = PolicyConfig::default();
    policy.fake_counts_enabled = true;
    policy.fake_counts_value = 42;
    let gw = gateway(Some(policy), vec![]);

    let head = RequestHead::new("GET", "/Items/Counts", vec![], "10.1.1.1".parse().unwrap());
    let mut ctx = RequestContext::default();
    let AccessDecision::Synthetic(resp) = gw.pipeline.evaluate(&head, &mut ctx).await else {
        panic!("expected synthetic response");
    };
    assert_eq!(resp.status, 200);
    let body: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
    for (_, value) in body.as_object().unwrap() {
        assert_eq!(value.as_i64(), Some(42));
    }
}

#[tokio::test]
async fn login_capture_learns_the_token_binding() {
    let gw = gateway(Some(PolicyConfig::default()), vec![]);
    let kv: Arc<dyn KvStore> = gw.store.clone();
    let capture = LoginCapture::new(kv);

    let head = RequestHead::new(
        "POST",
        "/Users/AuthenticateByName",
        vec![(
            "X-Emby-Authorization".into(),
            r#"MediaBrowser Client="Emby Web", Device="iPhone", DeviceId="D2", Version="4.8""#.into(),
        )],
        "10.1.1.9".parse().unwrap(),
    );
    let mut ctx = RequestContext::default();
    assert!(gw.pipeline.evaluate(&head, &mut ctx).await.is_allow());

    assert!(should_capture(&head.method, &head.path, 200));
    let body = serde_json::json!({
        "AccessToken": "T2",
        "User": { "Id": "U2", "Name": "alice" },
    })
    .to_string();
    capture
        .on_body_complete(ctx.fingerprint.as_ref().unwrap(), body.as_bytes())
        .await;

    let record: TokenRecord = serde_json::from_str(
        &gw.store.get("token_map:T2").await.unwrap().unwrap(),
    )
    .unwrap();
    assert_eq!(record.user_id, "U2");
    assert_eq!(record.username, "alice");
    assert_eq!(record.device_id.as_deref(), Some("D2"));
    assert_eq!(record.device_name.as_deref(), Some("iPhone"));
    assert_eq!(gw.store.scan("token_report:*", 100).await.unwrap().len(), 1);

    // the learned binding now resolves the user on the next request
    let next = stream_head("P9", "T2");
    let mut ctx = RequestContext::default();
    assert!(gw.pipeline.evaluate(&next, &mut ctx).await.is_allow());
    assert_eq!(ctx.fingerprint.unwrap().user_id.as_deref(), Some("U2"));
}

#[tokio::test]
async fn outdated_whitelisted_client_gets_the_upgrade_message() {
    let mut policy = PolicyConfig::default();
    policy.client_whitelist = vec!["Infuse".into()];
    policy.min_versions = [("Infuse".to_string(), "7.9.0".to_string())].into();
    let gw = gateway(Some(policy), vec![]);

    let head = RequestHead::new(
        "GET",
        "/anything",
        vec![("User-Agent".into(), "Infuse/7.8.1 CFNetwork".into())],
        "10.1.1.1".parse().unwrap(),
    );
    let mut ctx = RequestContext::default();
    let AccessDecision::Deny(denial) = gw.pipeline.evaluate(&head, &mut ctx).await else {
        panic!("expected denial");
    };
    assert_eq!(denial.status, 403);
    assert_eq!(denial.message, "请使用 Infuse 7.9.0 或更高版本进行访问");
    let blocked = gw.telemetry.drain_blocked(10, chrono::Utc::now().timestamp());
    assert_eq!(blocked[0].reason, "version_too_old");
}

#[tokio::test]
async fn token_bucket_rejects_after_the_burst() {
    let rule = RateLimitRule {
        id: "ip-rps".into(),
        apply_to: Dimension::Ip,
        apply_value: Some("*".into()),
        rate_per_second: Some(10),
        rate_burst: Some(10),
        rate_per_minute: None,
        over_action: OverAction::Reject,
        throttle_rate_bps: None,
    };
    let gw = gateway(Some(PolicyConfig::default()), vec![rule]);

    let head = RequestHead::new("GET", "/anything", vec![], "10.1.1.1".parse().unwrap());
    let mut denied = 0;
    for _ in 0..20 {
        let mut ctx = RequestContext::default();
        match gw.pipeline.evaluate(&head, &mut ctx).await {
            AccessDecision::Allow => {}
            AccessDecision::Deny(denial) => {
                assert_eq!(denial.status, 429);
                denied += 1;
            }
            AccessDecision::Synthetic(_) => panic!("unexpected synthetic response"),
        }
    }
    // the first 10 of a fresh second always pass, excess is rejected
    assert!(denied >= 9, "expected most of the overflow rejected, got {denied}");
    assert_eq!(gw.config.version(), 1);
}
