// uhdslave/src/store.rs
//
// Redis-compatible store client.
//
// `KvStore` is the seam between the gateway and the store: the pipeline, the
// log phase, and the agent only speak this trait. `RedisStore` is the
// production backend (connection manager + pipelined batches, every operation
// under a 1 s deadline); `MemoryStore` implements the same contract in
// process with TTL bookkeeping, for tests and store-less local runs.
//
// Key shapes live in `keys` — no other module synthesises store keys.
//
// The store is not transactional: a pipeline submits its commands in order,
// but commands from concurrent pipelines interleave. Callers tolerate torn
// pairs (e.g. a quota req key without its bw counterpart).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::debug;

pub const OP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("store error: {0}")]
    Redis(#[from] redis::RedisError),
}

// ── Key shapes ────────────────────────────────────────────────────────────────

pub mod keys {
    use crate::types::{Dimension, Period, QuotaKind};

    pub const ENFORCE_ALL: &str = "enforce:*";
    pub const QUOTA_REQ_ALL: &str = "quota:req:*";
    pub const ACTIVE_SESSION_ALL: &str = "active_session:*";
    pub const TOKEN_REPORT_ALL: &str = "token_report:*";

    pub fn token_map(token: &str) -> String {
        format!("token_map:{token}")
    }

    pub fn device_user(device_id: &str) -> String {
        format!("device_user:{device_id}")
    }

    pub fn active_session(user_id: &str, play_session_id: &str) -> String {
        format!("active_session:{user_id}:{play_session_id}")
    }

    pub fn active_session_pattern(user_id: &str) -> String {
        format!("active_session:{user_id}:*")
    }

    /// `active_session:<user_id>:<play_session_id>` → `(user_id, psid)`.
    pub fn parse_active_session(key: &str) -> Option<(&str, &str)> {
        key.strip_prefix("active_session:")?.split_once(':')
    }

    pub fn enforce(dimension: Dimension, value: &str) -> String {
        format!("enforce:{}:{}", dimension.as_str(), value)
    }

    pub fn quota(kind: QuotaKind, dimension: Dimension, value: &str, period: Period, period_key: &str) -> String {
        format!("quota:{}:{}:{}:{}:{}", kind.as_str(), dimension.as_str(), value, period.as_str(), period_key)
    }

    /// `quota:req:…` → the paired `quota:bw:…` key.
    pub fn quota_bw_counterpart(req_key: &str) -> Option<String> {
        req_key.strip_prefix("quota:req:").map(|rest| format!("quota:bw:{rest}"))
    }

    pub struct QuotaKeyParts<'a> {
        pub kind:       QuotaKind,
        pub dimension:  Dimension,
        pub value:      &'a str,
        pub period:     Period,
        pub period_key: &'a str,
    }

    /// Parse `quota:<kind>:<dim>:<value>:<period>:<period_key>`. The value may
    /// itself contain `:` (IPv6), so the tail is split from the right.
    pub fn parse_quota(key: &str) -> Option<QuotaKeyParts<'_>> {
        let rest = key.strip_prefix("quota:")?;
        let (kind_s, rest) = rest.split_once(':')?;
        let (dim_s, rest) = rest.split_once(':')?;
        let (rest, period_key) = rest.rsplit_once(':')?;
        let (value, period_s) = rest.rsplit_once(':')?;

        let kind = match kind_s {
            "req" => QuotaKind::Req,
            "bw"  => QuotaKind::Bw,
            _     => return None,
        };
        let dimension = match dim_s {
            "ip"     => Dimension::Ip,
            "user"   => Dimension::User,
            "device" => Dimension::Device,
            "global" => Dimension::Global,
            _        => return None,
        };
        let period = match period_s {
            "daily"   => Period::Daily,
            "weekly"  => Period::Weekly,
            "monthly" => Period::Monthly,
            _         => return None,
        };
        Some(QuotaKeyParts { kind, dimension, value, period, period_key })
    }

    pub fn remain(kind: QuotaKind, dimension: Dimension, value: &str, period: Period) -> String {
        format!("remain:{}:{}:{}:{}", kind.as_str(), dimension.as_str(), value, period.as_str())
    }

    pub fn token_report(unix_ts: i64, rand: u32) -> String {
        format!("token_report:{unix_ts}:{rand}")
    }
}

// ── Trait ─────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;
    /// Pipelined `SETEX` batch.
    async fn set_ex_many(&self, entries: &[(String, String, u64)]) -> Result<(), StoreError>;
    /// Pipelined `INCRBY` + `EXPIRE` (TTL set/refreshed on every increment).
    async fn incr_with_ttl(&self, key: &str, delta: i64, ttl_secs: u64) -> Result<(), StoreError>;
    /// One pipeline of `INCRBY` + `EXPIRE` pairs.
    async fn incr_with_ttl_many(&self, entries: &[(String, i64, u64)]) -> Result<(), StoreError>;
    /// Pipelined `INCRBY` batch against keys already known to exist.
    async fn incr_many(&self, deltas: &[(String, i64)]) -> Result<(), StoreError>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
    async fn del_many(&self, keys: &[String]) -> Result<(), StoreError>;
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
    /// Full cursor walk of `SCAN MATCH pattern COUNT count`.
    async fn scan(&self, pattern: &str, count: usize) -> Result<Vec<String>, StoreError>;
}

// ── Redis backend ─────────────────────────────────────────────────────────────

pub struct RedisStore {
    manager:    ConnectionManager,
    op_timeout: Duration,
}

impl RedisStore {
    /// Connect and verify with a PING. A failure here is a bootstrap failure;
    /// once connected, the manager reconnects on its own and individual
    /// operations surface transient errors instead.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let mut manager = ConnectionManager::new(client).await?;
        redis::cmd("PING").query_async::<_, ()>(&mut manager).await?;
        debug!("Store connected");
        Ok(Self { manager, op_timeout: OP_TIMEOUT })
    }

    async fn timed<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, redis::RedisError>> + Send,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.op_timeout))?
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        let key = key.to_string();
        self.timed(async move { conn.get(&key).await }).await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        let keys = keys.to_vec();
        self.timed(async move {
            redis::cmd("MGET").arg(&keys).query_async(&mut conn).await
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let (key, value) = (key.to_string(), value.to_string());
        self.timed(async move { conn.set_ex(&key, &value, ttl_secs).await }).await
    }

    async fn set_ex_many(&self, entries: &[(String, String, u64)]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        for (key, value, ttl) in entries {
            pipe.set_ex(key, value, *ttl).ignore();
        }
        self.timed(async move { pipe.query_async(&mut conn).await }).await
    }

    async fn incr_with_ttl(&self, key: &str, delta: i64, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.incr(key, delta).ignore();
        pipe.expire(key, ttl_secs as i64).ignore();
        self.timed(async move { pipe.query_async(&mut conn).await }).await
    }

    async fn incr_with_ttl_many(&self, entries: &[(String, i64, u64)]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        for (key, delta, ttl) in entries {
            pipe.incr(key, *delta).ignore();
            pipe.expire(key, *ttl as i64).ignore();
        }
        self.timed(async move { pipe.query_async(&mut conn).await }).await
    }

    async fn incr_many(&self, deltas: &[(String, i64)]) -> Result<(), StoreError> {
        if deltas.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        for (key, delta) in deltas {
            pipe.incr(key, *delta).ignore();
        }
        self.timed(async move { pipe.query_async(&mut conn).await }).await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let key = key.to_string();
        self.timed(async move { conn.expire(&key, ttl_secs as i64).await }).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let key = key.to_string();
        self.timed(async move { conn.del(&key).await }).await
    }

    async fn del_many(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let keys = keys.to_vec();
        self.timed(async move { conn.del(&keys).await }).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let key = key.to_string();
        self.timed(async move { conn.exists(&key).await }).await
    }

    async fn scan(&self, pattern: &str, count: usize) -> Result<Vec<String>, StoreError> {
        let mut conn = self.manager.clone();
        let pattern = pattern.to_string();
        self.timed(async move {
            let mut cursor: u64 = 0;
            let mut keys = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(count)
                    .query_async(&mut conn)
                    .await?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok(keys)
        })
        .await
    }
}

// ── In-memory backend ─────────────────────────────────────────────────────────

use dashmap::DashMap;
use std::time::Instant;

struct MemEntry {
    value:      String,
    expires_at: Option<Instant>,
}

impl MemEntry {
    fn live(&self) -> bool {
        self.expires_at.map(|t| Instant::now() < t).unwrap_or(true)
    }
}

/// In-process `KvStore` with TTL expiry and glob scan. Used by the test
/// suite and by `--store memory` local runs.
#[derive(Default)]
pub struct MemoryStore {
    map: DashMap<String, MemEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self, key: &str) -> Option<String> {
        let expired = match self.map.get(key) {
            Some(e) if e.live() => return Some(e.value.clone()),
            Some(_) => true,
            None    => false,
        };
        if expired {
            self.map.remove(key);
        }
        None
    }

    /// Remaining TTL in seconds — test hook, not part of the trait.
    pub fn ttl_of(&self, key: &str) -> Option<u64> {
        self.map
            .get(key)
            .filter(|e| e.live())
            .and_then(|e| e.expires_at)
            .map(|t| t.saturating_duration_since(Instant::now()).as_secs())
    }

    fn glob_to_regex(pattern: &str) -> regex::Regex {
        let mut out = String::with_capacity(pattern.len() + 8);
        out.push('^');
        for c in pattern.chars() {
            match c {
                '*' => out.push_str(".*"),
                '?' => out.push('.'),
                c   => out.push_str(&regex::escape(&c.to_string())),
            }
        }
        out.push('$');
        regex::Regex::new(&out).expect("escaped glob pattern")
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read(key))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        Ok(keys.iter().map(|k| self.read(k)).collect())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.map.insert(
            key.to_string(),
            MemEntry {
                value:      value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn set_ex_many(&self, entries: &[(String, String, u64)]) -> Result<(), StoreError> {
        for (key, value, ttl) in entries {
            self.set_ex(key, value, *ttl).await?;
        }
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &str, delta: i64, ttl_secs: u64) -> Result<(), StoreError> {
        let current = self.read(key).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
        self.set_ex(key, &(current + delta).to_string(), ttl_secs).await
    }

    async fn incr_with_ttl_many(&self, entries: &[(String, i64, u64)]) -> Result<(), StoreError> {
        for (key, delta, ttl) in entries {
            self.incr_with_ttl(key, *delta, *ttl).await?;
        }
        Ok(())
    }

    async fn incr_many(&self, deltas: &[(String, i64)]) -> Result<(), StoreError> {
        for (key, delta) in deltas {
            let current = self.read(key).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
            let expires = self.map.get(key).and_then(|e| e.expires_at);
            self.map.insert(
                key.clone(),
                MemEntry { value: (current + delta).to_string(), expires_at: expires },
            );
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        if let Some(mut e) = self.map.get_mut(key) {
            e.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.map.remove(key);
        Ok(())
    }

    async fn del_many(&self, keys: &[String]) -> Result<(), StoreError> {
        for key in keys {
            self.map.remove(key);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.read(key).is_some())
    }

    async fn scan(&self, pattern: &str, _count: usize) -> Result<Vec<String>, StoreError> {
        let re = Self::glob_to_regex(pattern);
        Ok(self
            .map
            .iter()
            .filter(|e| e.value().live() && re.is_match(e.key()))
            .map(|e| e.key().clone())
            .collect())
    }
}
