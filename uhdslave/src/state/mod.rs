// uhdslave/src/state/mod.rs
//
// In-process shared state: local rate-limit counters, telemetry buffers, and
// global gateway counters. Everything here is accessed without yielding —
// atomics and short parking_lot critical sections only.

pub mod limits;
pub mod telemetry;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::AccessDecision;

/// Process-wide counters, surfaced in the heartbeat metadata and the
/// periodic stats line.
#[derive(Default)]
pub struct GatewayStats {
    pub requests:  AtomicU64,
    pub allowed:   AtomicU64,
    pub denied:    AtomicU64,
    pub synthetic: AtomicU64,
}

impl GatewayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, decision: &AccessDecision) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        match decision {
            AccessDecision::Allow        => self.allowed.fetch_add(1, Ordering::Relaxed),
            AccessDecision::Deny(_)      => self.denied.fetch_add(1, Ordering::Relaxed),
            AccessDecision::Synthetic(_) => self.synthetic.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.requests.load(Ordering::Relaxed),
            self.allowed.load(Ordering::Relaxed),
            self.denied.load(Ordering::Relaxed),
            self.synthetic.load(Ordering::Relaxed),
        )
    }
}
