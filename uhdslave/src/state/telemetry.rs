// uhdslave/src/state/telemetry.rs
//
// Bounded in-memory telemetry queues, drained by the agent's flush loop.
// Producers are request tasks (log phase, blocked denials); the consumer is
// the flush loop. Overflow drops the oldest entry and counts it; entries
// older than the 300 s entry TTL are discarded at drain time. Entries
// dropped because a flush POST failed are counted as lost — there is no
// retry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::types::{AccessLogEntry, BlockedLogEntry, TELEMETRY_ENTRY_TTL_SECS};

const MAX_ACCESS:  usize = 4096;
const MAX_BLOCKED: usize = 2048;

pub struct TelemetryBuffer {
    access:  Mutex<VecDeque<AccessLogEntry>>,
    blocked: Mutex<VecDeque<BlockedLogEntry>>,
    /// Entries evicted by overflow.
    pub dropped: AtomicU64,
    /// Entries discarded after a failed flush or expiry.
    pub lost: AtomicU64,
}

impl TelemetryBuffer {
    pub fn new() -> Self {
        Self {
            access:  Mutex::new(VecDeque::new()),
            blocked: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            lost:    AtomicU64::new(0),
        }
    }

    pub fn push_access(&self, entry: AccessLogEntry) {
        let mut q = self.access.lock();
        if q.len() >= MAX_ACCESS {
            q.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Access-log buffer full — dropped oldest entry");
        }
        q.push_back(entry);
    }

    pub fn push_blocked(&self, entry: BlockedLogEntry) {
        let mut q = self.blocked.lock();
        if q.len() >= MAX_BLOCKED {
            q.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Blocked-log buffer full — dropped oldest entry");
        }
        q.push_back(entry);
    }

    /// Remove up to `max` entries, discarding any that outlived the entry TTL.
    pub fn drain_access(&self, max: usize, now_unix: i64) -> Vec<AccessLogEntry> {
        let mut q = self.access.lock();
        let mut out = Vec::with_capacity(max.min(q.len()));
        while out.len() < max {
            let Some(entry) = q.pop_front() else { break };
            if now_unix - entry.timestamp > TELEMETRY_ENTRY_TTL_SECS {
                self.lost.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            out.push(entry);
        }
        out
    }

    pub fn drain_blocked(&self, max: usize, now_unix: i64) -> Vec<BlockedLogEntry> {
        let mut q = self.blocked.lock();
        let mut out = Vec::with_capacity(max.min(q.len()));
        while out.len() < max {
            let Some(entry) = q.pop_front() else { break };
            if now_unix - entry.timestamp > TELEMETRY_ENTRY_TTL_SECS {
                self.lost.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            out.push(entry);
        }
        out
    }

    pub fn mark_lost(&self, n: usize) {
        self.lost.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn access_len(&self) -> usize {
        self.access.lock().len()
    }

    pub fn blocked_len(&self) -> usize {
        self.blocked.lock().len()
    }
}

impl Default for TelemetryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ts: i64) -> AccessLogEntry {
        AccessLogEntry {
            timestamp: ts,
            client_ip: "10.0.0.1".into(),
            uri: "/x".into(),
            method: "GET".into(),
            status: 200,
            bytes_sent: 0,
            request_time_ms: 1,
            upstream_time_ms: 1,
            client_name: None,
            client_version: None,
            device_id: None,
            device_name: None,
            user_id: None,
            play_session_id: None,
            user_agent: None,
        }
    }

    #[test]
    fn drain_is_fifo_and_bounded() {
        let buf = TelemetryBuffer::new();
        for i in 0..5 {
            buf.push_access(entry(1000 + i));
        }
        let batch = buf.drain_access(3, 1010);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].timestamp, 1000);
        assert_eq!(buf.access_len(), 2);
    }

    #[test]
    fn expired_entries_are_counted_as_lost() {
        let buf = TelemetryBuffer::new();
        buf.push_access(entry(0));
        buf.push_access(entry(1000));
        let batch = buf.drain_access(10, 1000);
        assert_eq!(batch.len(), 1);
        assert_eq!(buf.lost.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn overflow_drops_oldest() {
        let buf = TelemetryBuffer::new();
        for i in 0..(MAX_ACCESS + 10) as i64 {
            buf.push_access(entry(i));
        }
        assert_eq!(buf.access_len(), MAX_ACCESS);
        assert_eq!(buf.dropped.load(Ordering::Relaxed), 10);
        let batch = buf.drain_access(1, 20);
        assert_eq!(batch[0].timestamp, 10);
    }
}
