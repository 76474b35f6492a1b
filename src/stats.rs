// Per-link transfer counters. A reference link layer keeps separate
// `SendStatisticInfo`/`RecvStatisticInfo` maps keyed by stream; here that
// collapses to one counter set per `CommEntity` since the engine doesn't
// model multiple concurrent streams per link.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SendStatisticInfo {
    pub request_count: AtomicU64,
    pub success_count: AtomicU64,
    pub failure_count: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub total_cost_us: AtomicU64,
}

impl SendStatisticInfo {
    pub fn record_success(&self, bytes: u64, cost_us: u64) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.total_cost_us.fetch_add(cost_us, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatSnapshot {
        StatSnapshot {
            request_count: self.request_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            bytes: self.bytes_sent.load(Ordering::Relaxed),
            total_cost_us: self.total_cost_us.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct RecvStatisticInfo {
    pub request_count: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl RecvStatisticInfo {
    pub fn record(&self, bytes: u64) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatSnapshot {
        StatSnapshot {
            request_count: self.request_count.load(Ordering::Relaxed),
            success_count: self.request_count.load(Ordering::Relaxed),
            failure_count: 0,
            bytes: self.bytes_received.load(Ordering::Relaxed),
            total_cost_us: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatSnapshot {
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub bytes: u64,
    pub total_cost_us: u64,
}

/// Side-effect-only dump of a link's counters to the tracing subscriber,
/// in place of a `Dump()` method that logs to the application's own sink.
pub fn dump(label: &str, send: &SendStatisticInfo, recv: &RecvStatisticInfo) {
    let s = send.snapshot();
    let r = recv.snapshot();
    tracing::info!(
        link = label,
        send_requests = s.request_count,
        send_failures = s.failure_count,
        send_bytes = s.bytes,
        recv_requests = r.request_count,
        recv_bytes = r.bytes,
        "link statistics"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_stats_accumulate() {
        let stats = SendStatisticInfo::default();
        stats.record_success(1024, 50);
        stats.record_failure();
        let snap = stats.snapshot();
        assert_eq!(snap.request_count, 2);
        assert_eq!(snap.success_count, 1);
        assert_eq!(snap.failure_count, 1);
        assert_eq!(snap.bytes, 1024);
    }
}
