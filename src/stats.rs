//! Per-tunnel traffic counters.
//!
//! Writers are the byte pumps (bytes + activity) and the accept loop
//! (connection count); readers snapshot without locking. A snapshot is
//! consistent per field, not across fields.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug)]
pub struct Stats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    connections: AtomicU64,
    last_activity_unix: AtomicI64,
    started_at: Instant,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            connections: AtomicU64::new(0),
            last_activity_unix: AtomicI64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn increment_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    fn touch(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.last_activity_unix.store(now, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let last_activity = self.last_activity_unix.load(Ordering::Relaxed);
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            last_activity_unix: (last_activity > 0).then_some(last_activity),
            uptime: self.started_at.elapsed(),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connections: u64,
    pub last_activity_unix: Option<i64>,
    pub uptime: Duration,
}

impl StatsSnapshot {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::new();
        stats.add_sent(100);
        stats.add_sent(50);
        stats.add_received(25);
        stats.increment_connections();

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_sent, 150);
        assert_eq!(snap.bytes_received, 25);
        assert_eq!(snap.connections, 1);
        assert_eq!(snap.total_bytes(), 175);
    }

    #[test]
    fn activity_is_stamped_on_traffic() {
        let stats = Stats::new();
        assert!(stats.snapshot().last_activity_unix.is_none());
        stats.add_received(1);
        assert!(stats.snapshot().last_activity_unix.is_some());
    }

    #[test]
    fn snapshot_is_independent_of_later_writes() {
        let stats = Stats::new();
        stats.add_sent(10);
        let snap = stats.snapshot();
        stats.add_sent(10);
        assert_eq!(snap.bytes_sent, 10);
        assert_eq!(stats.snapshot().bytes_sent, 20);
    }
}
