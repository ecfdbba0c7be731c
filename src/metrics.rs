use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Relay-wide counters
pub struct RelayMetrics {
    pub start_time: Instant,
    connections_accepted: AtomicU64,
    connections_refused: AtomicU64,
    messages_broadcast: AtomicU64,
    rate_limited: AtomicU64,
    content_rejected: AtomicU64,
    bans_issued: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections_accepted: u64,
    pub connections_refused: u64,
    pub messages_broadcast: u64,
    pub rate_limited: u64,
    pub content_rejected: u64,
    pub bans_issued: u64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            connections_accepted: AtomicU64::new(0),
            connections_refused: AtomicU64::new(0),
            messages_broadcast: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            content_rejected: AtomicU64::new(0),
            bans_issued: AtomicU64::new(0),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn increment_connections(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_refused(&self) {
        self.connections_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_messages(&self) {
        self.messages_broadcast.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_content_rejected(&self) {
        self.content_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_bans(&self) {
        self.bans_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_refused: self.connections_refused.load(Ordering::Relaxed),
            messages_broadcast: self.messages_broadcast.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            content_rejected: self.content_rejected.load(Ordering::Relaxed),
            bans_issued: self.bans_issued.load(Ordering::Relaxed),
        }
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
