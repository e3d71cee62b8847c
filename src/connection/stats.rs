//! Connection statistics (spec.md §6, `GET /stats`), computed fresh from
//! atomics on every read rather than cached — "independent snapshot
//! statistics" per spec.md §9 REDESIGN FLAGS.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub struct ConnectionStats {
    started_at: Instant,
    active_tcp_sessions: AtomicU64,
    udp_active: AtomicBool,
    total_messages_received: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Arc<Self> {
        Arc::new(ConnectionStats {
            started_at: Instant::now(),
            active_tcp_sessions: AtomicU64::new(0),
            udp_active: AtomicBool::new(false),
            total_messages_received: AtomicU64::new(0),
        })
    }

    pub fn session_opened(&self) {
        self.active_tcp_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.active_tcp_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set_udp_active(&self, active: bool) {
        self.udp_active.store(active, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.total_messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        let uptime_seconds = self.started_at.elapsed().as_secs_f64();
        let total = self.total_messages_received.load(Ordering::Relaxed);
        let messages_per_second = if uptime_seconds > 0.0 {
            total as f64 / uptime_seconds
        } else {
            0.0
        };

        ConnectionStatsSnapshot {
            active_tcp_sessions: self.active_tcp_sessions.load(Ordering::Relaxed),
            udp_active: self.udp_active.load(Ordering::Relaxed),
            total_messages_received: total,
            messages_per_second,
            uptime_seconds,
        }
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        ConnectionStats {
            started_at: Instant::now(),
            active_tcp_sessions: AtomicU64::new(0),
            udp_active: AtomicBool::new(false),
            total_messages_received: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatsSnapshot {
    pub active_tcp_sessions: u64,
    pub udp_active: bool,
    pub total_messages_received: u64,
    pub messages_per_second: f64,
    pub uptime_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_open_and_close_track_active_count() {
        let stats = ConnectionStats::new();
        stats.session_opened();
        stats.session_opened();
        assert_eq!(stats.snapshot().active_tcp_sessions, 2);
        stats.session_closed();
        assert_eq!(stats.snapshot().active_tcp_sessions, 1);
    }

    #[test]
    fn snapshots_are_recomputed_not_cached() {
        let stats = ConnectionStats::new();
        let first = stats.snapshot();
        stats.message_received();
        let second = stats.snapshot();
        assert!(second.total_messages_received > first.total_messages_received);
    }
}
