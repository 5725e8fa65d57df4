//! Server-wide counters exposed through the admin surface and logs.
//!
//! Plain atomics rather than a metrics-crate histogram set: these are simple
//! monotonic counts and one gauge (`active_connections`), cheap to read from
//! any task without contention.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;

pub struct Stats {
    started_at: i64,
    total_connections_ever: AtomicU64,
    active_connections: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_delivered: AtomicU64,
    messages_failed: AtomicU64,
    rate_limit_rejections: AtomicU64,
    auth_failures: AtomicU64,
    last_reset_at: AtomicI64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now().timestamp_millis(),
            total_connections_ever: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            rate_limit_rejections: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            last_reset_at: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    pub fn record_connection_opened(&self) {
        self.total_connections_ever.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_rejection(&self) {
        self.rate_limit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            started_at: self.started_at,
            uptime_ms: Utc::now().timestamp_millis() - self.started_at,
            total_connections_ever: self.total_connections_ever.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            rate_limit_rejections: self.rate_limit_rejections.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            last_reset_at: self.last_reset_at.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    #[serde(rename = "startedAt")]
    pub started_at: i64,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: i64,
    #[serde(rename = "totalConnectionsEver")]
    pub total_connections_ever: u64,
    #[serde(rename = "activeConnections")]
    pub active_connections: u64,
    #[serde(rename = "messagesReceived")]
    pub messages_received: u64,
    #[serde(rename = "messagesSent")]
    pub messages_sent: u64,
    #[serde(rename = "messagesDelivered")]
    pub messages_delivered: u64,
    #[serde(rename = "messagesFailed")]
    pub messages_failed: u64,
    #[serde(rename = "rateLimitRejections")]
    pub rate_limit_rejections: u64,
    #[serde(rename = "authFailures")]
    pub auth_failures: u64,
    #[serde(rename = "lastResetAt")]
    pub last_reset_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_connections_tracks_open_and_close() {
        let stats = Stats::new();
        stats.record_connection_opened();
        stats.record_connection_opened();
        stats.record_connection_closed();
        assert_eq!(stats.snapshot().active_connections, 1);
        assert_eq!(stats.snapshot().total_connections_ever, 2);
    }

    #[test]
    fn message_counters_are_independent() {
        let stats = Stats::new();
        stats.record_message_received();
        stats.record_message_sent();
        stats.record_message_delivered();
        stats.record_message_failed();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.messages_sent, 1);
        assert_eq!(snapshot.messages_delivered, 1);
        assert_eq!(snapshot.messages_failed, 1);
    }
}
