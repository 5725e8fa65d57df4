//! Idle-connection reaper: periodically sweeps the connection table and
//! evicts AUTHENTICATED connections that have gone silent for longer than
//! twice the configured response timeout, without holding the table lock
//! during the notify/send I/O.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::connection::{ConnectionStatus, ConnectionTable};
use crate::presence::PresenceService;
use crate::protocol::PresenceStatus;
use crate::stats::Stats;

pub struct Reaper {
    connections: ConnectionTable,
    presence: Arc<PresenceService>,
    stats: Arc<Stats>,
    idle_threshold: Duration,
    sweep_interval: Duration,
}

impl Reaper {
    pub fn new(
        connections: ConnectionTable,
        presence: Arc<PresenceService>,
        stats: Arc<Stats>,
        response_timeout: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            connections,
            presence,
            stats,
            idle_threshold: response_timeout * 2,
            sweep_interval,
        }
    }

    /// Runs until the process shuts down; intended to be spawned once.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    async fn sweep_once(&self) {
        let now = Utc::now().timestamp_millis();
        let threshold_ms = self.idle_threshold.as_millis() as i64;

        let idle: Vec<_> = self
            .connections
            .snapshot_authenticated()
            .await
            .into_iter()
            .filter(|conn| now - conn.last_activity_at() > threshold_ms)
            .collect();

        for conn in idle {
            conn.set_status(ConnectionStatus::Disconnecting);
            conn.shutdown.notify_one();
            self.connections.remove(conn.connection_id, &conn.agent_id).await;
            self.stats.record_connection_closed();
            self.presence.announce(&conn.agent_id, PresenceStatus::Offline).await;
            tracing::info!(agent_id = %conn.agent_id, "evicted idle connection");
        }
    }
}
