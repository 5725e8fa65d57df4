//! Presence: broadcasts an agent's online/offline transitions to every other
//! locally connected agent and to the shared bus, and fans out transitions
//! published by other instances without re-publishing them.
//!
//! Generalizes the single-instance `set_presence` broadcast-to-co-members
//! pattern used elsewhere in this corpus to the fleet-wide case.

use std::sync::Arc;

use chrono::Utc;

use crate::connection::ConnectionTable;
use crate::protocol::{PresenceEvent, PresenceStatus, ServerFrame};
use crate::pubsub::PubSubBus;

pub struct PresenceService {
    connections: ConnectionTable,
    bus: Arc<dyn PubSubBus>,
}

impl PresenceService {
    pub fn new(connections: ConnectionTable, bus: Arc<dyn PubSubBus>) -> Self {
        Self { connections, bus }
    }

    pub async fn announce(&self, agent_id: &str, status: PresenceStatus) {
        let event = PresenceEvent {
            agent_id: agent_id.to_string(),
            status,
            timestamp: Utc::now().timestamp_millis(),
        };

        self.deliver_locally(&event).await;

        if self.bus.publish_presence(event).await.is_err() {
            tracing::warn!(agent_id, "pubsub presence publish failed; staying local-only");
        }
    }

    pub async fn deliver_from_bus(&self, event: PresenceEvent) {
        self.deliver_locally(&event).await;
    }

    async fn deliver_locally(&self, event: &PresenceEvent) {
        for conn in self.connections.snapshot_authenticated().await {
            if conn.agent_id == event.agent_id {
                continue;
            }
            let _ = conn.send(ServerFrame::Presence(event.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ClientMetadata, Connection, ConnectionStatus};
    use crate::pubsub::NullPubSub;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    async fn connected_agent(table: &ConnectionTable, agent_id: &str) -> mpsc::UnboundedReceiver<ServerFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(
            Uuid::new_v4(),
            agent_id.to_string(),
            Uuid::new_v4(),
            "pk".into(),
            ClientMetadata::default(),
            tx,
        ));
        conn.set_status(ConnectionStatus::Authenticated);
        table.insert_authenticated(conn).await;
        rx
    }

    #[tokio::test]
    async fn announce_skips_the_announcing_agent() {
        let table = ConnectionTable::new();
        let mut self_rx = connected_agent(&table, "agent-a").await;
        let mut other_rx = connected_agent(&table, "agent-b").await;
        let service = PresenceService::new(table, Arc::new(NullPubSub));

        service.announce("agent-a", PresenceStatus::Online).await;

        assert!(self_rx.try_recv().is_err());
        let frame = other_rx.try_recv().expect("other agent should see the event");
        match frame {
            ServerFrame::Presence(event) => {
                assert_eq!(event.agent_id, "agent-a");
                assert_eq!(event.status, PresenceStatus::Online);
            }
            _ => panic!("expected a presence frame"),
        }
    }
}
