//! Message routing: resolves a directed or broadcast envelope to local
//! connections, and hands off to the PubSubBus for agents not connected to
//! this instance.
//!
//! Generalizes the single-instance `send_to_user`/`broadcast_to_users` shape
//! used elsewhere in this corpus to the two-tier (local-first, then
//! cross-instance) delivery this system requires.

use std::sync::Arc;

use crate::connection::ConnectionTable;
use crate::protocol::{AgentMessagePayload, DeliveryStatus, MessageEnvelope, ServerFrame};
use crate::pubsub::PubSubBus;
use crate::stats::Stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Directed message written to at least one local authenticated
    /// connection.
    Delivered,
    /// Broadcast accepted, or a directed message handed off to the bus for a
    /// recipient not connected to this instance — there is no end-to-end
    /// confirmation past the hand-off, so this is deliberately optimistic.
    Sent,
    /// Directed message whose recipient is not connected anywhere the bus
    /// can reach, and no bus is configured at all.
    RecipientUnreachable,
}

impl RouteOutcome {
    pub fn as_delivery_status(self) -> DeliveryStatus {
        match self {
            RouteOutcome::Delivered => DeliveryStatus::Delivered,
            RouteOutcome::Sent => DeliveryStatus::Sent,
            RouteOutcome::RecipientUnreachable => DeliveryStatus::Failed,
        }
    }
}

pub struct Router {
    connections: ConnectionTable,
    bus: Arc<dyn PubSubBus>,
    stats: Arc<Stats>,
}

impl Router {
    pub fn new(connections: ConnectionTable, bus: Arc<dyn PubSubBus>, stats: Arc<Stats>) -> Self {
        Self {
            connections,
            bus,
            stats,
        }
    }

    /// Routes a freshly-received envelope. Delivers to every locally
    /// connected matching agent first, then publishes to the bus so other
    /// instances can deliver to their own locally connected agents —
    /// `exclude_agent_ids` prevents an agent this instance already served
    /// from receiving a duplicate copy via its own rebroadcast.
    pub async fn route(&self, envelope: MessageEnvelope) -> RouteOutcome {
        self.stats.record_message_received();
        let is_broadcast = envelope.is_broadcast();

        let locally_delivered = if is_broadcast {
            self.deliver_broadcast_locally(&envelope, &[]).await
        } else {
            self.deliver_directed_locally(&envelope).await
        };

        let bus_connected = self.bus.is_connected();
        let payload = AgentMessagePayload {
            is_broadcast,
            exclude_agent_ids: locally_delivered.clone(),
            envelope,
        };
        if bus_connected {
            if self.bus.publish_agent_message(payload).await.is_err() {
                tracing::warn!("pubsub publish failed; message stays local-only");
            }
        }

        // A broadcast has no single recipient to fail — it's accepted as
        // soon as it's offered to whoever happens to be listening. A
        // directed message delivered to a local connection is confirmed;
        // one handed off to the bus only is optimistic; one with nowhere to
        // go at all is unreachable.
        if is_broadcast {
            self.stats.record_message_sent();
            RouteOutcome::Sent
        } else if !locally_delivered.is_empty() {
            self.stats.record_message_sent();
            RouteOutcome::Delivered
        } else if bus_connected {
            self.stats.record_message_sent();
            RouteOutcome::Sent
        } else {
            self.stats.record_message_failed();
            RouteOutcome::RecipientUnreachable
        }
    }

    /// Delivers a message received from the bus (published by another
    /// instance) to this instance's locally connected agents only — never
    /// republishes, or every instance would echo it forever.
    pub async fn deliver_from_bus(&self, payload: AgentMessagePayload) {
        if payload.is_broadcast {
            self.deliver_broadcast_locally(&payload.envelope, &payload.exclude_agent_ids)
                .await;
        } else if !payload.exclude_agent_ids.contains(&payload.envelope.recipient_agent_id) {
            self.deliver_directed_locally(&payload.envelope).await;
        }
    }

    async fn deliver_directed_locally(&self, envelope: &MessageEnvelope) -> Vec<String> {
        match self.connections.get_by_agent_id(&envelope.recipient_agent_id).await {
            Some(conn) => {
                let frame = ServerFrame::Message(crate::protocol::MessageFrame {
                    message: envelope.clone(),
                    encrypted: envelope.encrypted,
                    signature: envelope.signature.clone(),
                    timestamp: envelope.timestamp,
                });
                if conn.send(frame).is_ok() {
                    self.stats.record_message_delivered();
                    vec![envelope.recipient_agent_id.clone()]
                } else {
                    vec![]
                }
            }
            None => vec![],
        }
    }

    async fn deliver_broadcast_locally(&self, envelope: &MessageEnvelope, already_excluded: &[String]) -> Vec<String> {
        let mut delivered = Vec::new();
        for conn in self.connections.snapshot_authenticated().await {
            if conn.agent_id == envelope.sender_agent_id {
                continue;
            }
            if already_excluded.contains(&conn.agent_id) {
                continue;
            }
            let frame = ServerFrame::Message(crate::protocol::MessageFrame {
                message: envelope.clone(),
                encrypted: envelope.encrypted,
                signature: envelope.signature.clone(),
                timestamp: envelope.timestamp,
            });
            if conn.send(frame).is_ok() {
                self.stats.record_message_delivered();
                delivered.push(conn.agent_id.clone());
            }
        }
        delivered
    }
}
