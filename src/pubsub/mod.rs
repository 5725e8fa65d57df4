//! Cross-instance coordination. Every instance in the fleet publishes agent
//! messages and presence transitions on shared channels so an agent
//! connected to instance B still receives a message routed from instance A.
//!
//! Grounded on the `redis`-backed session manager shape used elsewhere in
//! this corpus for fleet-wide state, adapted here to pub/sub channels rather
//! than a shared session store. `NullPubSub` keeps the relay fully
//! functional single-instance with no external dependency at all.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::protocol::{AgentMessagePayload, PresenceEvent};

#[derive(Debug, Clone)]
pub enum BusMessage {
    Agent(AgentMessagePayload),
    Presence(PresenceEvent),
}

#[derive(Debug)]
pub struct PubSubUnavailable;

/// Fleet-wide fan-out for messages and presence events. Implementations must
/// not deliver a publisher's own message back to itself through the bus —
/// local delivery always happens separately before the publish call.
#[async_trait]
pub trait PubSubBus: Send + Sync {
    async fn publish_agent_message(&self, payload: AgentMessagePayload) -> Result<(), PubSubUnavailable>;
    async fn publish_presence(&self, event: PresenceEvent) -> Result<(), PubSubUnavailable>;
    fn is_connected(&self) -> bool;
}

/// Standalone fallback used when no shared backend is configured, or when
/// the configured one is unreachable at startup. Messages to agents not
/// connected to this instance are simply undeliverable in this mode.
#[derive(Default)]
pub struct NullPubSub;

#[async_trait]
impl PubSubBus for NullPubSub {
    async fn publish_agent_message(&self, _payload: AgentMessagePayload) -> Result<(), PubSubUnavailable> {
        Ok(())
    }

    async fn publish_presence(&self, _event: PresenceEvent) -> Result<(), PubSubUnavailable> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        false
    }
}

/// Redis-backed fleet coordination over the `{prefix}:agent-messages` and
/// `{prefix}:presence-updates` channels.
pub struct RedisPubSub {
    client: redis::Client,
    manager: redis::aio::ConnectionManager,
    key_prefix: String,
    incoming: mpsc::UnboundedSender<BusMessage>,
    /// Reflects the subscriber loop's actual connection state — flipped by
    /// `spawn_subscriber()`, not the publish path, since a broken subscriber
    /// means we're no longer reachable from the rest of the fleet even if
    /// publishes (over `manager`, which reconnects transparently) keep
    /// succeeding.
    connected: Arc<AtomicBool>,
}

impl RedisPubSub {
    /// Connects and spawns the background subscriber loop that forwards
    /// inbound bus messages to `incoming`. The caller owns the receiving end
    /// and is responsible for delivering them to local connections — this
    /// type never touches the connection table directly.
    pub async fn connect(
        redis_url: &str,
        key_prefix: impl Into<String>,
        incoming: mpsc::UnboundedSender<BusMessage>,
    ) -> redis::RedisResult<Self> {
        let key_prefix = key_prefix.into();
        let client = redis::Client::open(redis_url)?;
        let manager = redis::aio::ConnectionManager::new(client.clone()).await?;

        let bus = Self {
            client: client.clone(),
            manager,
            key_prefix: key_prefix.clone(),
            incoming: incoming.clone(),
            connected: Arc::new(AtomicBool::new(false)),
        };
        bus.spawn_subscriber();
        Ok(bus)
    }

    fn channel(&self, suffix: &str) -> String {
        format!("{}:{}", self.key_prefix, suffix)
    }

    fn spawn_subscriber(&self) {
        let client = self.client.clone();
        let agent_channel = self.channel(crate::protocol::CHANNEL_AGENT_MESSAGES);
        let presence_channel = self.channel(crate::protocol::CHANNEL_PRESENCE_UPDATES);
        let incoming = self.incoming.clone();
        let connected = self.connected.clone();

        tokio::spawn(async move {
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if pubsub.subscribe(&agent_channel).await.is_err() {
                            connected.store(false, Ordering::Relaxed);
                            tracing::warn!("pubsub subscribe to agent-messages channel failed, retrying");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                            continue;
                        }
                        if pubsub.subscribe(&presence_channel).await.is_err() {
                            connected.store(false, Ordering::Relaxed);
                            tracing::warn!("pubsub subscribe to presence-updates channel failed, retrying");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                            continue;
                        }

                        connected.store(true, Ordering::Relaxed);
                        let mut stream = pubsub.on_message();
                        while let Some(msg) = stream.next().await {
                            let channel: String = msg.get_channel_name().to_string();
                            let payload: String = match msg.get_payload() {
                                Ok(p) => p,
                                Err(_) => continue,
                            };

                            if channel == agent_channel {
                                if let Ok(payload) = serde_json::from_str::<AgentMessagePayload>(&payload) {
                                    let _ = incoming.send(BusMessage::Agent(payload));
                                }
                            } else if channel == presence_channel {
                                if let Ok(event) = serde_json::from_str::<PresenceEvent>(&payload) {
                                    let _ = incoming.send(BusMessage::Presence(event));
                                }
                            }
                        }
                        // `on_message()`'s stream only ends when the
                        // underlying connection drops.
                        connected.store(false, Ordering::Relaxed);
                    }
                    Err(_) => {
                        connected.store(false, Ordering::Relaxed);
                        tracing::warn!("pubsub connection lost, reconnecting in 1s");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl PubSubBus for RedisPubSub {
    async fn publish_agent_message(&self, payload: AgentMessagePayload) -> Result<(), PubSubUnavailable> {
        use redis::AsyncCommands;
        let body = serde_json::to_string(&payload).map_err(|_| PubSubUnavailable)?;
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(self.channel(crate::protocol::CHANNEL_AGENT_MESSAGES), body)
            .await
            .map_err(|_| PubSubUnavailable)
    }

    async fn publish_presence(&self, event: PresenceEvent) -> Result<(), PubSubUnavailable> {
        use redis::AsyncCommands;
        let body = serde_json::to_string(&event).map_err(|_| PubSubUnavailable)?;
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(self.channel(crate::protocol::CHANNEL_PRESENCE_UPDATES), body)
            .await
            .map_err(|_| PubSubUnavailable)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageEnvelope, MessageMetadata, MessageType, Priority};

    fn envelope() -> MessageEnvelope {
        MessageEnvelope {
            message_id: "m1".into(),
            conversation_id: "c1".into(),
            sender_agent_id: "agent-a".into(),
            recipient_agent_id: "agent-b".into(),
            message_type: MessageType::Query,
            content: serde_json::json!({}),
            timestamp: 0,
            metadata: MessageMetadata {
                priority: Priority::Normal,
                expires_at: None,
                encrypted: false,
                requires_response: false,
            },
            encrypted: false,
            signature: String::new(),
        }
    }

    #[tokio::test]
    async fn null_bus_always_reports_disconnected_and_accepts_publishes() {
        let bus = NullPubSub;
        assert!(!bus.is_connected());
        let payload = AgentMessagePayload {
            envelope: envelope(),
            is_broadcast: false,
            exclude_agent_ids: vec![],
        };
        assert!(bus.publish_agent_message(payload).await.is_ok());
    }
}
