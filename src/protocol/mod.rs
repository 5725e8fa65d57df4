//! Wire types: the message envelope, the frames carried over the socket,
//! and the payloads published on the PubSubBus.
//!
//! The relay never decodes `content` — it is `serde_json::Value`, validated
//! only for shape (object or primitive), never interpreted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Message envelope
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Handshake,
    Query,
    Response,
    Proposal,
    Confirmation,
    Rejection,
    Heartbeat,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default)]
    pub priority: Priority,
    #[serde(rename = "expiresAt", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(rename = "requiresResponse", default)]
    pub requires_response: bool,
}

/// The message object exchanged between agents. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    #[serde(rename = "senderAgentId")]
    pub sender_agent_id: String,
    /// Empty string means broadcast to every other connected agent.
    #[serde(rename = "recipientAgentId", default)]
    pub recipient_agent_id: String,
    #[serde(rename = "messageType")]
    pub message_type: MessageType,
    pub content: Value,
    pub timestamp: i64,
    pub metadata: MessageMetadata,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub signature: String,
}

impl MessageEnvelope {
    pub fn is_broadcast(&self) -> bool {
        self.recipient_agent_id.is_empty()
    }

    /// Shape validation only — never inspects `content` beyond confirming it
    /// parsed as JSON at all. An empty `recipientAgentId` is not an error:
    /// it's how a broadcast is spelled, for any message type.
    pub fn validate_shape(&self) -> Result<(), ShapeError> {
        if self.message_id.trim().is_empty() {
            return Err(ShapeError("messageId must not be empty"));
        }
        if self.sender_agent_id.trim().is_empty() {
            return Err(ShapeError("senderAgentId must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ShapeError(pub &'static str);

impl std::fmt::Display for ShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The bidirectional wire wrapper around a message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageFrame {
    pub message: MessageEnvelope,
    pub encrypted: bool,
    pub signature: String,
    pub timestamp: i64,
}

// ============================================================================
// Acknowledgement
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    #[serde(rename = "SENT")]
    Sent,
    #[serde(rename = "DELIVERED")]
    Delivered,
    #[serde(rename = "FAILED")]
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acknowledgement {
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub status: DeliveryStatus,
    pub timestamp: i64,
}

// ============================================================================
// Presence
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEvent {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    pub status: PresenceStatus,
    pub timestamp: i64,
}

// ============================================================================
// Typing indicator
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingIndicator {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    #[serde(rename = "isTyping")]
    pub is_typing: bool,
}

// ============================================================================
// Authenticate / Authenticated frames
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct AuthenticateFrame {
    pub token: String,
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedFrame {
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    #[serde(rename = "agentId")]
    pub agent_id: String,
}

// ============================================================================
// Client -> server / server -> client frame envelopes
// ============================================================================

/// Named socket events the client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ClientFrame {
    Authenticate(AuthenticateFrame),
    Message(MessageFrame),
    Typing(TypingIndicator),
    Heartbeat,
}

/// Named socket events the server may send.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ServerFrame {
    Authenticated(AuthenticatedFrame),
    Message(MessageFrame),
    Presence(PresenceEvent),
    Typing(TypingIndicator),
    Ack(Acknowledgement),
    Error(crate::error::ErrorFrame),
    Heartbeat,
}

// ============================================================================
// PubSubBus payloads
// ============================================================================

/// Payload published on the `agent-messages` channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessagePayload {
    #[serde(flatten)]
    pub envelope: MessageEnvelope,
    #[serde(rename = "_isBroadcast", default)]
    pub is_broadcast: bool,
    #[serde(rename = "_excludeAgentIds", default)]
    pub exclude_agent_ids: Vec<String>,
}

pub const CHANNEL_AGENT_MESSAGES: &str = "agent-messages";
pub const CHANNEL_PRESENCE_UPDATES: &str = "presence-updates";
