//! SocketSession: the per-connection task driving one socket through its
//! full lifecycle — CONNECTING, AUTHENTICATING, AUTHENTICATED, and finally
//! DISCONNECTING/DISCONNECTED or ERROR. Owns the only mutable handle to its
//! `Connection`; every other component reaches it through a `ConnectionTable`
//! lookup and an `Arc`.
//!
//! Authenticates in-band over the first frames rather than via a
//! query-string token before the socket is accepted, so the state machine
//! here is built fresh, reusing only the split-sink/split-stream send and
//! receive task shape.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::TokenVerifier;
use crate::connection::{ClientMetadata, Connection, ConnectionStatus, ConnectionTable};
use crate::error::{ErrorFrame, ErrorType};
use crate::presence::PresenceService;
use crate::protocol::{
    AuthenticatedFrame, ClientFrame, MessageFrame, PresenceStatus, ServerFrame,
};
use crate::ratelimit::{extract_identity, message_cost, RateLimitClass, RateLimiter};
use crate::router::Router;
use crate::stats::Stats;

pub struct SessionConfig {
    pub authentication_deadline: Duration,
    pub heartbeat_interval: Duration,
    pub response_timeout: Duration,
}

pub struct SocketSession {
    connections: ConnectionTable,
    verifier: TokenVerifier,
    rate_limiter: Arc<RateLimiter>,
    router: Arc<Router>,
    presence: Arc<PresenceService>,
    stats: Arc<Stats>,
    config: SessionConfig,
}

impl SocketSession {
    pub fn new(
        connections: ConnectionTable,
        verifier: TokenVerifier,
        rate_limiter: Arc<RateLimiter>,
        router: Arc<Router>,
        presence: Arc<PresenceService>,
        stats: Arc<Stats>,
        config: SessionConfig,
    ) -> Self {
        Self {
            connections,
            verifier,
            rate_limiter,
            router,
            presence,
            stats,
            config,
        }
    }

    pub async fn run(self, socket: WebSocket, remote_addr: SocketAddr, forwarded_for: Option<String>) {
        let (mut ws_sink, mut ws_stream) = socket.split();
        let connection_id = Uuid::new_v4();

        let pending = match self
            .authenticate(&mut ws_sink, &mut ws_stream, remote_addr, forwarded_for.as_deref())
            .await
        {
            Some(pending) => pending,
            None => return,
        };
        let identity = pending.identity;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerFrame>();
        let conn = Arc::new(Connection::new(
            connection_id,
            identity.agent_id.clone(),
            identity.user_id,
            pending.public_key,
            ClientMetadata {
                remote_addr: Some(remote_addr.to_string()),
                ..Default::default()
            },
            outbound_tx,
        ));
        conn.set_status(ConnectionStatus::Authenticated);

        if let Some(superseded) = self.connections.insert_authenticated(conn.clone()).await {
            superseded.set_status(ConnectionStatus::Disconnecting);
            superseded.shutdown.notify_one();
        }
        self.stats.record_connection_opened();

        let _ = conn.send(ServerFrame::Authenticated(AuthenticatedFrame {
            connection_id: connection_id.to_string(),
            agent_id: conn.agent_id.clone(),
        }));
        self.presence.announce(&conn.agent_id, PresenceStatus::Online).await;

        self.pump(conn.clone(), &mut ws_sink, &mut ws_stream, &mut outbound_rx).await;

        self.connections.remove(connection_id, &conn.agent_id).await;
        self.stats.record_connection_closed();
        if conn.status() != ConnectionStatus::Disconnecting {
            // Reached here via our own socket closing, not a supersede from
            // another connection — only then do we own the presence update.
            self.presence.announce(&conn.agent_id, PresenceStatus::Offline).await;
        }
        conn.set_status(ConnectionStatus::Disconnected);
    }

    /// Drives CONNECTING -> CONNECTED -> AUTHENTICATING -> AUTHENTICATED.
    /// Returns `None` (socket already closed) on timeout or rejection.
    async fn authenticate(
        &self,
        ws_sink: &mut (impl SinkExt<WsMessage, Error = axum::Error> + Unpin),
        ws_stream: &mut (impl StreamExt<Item = Result<WsMessage, axum::Error>> + Unpin),
        remote_addr: SocketAddr,
        forwarded_for: Option<&str>,
    ) -> Option<PendingIdentity> {
        let remote_ip = remote_addr.ip().to_string();
        let identity_str = extract_identity(None, forwarded_for, &remote_ip);
        let gate = self
            .rate_limiter
            .consume(RateLimitClass::ConnectionAttempts, &identity_str, 1.0)
            .await;
        if !gate.is_allowed() {
            let _ = send_error(ws_sink, ErrorType::RateLimitExceeded, "too many connection attempts").await;
            return None;
        }

        let frame = match tokio::time::timeout(self.config.authentication_deadline, ws_stream.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) => text,
            _ => {
                let _ = send_error(ws_sink, ErrorType::AuthenticationFailed, "authentication timed out").await;
                return None;
            }
        };

        let auth_frame = match serde_json::from_str::<ClientFrame>(&frame) {
            Ok(ClientFrame::Authenticate(auth)) => auth,
            _ => {
                let _ = send_error(ws_sink, ErrorType::InvalidMessageFormat, "expected an authenticate frame").await;
                return None;
            }
        };

        let auth_gate = self
            .rate_limiter
            .consume(RateLimitClass::AuthenticationAttempts, &identity_str, 1.0)
            .await;
        if !auth_gate.is_allowed() {
            let _ = send_error(ws_sink, ErrorType::RateLimitExceeded, "too many authentication attempts").await;
            return None;
        }

        // The token, not the client-supplied agentId/userId fields, is the
        // source of truth for identity; those fields only carry the public
        // key alongside it.
        match self.verifier.verify(&auth_frame.token) {
            Ok(identity) => Some(PendingIdentity {
                identity,
                public_key: auth_frame.public_key,
            }),
            Err(_) => {
                self.stats.record_auth_failure();
                let _ = send_error(ws_sink, ErrorType::AuthenticationFailed, "invalid or expired token").await;
                None
            }
        }
    }

    async fn pump(
        &self,
        conn: Arc<Connection>,
        ws_sink: &mut (impl SinkExt<WsMessage, Error = axum::Error> + Unpin),
        ws_stream: &mut (impl StreamExt<Item = Result<WsMessage, axum::Error>> + Unpin),
        outbound_rx: &mut mpsc::UnboundedReceiver<ServerFrame>,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                biased;

                _ = conn.shutdown.notified() => {
                    let _ = ws_sink.send(WsMessage::Close(None)).await;
                    return;
                }

                frame = outbound_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Ok(text) = serde_json::to_string(&frame) {
                                if ws_sink.send(WsMessage::Text(text)).await.is_err() {
                                    return;
                                }
                                self.stats.record_message_sent();
                            }
                        }
                        None => return,
                    }
                }

                _ = heartbeat.tick() => {
                    if ws_sink.send(WsMessage::Text(
                        serde_json::to_string(&ServerFrame::Heartbeat).unwrap_or_default()
                    )).await.is_err() {
                        return;
                    }
                }

                incoming = ws_stream.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            conn.touch();
                            self.handle_client_frame(&conn, &text).await;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => return,
                        Some(Ok(_)) => {}
                        Some(Err(_)) => return,
                    }
                }
            }
        }
    }

    async fn handle_client_frame(&self, conn: &Arc<Connection>, raw: &str) {
        let frame: ClientFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(_) => {
                let _ = conn.send(ServerFrame::Error(ErrorFrame::new(
                    ErrorType::InvalidMessageFormat,
                    "could not parse frame",
                )));
                return;
            }
        };

        let cost = match &frame {
            ClientFrame::Message(m) => message_cost(m.message.message_type),
            ClientFrame::Heartbeat => message_cost(crate::protocol::MessageType::Heartbeat),
            _ => 1.0,
        };
        let gate = self
            .rate_limiter
            .consume(RateLimitClass::WebsocketMessages, &conn.agent_id, cost)
            .await;
        if !gate.is_allowed() {
            self.stats.record_rate_limit_rejection();
            let _ = conn.send(ServerFrame::Error(ErrorFrame::new(
                ErrorType::RateLimitExceeded,
                "message rate limit exceeded",
            )));
            return;
        }

        match frame {
            ClientFrame::Message(MessageFrame { mut message, .. }) => {
                message.sender_agent_id = conn.agent_id.clone();
                message.timestamp = Utc::now().timestamp_millis();
                if let Err(err) = message.validate_shape() {
                    let _ = conn.send(ServerFrame::Error(ErrorFrame::new(
                        ErrorType::InvalidMessageFormat,
                        &err.to_string(),
                    )));
                    return;
                }
                let message_id = message.message_id.clone();
                let outcome = self.router.route(message).await;
                let _ = conn.send(ServerFrame::Ack(crate::protocol::Acknowledgement {
                    message_id,
                    status: outcome.as_delivery_status(),
                    timestamp: Utc::now().timestamp_millis(),
                }));
            }
            ClientFrame::Typing(mut typing) => {
                typing.agent_id = conn.agent_id.clone();
                for other in self.connections.snapshot_authenticated().await {
                    if other.agent_id != conn.agent_id {
                        let _ = other.send(ServerFrame::Typing(typing.clone()));
                    }
                }
            }
            ClientFrame::Heartbeat => {}
            ClientFrame::Authenticate(_) => {
                let _ = conn.send(ServerFrame::Error(ErrorFrame::new(
                    ErrorType::InvalidMessageFormat,
                    "already authenticated",
                )));
            }
        }
    }
}

struct PendingIdentity {
    identity: crate::auth::VerifiedIdentity,
    public_key: String,
}

async fn send_error(
    ws_sink: &mut (impl SinkExt<WsMessage, Error = axum::Error> + Unpin),
    error_type: ErrorType,
    message: &str,
) -> Result<(), axum::Error> {
    let frame = ServerFrame::Error(ErrorFrame::new(error_type, message));
    if let Ok(text) = serde_json::to_string(&frame) {
        ws_sink.send(WsMessage::Text(text)).await?;
    }
    Ok(())
}
