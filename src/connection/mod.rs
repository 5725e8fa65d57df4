//! Connection + ConnectionTable.
//!
//! `Connection` is owned by exactly one `SocketSession` task, which is the
//! only writer of its `status`/`last_activity_at` fields; everyone else
//! (Router, Reaper, AdminSurface) reads through a `ConnectionTable` lookup
//! and only ever obtains an `Arc<Connection>` — never a mutable reference.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, Notify, RwLock};
use uuid::Uuid;

use crate::protocol::ServerFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Disconnecting,
    Disconnected,
    Error,
}

/// Client-reported connection metadata. Never exposed to other agents;
/// sanitized before it ever reaches the admin surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientMetadata {
    pub user_agent: Option<String>,
    pub remote_addr: Option<String>,
    pub device_id: Option<String>,
}

/// A single live (or dying) socket. Cheaply shared via `Arc` — the
/// `ConnectionTable` and every component that resolves a recipient hold a
/// clone of the `Arc`, never the owning task's exclusive handle.
pub struct Connection {
    pub connection_id: Uuid,
    pub agent_id: String,
    pub user_id: Uuid,
    /// Opaque client public key for end-to-end encryption. The relay does
    /// not interpret it and never serializes it into admin responses.
    pub public_key: String,
    pub connected_at: i64,
    pub metadata: ClientMetadata,
    status: StdRwLock<ConnectionStatus>,
    last_activity_at: AtomicI64,
    /// Outbound frame channel; the owning task's send-loop drains this and
    /// writes frames to the real socket. Never awaited on while holding the
    /// `ConnectionTable` lock.
    sender: mpsc::UnboundedSender<ServerFrame>,
    /// Signaled by the table when this connection is superseded by a fresh
    /// authentication for the same agent, or by the server on shutdown.
    pub shutdown: Notify,
}

impl Connection {
    pub fn new(
        connection_id: Uuid,
        agent_id: String,
        user_id: Uuid,
        public_key: String,
        metadata: ClientMetadata,
        sender: mpsc::UnboundedSender<ServerFrame>,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            connection_id,
            agent_id,
            user_id,
            public_key,
            connected_at: now,
            metadata,
            status: StdRwLock::new(ConnectionStatus::Connecting),
            last_activity_at: AtomicI64::new(now),
            sender,
            shutdown: Notify::new(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read().expect("connection status lock poisoned")
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        *self.status.write().expect("connection status lock poisoned") = status;
    }

    pub fn last_activity_at(&self) -> i64 {
        self.last_activity_at.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.last_activity_at
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Write a frame to this connection's outbound queue. Never blocks: a
    /// full or closed channel means the connection is going away, which is
    /// always non-fatal to the caller.
    pub fn send(&self, frame: ServerFrame) -> Result<(), ()> {
        self.sender.send(frame).map_err(|_| ())
    }

    /// Sanitized view for the admin surface — never includes the public key
    /// or any transport handle.
    pub fn sanitized(&self) -> SanitizedConnection {
        SanitizedConnection {
            connection_id: self.connection_id,
            agent_id: self.agent_id.clone(),
            user_id: self.user_id,
            status: self.status(),
            connected_at: self.connected_at,
            last_activity_at: self.last_activity_at(),
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConnection {
    pub connection_id: Uuid,
    pub agent_id: String,
    pub user_id: Uuid,
    pub status: ConnectionStatus,
    pub connected_at: i64,
    pub last_activity_at: i64,
    pub metadata: ClientMetadata,
}

struct TableInner {
    by_connection: std::collections::HashMap<Uuid, Arc<Connection>>,
    by_agent: std::collections::HashMap<String, Uuid>,
}

/// In-memory connection registry. Two maps behind one lock so removal is
/// always atomic across both indexes.
#[derive(Clone)]
pub struct ConnectionTable {
    inner: Arc<RwLock<TableInner>>,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(TableInner {
                by_connection: std::collections::HashMap::new(),
                by_agent: std::collections::HashMap::new(),
            })),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_connection.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Register an AUTHENTICATED connection, superseding and returning any
    /// prior connection for the same agent id. The caller is responsible
    /// for signaling the superseded connection's
    /// `shutdown` notifier and tagging it with reason "superseded".
    pub async fn insert_authenticated(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write().await;
        let previous_id = inner.by_agent.insert(conn.agent_id.clone(), conn.connection_id);
        let previous = previous_id.and_then(|id| inner.by_connection.remove(&id));
        inner.by_connection.insert(conn.connection_id, conn);
        previous
    }

    pub async fn get_by_connection_id(&self, connection_id: Uuid) -> Option<Arc<Connection>> {
        self.inner.read().await.by_connection.get(&connection_id).cloned()
    }

    pub async fn get_by_agent_id(&self, agent_id: &str) -> Option<Arc<Connection>> {
        let inner = self.inner.read().await;
        let connection_id = inner.by_agent.get(agent_id)?;
        inner.by_connection.get(connection_id).cloned()
    }

    pub async fn is_connected(&self, agent_id: &str) -> bool {
        self.get_by_agent_id(agent_id).await.is_some()
    }

    /// Remove a connection, but only if the agent index still points at it —
    /// a stale connection's own cleanup must not clobber a fresher one that
    /// has since superseded it.
    pub async fn remove(&self, connection_id: Uuid, agent_id: &str) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write().await;
        if inner.by_agent.get(agent_id) == Some(&connection_id) {
            inner.by_agent.remove(agent_id);
        }
        inner.by_connection.remove(&connection_id)
    }

    /// Snapshot of every connection, taken without holding the lock during
    /// any subsequent I/O.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.read().await.by_connection.values().cloned().collect()
    }

    pub async fn snapshot_authenticated(&self) -> Vec<Arc<Connection>> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|c| c.status() == ConnectionStatus::Authenticated)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection(agent_id: &str) -> (Arc<Connection>, mpsc::UnboundedReceiver<ServerFrame>) {
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
        (conn, rx)
    }

    #[tokio::test]
    async fn insert_and_lookup_round_trip() {
        let table = ConnectionTable::new();
        let (conn, _rx) = make_connection("agent-a");
        let connection_id = conn.connection_id;

        assert!(table.insert_authenticated(conn).await.is_none());
        assert!(table.get_by_connection_id(connection_id).await.is_some());
        assert!(table.get_by_agent_id("agent-a").await.is_some());
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn second_authentication_supersedes_first() {
        let table = ConnectionTable::new();
        let (first, _rx1) = make_connection("agent-a");
        let first_id = first.connection_id;
        table.insert_authenticated(first).await;

        let (second, _rx2) = make_connection("agent-a");
        let second_id = second.connection_id;
        let superseded = table.insert_authenticated(second).await;

        assert_eq!(superseded.unwrap().connection_id, first_id);
        assert_eq!(table.len().await, 1);
        assert_eq!(
            table.get_by_agent_id("agent-a").await.unwrap().connection_id,
            second_id
        );
    }

    #[tokio::test]
    async fn stale_connection_cleanup_does_not_clobber_fresh_one() {
        let table = ConnectionTable::new();
        let (first, _rx1) = make_connection("agent-a");
        let first_id = first.connection_id;
        table.insert_authenticated(first).await;

        let (second, _rx2) = make_connection("agent-a");
        let second_id = second.connection_id;
        table.insert_authenticated(second).await;

        // The stale connection's own teardown runs after it was superseded.
        table.remove(first_id, "agent-a").await;

        assert!(table.is_connected("agent-a").await);
        assert_eq!(
            table.get_by_agent_id("agent-a").await.unwrap().connection_id,
            second_id
        );
    }

    #[tokio::test]
    async fn remove_clears_both_indexes() {
        let table = ConnectionTable::new();
        let (conn, _rx) = make_connection("agent-a");
        let connection_id = conn.connection_id;
        table.insert_authenticated(conn).await;

        table.remove(connection_id, "agent-a").await;

        assert!(table.get_by_connection_id(connection_id).await.is_none());
        assert!(table.get_by_agent_id("agent-a").await.is_none());
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn snapshot_authenticated_filters_by_status() {
        let table = ConnectionTable::new();
        let (conn, _rx) = make_connection("agent-a");
        conn.set_status(ConnectionStatus::Disconnecting);
        table.insert_authenticated(conn).await;

        assert_eq!(table.snapshot_authenticated().await.len(), 0);
        assert_eq!(table.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn sanitized_connection_never_carries_public_key() {
        let (conn, _rx) = make_connection("agent-a");
        let sanitized = conn.sanitized();
        let json = serde_json::to_value(&sanitized).unwrap();
        assert!(json.get("public_key").is_none());
        assert!(json.get("publicKey").is_none());
    }

    #[tokio::test]
    async fn touch_advances_last_activity() {
        let (conn, _rx) = make_connection("agent-a");
        let before = conn.last_activity_at();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        conn.touch();
        assert!(conn.last_activity_at() >= before);
    }
}
