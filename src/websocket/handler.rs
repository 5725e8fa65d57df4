//! Socket upgrade endpoint. The upgrade is accepted unconditionally
//! (subject to the connection cap); authentication happens in-band
//! afterward, driven by `SocketSession`, rather than via a query-string
//! token before upgrade.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::SinkExt;

use crate::error::{ErrorFrame, ErrorType};
use crate::protocol::ServerFrame;
use crate::session::{SessionConfig, SocketSession};
use crate::state::AppState;

/// First entry of `X-Forwarded-For`, if present — fed to the rate limiter's
/// identity extraction so a fleet behind a load balancer doesn't collapse
/// every client onto the balancer's own IP.
fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let forwarded_for = forwarded_for(&headers);

    if state.connections.len().await >= state.config.max_connections {
        tracing::warn!(remote_addr = %remote_addr, "rejecting connection: at capacity");
        // The client can only receive a typed error frame over an
        // established socket, so the upgrade still happens even though the
        // connection is about to be refused.
        return ws.on_upgrade(move |mut socket| async move {
            let frame = ServerFrame::Error(ErrorFrame::new(
                ErrorType::ConnectionLimitExceeded,
                "server is at capacity",
            ));
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = socket.send(WsMessage::Text(text)).await;
            }
            let _ = socket.send(WsMessage::Close(None)).await;
        });
    }

    ws.on_upgrade(move |socket| async move {
        let session = SocketSession::new(
            state.connections.clone(),
            state.verifier.clone(),
            state.rate_limiter.clone(),
            state.router.clone(),
            state.presence.clone(),
            state.stats.clone(),
            SessionConfig {
                authentication_deadline: state.config.authentication_deadline(),
                heartbeat_interval: state.config.heartbeat_interval(),
                response_timeout: state.config.response_timeout(),
            },
        );
        session.run(socket, remote_addr, forwarded_for).await;
    })
}
