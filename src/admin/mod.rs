//! HTTP admin surface: read-only visibility into connection/presence state
//! plus operator actions (forced disconnect, server-originated injection).
//!
//! Thin axum handlers returning `AppResult<Json<_>>`, gated behind a shared
//! admin key instead of per-user auth, since there is no user session
//! concept here.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::protocol::MessageEnvelope;
use crate::ratelimit::{extract_identity, RateLimitClass};
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/websocket/stats", axum::routing::get(stats))
        .route("/websocket/connection/:agent_id", axum::routing::get(connection_presence))
        .route(
            "/websocket/connection/:agent_id/details",
            axum::routing::get(connection_details),
        )
        .route(
            "/websocket/connection/:agent_id",
            axum::routing::delete(disconnect_agent),
        )
        .route("/websocket/message", axum::routing::post(inject_message))
        .route("/websocket/broadcast", axum::routing::post(inject_broadcast))
        .route_layer(axum::middleware::from_fn_with_state(state, require_admin_key))
}

/// Rejects any request that doesn't carry a matching `X-Admin-Key` header.
/// When no admin key is configured, falls back to loopback-only access.
/// Every request on this surface also consumes a `general-api` rate-limit
/// token, keyed the same way the websocket's pre-auth classes are — prefer
/// `X-Forwarded-For`, else the direct remote IP.
async fn require_admin_key(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let forwarded_for = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok());
    let remote_ip = connect_info
        .as_ref()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let identity = extract_identity(None, forwarded_for, &remote_ip);
    let gate = state
        .rate_limiter
        .consume(RateLimitClass::GeneralApi, &identity, 1.0)
        .await;
    if !gate.is_allowed() {
        return AppError::RateLimited("admin api rate limit exceeded".into()).into_response();
    }

    match &state.config.admin_api_key {
        Some(expected) => {
            let provided = headers.get("x-admin-key").and_then(|v| v.to_str().ok());
            if provided == Some(expected.as_str()) {
                next.run(req).await
            } else {
                StatusCode::UNAUTHORIZED.into_response()
            }
        }
        None => match connect_info {
            Some(ConnectInfo(addr)) if addr.ip().is_loopback() => next.run(req).await,
            _ => StatusCode::NOT_FOUND.into_response(),
        },
    }
}

#[derive(Serialize)]
struct ConnectionPresenceResponse {
    #[serde(rename = "isConnected")]
    is_connected: bool,
    #[serde(rename = "agentId")]
    agent_id: String,
}

async fn stats(State(state): State<Arc<AppState>>) -> AppResult<Json<crate::stats::StatsSnapshot>> {
    Ok(Json(state.stats.snapshot()))
}

async fn connection_presence(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> AppResult<Json<ConnectionPresenceResponse>> {
    let is_connected = state.connections.is_connected(&agent_id).await;
    Ok(Json(ConnectionPresenceResponse { is_connected, agent_id }))
}

async fn connection_details(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> AppResult<Json<crate::connection::SanitizedConnection>> {
    let conn = state
        .connections
        .get_by_agent_id(&agent_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("no connection for agent {agent_id}")))?;
    Ok(Json(conn.sanitized()))
}

#[derive(Serialize)]
struct DisconnectResponse {
    success: bool,
    #[serde(rename = "agentId")]
    agent_id: String,
}

async fn disconnect_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> AppResult<Json<DisconnectResponse>> {
    let conn = state
        .connections
        .get_by_agent_id(&agent_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("no connection for agent {agent_id}")))?;
    conn.set_status(crate::connection::ConnectionStatus::Disconnecting);
    conn.shutdown.notify_one();
    Ok(Json(DisconnectResponse {
        success: true,
        agent_id,
    }))
}

async fn inject_message(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<MessageEnvelope>,
) -> AppResult<Json<crate::protocol::Acknowledgement>> {
    envelope
        .validate_shape()
        .map_err(|e| AppError::Validation(e.to_string()))?;
    let message_id = envelope.message_id.clone();
    let outcome = state.router.route(envelope).await;
    Ok(Json(crate::protocol::Acknowledgement {
        message_id,
        status: outcome.as_delivery_status(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    }))
}

async fn inject_broadcast(
    State(state): State<Arc<AppState>>,
    Json(mut envelope): Json<MessageEnvelope>,
) -> AppResult<Json<crate::protocol::Acknowledgement>> {
    envelope.recipient_agent_id.clear();
    envelope
        .validate_shape()
        .map_err(|e| AppError::Validation(e.to_string()))?;
    let message_id = envelope.message_id.clone();
    let outcome = state.router.route(envelope).await;
    Ok(Json(crate::protocol::Acknowledgement {
        message_id,
        status: outcome.as_delivery_status(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    }))
}
