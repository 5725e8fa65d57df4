use std::net::SocketAddr;
use std::sync::Arc;

use agent_relay::auth::TokenVerifier;
use agent_relay::config::{AuthConfig, Config, LogLevel, PubSubConfig};
use agent_relay::connection::ConnectionTable;
use agent_relay::presence::PresenceService;
use agent_relay::pubsub::NullPubSub;
use agent_relay::ratelimit::RateLimiter;
use agent_relay::router::Router as MessageRouter;
use agent_relay::state::AppState;
use agent_relay::stats::Stats;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use jsonwebtoken::Algorithm;
use tower::ServiceExt;

/// `oneshot` requests built via `Request::builder()` carry no `ConnectInfo`
/// extension the way a real connection would — insert a loopback address so
/// tests with no configured admin key exercise the loopback-fallback branch
/// instead of falling into `require_admin_key`'s deny-by-default arm.
fn with_loopback_connect_info(mut req: Request<Body>) -> Request<Body> {
    let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
    req.extensions_mut().insert(ConnectInfo(addr));
    req
}

fn test_config(admin_api_key: Option<&str>) -> Config {
    Config {
        server_host: "127.0.0.1".into(),
        server_port: 0,
        path: "/socket.io".into(),
        max_connections: 10,
        ping_interval_ms: 30_000,
        ping_timeout_ms: 10_000,
        upgrade_timeout_ms: 30_000,
        pubsub: PubSubConfig::default(),
        auth: AuthConfig {
            signing_material: "test-signing-material-at-least-32-bytes".into(),
            algorithm: Algorithm::HS256,
            access_ttl_s: 900,
            refresh_ttl_s: 604_800,
        },
        log_level: LogLevel::Info,
        cors_origin: None,
        admin_api_key: admin_api_key.map(|s| s.to_string()),
    }
}

fn build_app(admin_api_key: Option<&str>) -> axum::Router {
    let config = Arc::new(test_config(admin_api_key));
    let connections = ConnectionTable::new();
    let verifier = TokenVerifier::new(&config.auth.signing_material, config.auth.algorithm);
    let stats = Arc::new(Stats::new());
    let bus = Arc::new(NullPubSub);
    let presence = Arc::new(PresenceService::new(connections.clone(), bus.clone()));
    let router = Arc::new(MessageRouter::new(connections.clone(), bus.clone(), stats.clone()));
    let rate_limiter = Arc::new(RateLimiter::in_memory());

    let state = Arc::new(AppState {
        config,
        connections,
        verifier,
        rate_limiter,
        bus,
        router,
        presence,
        stats,
    });

    axum::Router::new()
        .merge(agent_relay::admin::router(state.clone()))
        .with_state(state)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn stats_endpoint_requires_admin_key_when_configured() {
    let app = build_app(Some("secret-key"));

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/websocket/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/websocket/stats")
                .header("x-admin-key", "secret-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn connection_presence_reports_not_connected_for_unknown_agent() {
    let app = build_app(None);

    let response = app
        .oneshot(with_loopback_connect_info(
            Request::builder()
                .uri("/websocket/connection/agent-ghost")
                .body(Body::empty())
                .unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["isConnected"], false);
    assert_eq!(json["agentId"], "agent-ghost");
}

#[tokio::test]
async fn connection_details_returns_404_for_unknown_agent() {
    let app = build_app(None);

    let response = app
        .oneshot(with_loopback_connect_info(
            Request::builder()
                .uri("/websocket/connection/agent-ghost/details")
                .body(Body::empty())
                .unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn broadcast_injection_with_no_connected_agents_reports_sent_with_no_recipients() {
    let app = build_app(None);

    let body = serde_json::json!({
        "messageId": "m1",
        "conversationId": "c1",
        "senderAgentId": "system",
        "recipientAgentId": "",
        "messageType": "QUERY",
        "content": {},
        "timestamp": 0,
        "metadata": {"priority": "NORMAL", "expiresAt": null},
        "encrypted": false,
        "signature": ""
    });

    let response = app
        .oneshot(with_loopback_connect_info(
            Request::builder()
                .method("POST")
                .uri("/websocket/broadcast")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["messageId"], "m1");
    assert_eq!(json["status"], "SENT");
}
