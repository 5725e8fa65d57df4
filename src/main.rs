use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Router,
};
use axum_prometheus::PrometheusMetricLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use agent_relay::admin;
use agent_relay::auth::TokenVerifier;
use agent_relay::config::Config;
use agent_relay::connection::ConnectionTable;
use agent_relay::heartbeat::Reaper;
use agent_relay::presence::PresenceService;
use agent_relay::pubsub::{NullPubSub, PubSubBus, RedisPubSub};
use agent_relay::ratelimit::{InMemoryBackend, RateLimitBackend, RateLimiter, RedisBackend};
use agent_relay::router::Router as MessageRouter;
use agent_relay::state::AppState;
use agent_relay::stats::Stats;
use agent_relay::websocket::websocket_handler;

#[tokio::main]
async fn main() {
    // Config determines the default log level, so it has to load before
    // tracing is initialized — there's no tracing subscriber to log a load
    // failure through yet, so that one error path falls back to `eprintln!`.
    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("failed to load configuration: {e:?}");
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "agent_relay={level},tower_http={level}",
            level = config.log_level.as_filter_str()
        )
        .parse()
        .unwrap()
    });

    if std::env::var("APP_ENV").as_deref() == Ok("production") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("agent relay starting");
    info!("configuration loaded");

    let connections = ConnectionTable::new();
    let shutdown_connections = connections.clone();
    let verifier = TokenVerifier::new(&config.auth.signing_material, config.auth.algorithm);
    let stats = Arc::new(Stats::new());

    let (bus_incoming_tx, mut bus_incoming_rx) = tokio::sync::mpsc::unbounded_channel();

    let (rate_limiter, bus): (Arc<RateLimiter>, Arc<dyn PubSubBus>) = if config.pubsub.enabled {
        match redis::Client::open(config.pubsub.redis_url()) {
            Ok(client) => match redis::aio::ConnectionManager::new(client).await {
                Ok(manager) => {
                    let redis_backend: Arc<dyn RateLimitBackend> =
                        Arc::new(RedisBackend::new(manager, config.pubsub.key_prefix.clone()));
                    let rate_limiter = Arc::new(RateLimiter::with_shared_backend(redis_backend));

                    match RedisPubSub::connect(
                        &config.pubsub.redis_url(),
                        config.pubsub.key_prefix.clone(),
                        bus_incoming_tx,
                    )
                    .await
                    {
                        Ok(bus) => {
                            info!("pub/sub backend connected");
                            (rate_limiter, Arc::new(bus) as Arc<dyn PubSubBus>)
                        }
                        Err(e) => {
                            warn!(error = ?e, "pub/sub connect failed, running single-instance");
                            (rate_limiter, Arc::new(NullPubSub) as Arc<dyn PubSubBus>)
                        }
                    }
                }
                Err(e) => {
                    warn!(error = ?e, "pub/sub configured but unreachable at startup, running single-instance");
                    (Arc::new(RateLimiter::in_memory()), Arc::new(NullPubSub) as Arc<dyn PubSubBus>)
                }
            },
            Err(e) => {
                warn!(error = ?e, "invalid pub/sub URL, running single-instance");
                (Arc::new(RateLimiter::in_memory()), Arc::new(NullPubSub) as Arc<dyn PubSubBus>)
            }
        }
    } else {
        (Arc::new(RateLimiter::in_memory()), Arc::new(NullPubSub) as Arc<dyn PubSubBus>)
    };

    let presence = Arc::new(PresenceService::new(connections.clone(), bus.clone()));
    let router = Arc::new(MessageRouter::new(connections.clone(), bus.clone(), stats.clone()));

    tokio::spawn({
        let router = router.clone();
        let presence = presence.clone();
        async move {
            while let Some(message) = bus_incoming_rx.recv().await {
                match message {
                    agent_relay::pubsub::BusMessage::Agent(payload) => router.deliver_from_bus(payload).await,
                    agent_relay::pubsub::BusMessage::Presence(event) => presence.deliver_from_bus(event).await,
                }
            }
        }
    });

    let state = Arc::new(AppState {
        config: config.clone(),
        connections: connections.clone(),
        verifier,
        rate_limiter,
        bus,
        router,
        presence: presence.clone(),
        stats: stats.clone(),
    });

    let reaper = Reaper::new(
        connections,
        presence,
        stats,
        config.response_timeout(),
        std::time::Duration::from_secs(10),
    );
    tokio::spawn(reaper.run());

    let cors = match &config.cors_origin {
        Some(origin) => match HeaderValue::from_str(origin) {
            Ok(value) => CorsLayer::new()
                .allow_origin(AllowOrigin::exact(value))
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, "x-admin-key".parse().unwrap()]),
            Err(_) => {
                warn!("invalid CORS_ORIGIN, falling back to permissive CORS");
                CorsLayer::permissive()
            }
        },
        None => CorsLayer::permissive(),
    };

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    let app = Router::new()
        .route(&config.path, get(websocket_handler))
        .route("/health", get(|| async { "ok" }))
        .merge(admin::router(state.clone()))
        .route(
            "/metrics",
            get(move || async move { metric_handle.render() }),
        )
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(prometheus_layer)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = ?e, addr = %addr, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(addr = %addr, "listening");

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_connections))
    .await;

    match result {
        Ok(()) => {
            info!("shutdown complete");
            std::process::exit(0);
        }
        Err(e) => {
            error!(error = ?e, "server error");
            std::process::exit(1);
        }
    }
}

/// Waits for SIGINT/SIGTERM, then gives in-flight session shutdown a 30 s
/// grace budget, after which every connection still on the table is
/// forcibly notified closed rather than left for `axum::serve` to drop.
async fn shutdown_signal(connections: ConnectionTable) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, grace budget 30s");
    static GRACE_ELAPSED: AtomicBool = AtomicBool::new(false);
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        if !GRACE_ELAPSED.swap(true, Ordering::Relaxed) {
            let remaining = connections.snapshot().await;
            warn!(remaining = remaining.len(), "graceful shutdown grace budget elapsed, forcing close");
            for conn in remaining {
                conn.set_status(agent_relay::connection::ConnectionStatus::Disconnecting);
                conn.shutdown.notify_one();
            }
        }
    });
}
