use std::sync::Arc;

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::connection::ConnectionTable;
use crate::presence::PresenceService;
use crate::pubsub::PubSubBus;
use crate::ratelimit::RateLimiter;
use crate::router::Router;
use crate::stats::Stats;

/// Shared application state passed to the websocket upgrade handler and
/// every admin HTTP handler. Everything here is already cheaply cloneable
/// or wrapped in `Arc`, so the type itself is handed around behind a single
/// outer `Arc<AppState>` rather than derived `Clone`.
pub struct AppState {
    pub config: Arc<Config>,
    pub connections: ConnectionTable,
    pub verifier: TokenVerifier,
    pub rate_limiter: Arc<RateLimiter>,
    pub bus: Arc<dyn PubSubBus>,
    pub router: Arc<Router>,
    pub presence: Arc<PresenceService>,
    pub stats: Arc<Stats>,
}
