//! RateLimiter: token-bucket per `(class, identity)` with fractional point
//! costs and independent block windows.
//!
//! `governor` models an integer quota and doesn't expose
//! `points-remaining`/`reset-at`/`block-until` on the bucket itself, nor does
//! it support a 0.1-point HEARTBEAT cost. This module is a small bespoke
//! token bucket instead, with the backend storage abstracted behind a trait
//! so an in-process map and a shared-counter store can share the same
//! bucket math.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

const WINDOW_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitClass {
    ConnectionAttempts,
    AuthenticationAttempts,
    GeneralApi,
    WebsocketMessages,
}

impl RateLimitClass {
    /// Default (points-per-minute, block-duration-ms) for this class.
    pub fn defaults(self) -> (f64, i64) {
        match self {
            RateLimitClass::ConnectionAttempts => (5.0, 60_000),
            RateLimitClass::AuthenticationAttempts => (5.0, 300_000),
            RateLimitClass::GeneralApi => (120.0, 60_000),
            RateLimitClass::WebsocketMessages => (60.0, 30_000),
        }
    }

    fn key(self) -> &'static str {
        match self {
            RateLimitClass::ConnectionAttempts => "connection-attempts",
            RateLimitClass::AuthenticationAttempts => "authentication-attempts",
            RateLimitClass::GeneralApi => "general-api",
            RateLimitClass::WebsocketMessages => "websocket-messages",
        }
    }
}

/// Per-message-type point costs.
pub fn message_cost(message_type: crate::protocol::MessageType) -> f64 {
    match message_type {
        crate::protocol::MessageType::Heartbeat => 0.1,
        crate::protocol::MessageType::Handshake => 2.0,
        _ => 1.0,
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    points_remaining: f64,
    reset_at: i64,
    block_until: Option<i64>,
}

impl Bucket {
    fn fresh(points_per_minute: f64, now_ms: i64) -> Self {
        Self {
            points_remaining: points_per_minute,
            reset_at: now_ms + WINDOW_MS,
            block_until: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConsumeOutcome {
    Allowed,
    Denied { retry_after_ms: u64 },
}

impl ConsumeOutcome {
    pub fn is_allowed(self) -> bool {
        matches!(self, ConsumeOutcome::Allowed)
    }
}

/// Applies the shared token-bucket algorithm to one bucket in place. Pure
/// function so both backends (and their tests) exercise identical math.
fn apply(bucket: &mut Bucket, points_per_minute: f64, block_duration_ms: i64, cost: f64, now_ms: i64) -> ConsumeOutcome {
    if now_ms >= bucket.reset_at {
        *bucket = Bucket::fresh(points_per_minute, now_ms);
    }

    if let Some(block_until) = bucket.block_until {
        if now_ms < block_until {
            return ConsumeOutcome::Denied {
                retry_after_ms: (block_until - now_ms).max(0) as u64,
            };
        }
        bucket.block_until = None;
    }

    if bucket.points_remaining < cost {
        bucket.block_until = Some(now_ms + block_duration_ms);
        return ConsumeOutcome::Denied {
            retry_after_ms: block_duration_ms as u64,
        };
    }

    bucket.points_remaining -= cost;
    ConsumeOutcome::Allowed
}

#[derive(Debug)]
pub struct BackendUnavailable;

/// Storage abstraction for rate-limit buckets.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    async fn consume(
        &self,
        class: RateLimitClass,
        identity: &str,
        cost: f64,
        now_ms: i64,
    ) -> Result<ConsumeOutcome, BackendUnavailable>;
}

/// In-process bucket map guarded by a single lock — always available, and
/// the fallback target when a shared backend is configured but unreachable.
#[derive(Default)]
pub struct InMemoryBackend {
    buckets: RwLock<HashMap<(RateLimitClass, String), Bucket>>,
}

#[async_trait]
impl RateLimitBackend for InMemoryBackend {
    async fn consume(
        &self,
        class: RateLimitClass,
        identity: &str,
        cost: f64,
        now_ms: i64,
    ) -> Result<ConsumeOutcome, BackendUnavailable> {
        let (points_per_minute, block_duration_ms) = class.defaults();
        let mut buckets = self.buckets.write().await;
        let bucket = buckets
            .entry((class, identity.to_string()))
            .or_insert_with(|| Bucket::fresh(points_per_minute, now_ms));
        Ok(apply(bucket, points_per_minute, block_duration_ms, cost, now_ms))
    }
}

/// Shared-counter backend over Redis, keyed `{prefix}:rl:{class}:{identity}`.
/// Applies the same bucket math as `InMemoryBackend` but persists the bucket
/// as a Redis hash so every instance in the fleet observes the same counts.
pub struct RedisBackend {
    manager: redis::aio::ConnectionManager,
    key_prefix: String,
}

impl RedisBackend {
    pub fn new(manager: redis::aio::ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            manager,
            key_prefix: key_prefix.into(),
        }
    }

    fn redis_key(&self, class: RateLimitClass, identity: &str) -> String {
        format!("{}:rl:{}:{}", self.key_prefix, class.key(), identity)
    }
}

#[async_trait]
impl RateLimitBackend for RedisBackend {
    async fn consume(
        &self,
        class: RateLimitClass,
        identity: &str,
        cost: f64,
        now_ms: i64,
    ) -> Result<ConsumeOutcome, BackendUnavailable> {
        use redis::AsyncCommands;

        let (points_per_minute, block_duration_ms) = class.defaults();
        let key = self.redis_key(class, identity);
        let mut conn = self.manager.clone();

        let existing: Option<(f64, i64, i64)> = conn
            .hget(&key, &["points", "reset_at", "block_until"])
            .await
            .map_err(|_| BackendUnavailable)?;

        let mut bucket = match existing {
            Some((points, reset_at, block_until)) => Bucket {
                points_remaining: points,
                reset_at,
                block_until: if block_until > 0 { Some(block_until) } else { None },
            },
            None => Bucket::fresh(points_per_minute, now_ms),
        };

        let outcome = apply(&mut bucket, points_per_minute, block_duration_ms, cost, now_ms);

        let _: () = redis::pipe()
            .hset(&key, "points", bucket.points_remaining)
            .ignore()
            .hset(&key, "reset_at", bucket.reset_at)
            .ignore()
            .hset(&key, "block_until", bucket.block_until.unwrap_or(0))
            .ignore()
            .expire(&key, (WINDOW_MS / 1000 + block_duration_ms / 1000 + 1) as i64)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|_| BackendUnavailable)?;

        Ok(outcome)
    }
}

/// Public entry point used by the websocket layer, the admin HTTP surface,
/// and the connection-accept path.
pub struct RateLimiter {
    primary: Arc<dyn RateLimitBackend>,
    fallback: Option<Arc<InMemoryBackend>>,
    fallback_logged: AtomicBool,
}

impl RateLimiter {
    pub fn in_memory() -> Self {
        Self {
            primary: Arc::new(InMemoryBackend::default()),
            fallback: None,
            fallback_logged: AtomicBool::new(false),
        }
    }

    /// When `primary` (typically `RedisBackend`) is unreachable, falls back
    /// to an in-process bucket map and logs the degradation exactly once.
    /// With N instances behind the fallback, burst overage is bounded by N
    /// times the per-minute cap.
    pub fn with_shared_backend(primary: Arc<dyn RateLimitBackend>) -> Self {
        Self {
            primary,
            fallback: Some(Arc::new(InMemoryBackend::default())),
            fallback_logged: AtomicBool::new(false),
        }
    }

    pub async fn consume(&self, class: RateLimitClass, identity: &str, cost: f64) -> ConsumeOutcome {
        let now_ms = chrono::Utc::now().timestamp_millis();
        match self.primary.consume(class, identity, cost, now_ms).await {
            Ok(outcome) => outcome,
            Err(BackendUnavailable) => {
                if !self.fallback_logged.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        class = class.key(),
                        "rate limiter shared backend unreachable; falling back to in-process limiting"
                    );
                }
                self.fallback
                    .as_ref()
                    .expect("fallback configured whenever a shared backend is set")
                    .consume(class, identity, cost, now_ms)
                    .await
                    .expect("in-memory backend never reports unavailable")
            }
        }
    }
}

/// Identity extraction rule: prefer the authenticated user id; otherwise the
/// first `X-Forwarded-For` entry, else the direct remote IP.
pub fn extract_identity(user_id: Option<&str>, forwarded_for: Option<&str>, remote_ip: &str) -> String {
    if let Some(user_id) = user_id {
        return user_id.to_string();
    }
    if let Some(forwarded) = forwarded_for {
        if let Some(first) = forwarded.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    remote_ip.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    #[tokio::test]
    async fn allows_up_to_the_per_minute_cap() {
        let limiter = RateLimiter::in_memory();
        for _ in 0..60 {
            let outcome = limiter
                .consume(RateLimitClass::WebsocketMessages, "agent-a", 1.0)
                .await;
            assert_eq!(outcome, ConsumeOutcome::Allowed);
        }
    }

    #[tokio::test]
    async fn denies_the_request_past_the_cap() {
        let limiter = RateLimiter::in_memory();
        for _ in 0..60 {
            limiter
                .consume(RateLimitClass::WebsocketMessages, "agent-a", 1.0)
                .await;
        }
        let outcome = limiter
            .consume(RateLimitClass::WebsocketMessages, "agent-a", 1.0)
            .await;
        match outcome {
            ConsumeOutcome::Denied { retry_after_ms } => assert!(retry_after_ms >= 1000),
            ConsumeOutcome::Allowed => panic!("61st message must be denied"),
        }
    }

    #[tokio::test]
    async fn heartbeat_cost_allows_far_more_than_the_nominal_cap() {
        let limiter = RateLimiter::in_memory();
        for _ in 0..600 {
            let outcome = limiter
                .consume(RateLimitClass::WebsocketMessages, "agent-a", message_cost(MessageType::Heartbeat))
                .await;
            assert_eq!(outcome, ConsumeOutcome::Allowed);
        }
    }

    #[tokio::test]
    async fn buckets_are_independent_per_identity() {
        let limiter = RateLimiter::in_memory();
        for _ in 0..60 {
            limiter
                .consume(RateLimitClass::WebsocketMessages, "agent-a", 1.0)
                .await;
        }
        let outcome = limiter
            .consume(RateLimitClass::WebsocketMessages, "agent-b", 1.0)
            .await;
        assert_eq!(outcome, ConsumeOutcome::Allowed);
    }

    #[tokio::test]
    async fn buckets_are_independent_per_class() {
        let limiter = RateLimiter::in_memory();
        for _ in 0..60 {
            limiter
                .consume(RateLimitClass::WebsocketMessages, "agent-a", 1.0)
                .await;
        }
        let outcome = limiter
            .consume(RateLimitClass::GeneralApi, "agent-a", 1.0)
            .await;
        assert_eq!(outcome, ConsumeOutcome::Allowed);
    }

    #[tokio::test]
    async fn points_remaining_never_goes_negative() {
        let backend = InMemoryBackend::default();
        for _ in 0..1000 {
            let _ = backend
                .consume(RateLimitClass::WebsocketMessages, "agent-a", 1.0, 0)
                .await;
        }
        let buckets = backend.buckets.read().await;
        let bucket = buckets
            .get(&(RateLimitClass::WebsocketMessages, "agent-a".to_string()))
            .unwrap();
        assert!(bucket.points_remaining >= 0.0);
    }

    #[test]
    fn identity_prefers_user_id() {
        let id = extract_identity(Some("user-1"), Some("1.2.3.4"), "9.9.9.9");
        assert_eq!(id, "user-1");
    }

    #[test]
    fn identity_falls_back_to_forwarded_for_first_entry() {
        let id = extract_identity(None, Some("1.2.3.4, 5.6.7.8"), "9.9.9.9");
        assert_eq!(id, "1.2.3.4");
    }

    #[test]
    fn identity_falls_back_to_remote_ip() {
        let id = extract_identity(None, None, "9.9.9.9");
        assert_eq!(id, "9.9.9.9");
    }
}
