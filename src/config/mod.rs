//! Configuration, loaded from the environment the way the rest of this
//! corpus loads configuration: `dotenvy` for local `.env` files, sane
//! defaults for everything optional.

use std::env;
use std::time::Duration;

use jsonwebtoken::Algorithm;

#[derive(Clone, Debug)]
pub struct PubSubConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub key_prefix: String,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 6379,
            key_prefix: "agent-relay".to_string(),
        }
    }
}

impl PubSubConfig {
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub signing_material: String,
    pub algorithm: Algorithm,
    pub access_ttl_s: i64,
    pub refresh_ttl_s: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn from_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    /// Socket endpoint path. Default `/socket.io`.
    pub path: String,
    pub max_connections: usize,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub upgrade_timeout_ms: u64,
    pub pubsub: PubSubConfig,
    pub auth: AuthConfig,
    pub log_level: LogLevel,
    pub cors_origin: Option<String>,
    /// Shared secret required on `X-Admin-Key` for the admin HTTP surface.
    /// Unset means loopback-only access instead.
    pub admin_api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        dotenvy::dotenv().ok();

        let auth = AuthConfig {
            signing_material: env::var("AUTH_SIGNING_MATERIAL")
                .unwrap_or_else(|_| "dev_secret_change_in_production".to_string()),
            algorithm: match env::var("AUTH_ALGORITHM").as_deref() {
                Ok("HS384") => Algorithm::HS384,
                Ok("HS512") => Algorithm::HS512,
                _ => Algorithm::HS256,
            },
            access_ttl_s: env::var("AUTH_ACCESS_TTL_S")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(900),
            refresh_ttl_s: env::var("AUTH_REFRESH_TTL_S")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(604_800),
        };

        let pubsub = PubSubConfig {
            enabled: env::var("PUBSUB_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            host: env::var("PUBSUB_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("PUBSUB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(6379),
            key_prefix: env::var("PUBSUB_KEY_PREFIX")
                .unwrap_or_else(|_| "agent-relay".to_string()),
        };

        Ok(Config {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            server_port: env::var("SERVER_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            path: env::var("RELAY_PATH").unwrap_or_else(|_| "/socket.io".to_string()),
            max_connections: env::var("MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000),
            ping_interval_ms: env_u64("PING_INTERVAL_MS", 30_000),
            ping_timeout_ms: env_u64("PING_TIMEOUT_MS", 10_000),
            upgrade_timeout_ms: env_u64("UPGRADE_TIMEOUT_MS", 30_000),
            pubsub,
            auth,
            log_level: LogLevel::from_str(&env::var("LOG_LEVEL").unwrap_or_default()),
            cors_origin: env::var("CORS_ORIGIN").ok(),
            admin_api_key: env::var("ADMIN_API_KEY").ok(),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn authentication_deadline(&self) -> Duration {
        Duration::from_millis(self.upgrade_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
