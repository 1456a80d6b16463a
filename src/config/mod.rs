use serde::Deserialize;
use std::env;

/// Top-level configuration, one section per concern.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub booking: BookingConfig,
    pub broadcast: BroadcastConfig,
    pub notification: NotificationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub rust_log: String,
}

impl AppConfig {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
}

/// Seat-map cache. Without a url the service reads straight from the store.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: Option<String>,
    pub seat_map_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookingConfig {
    pub cancellation_window_minutes: i64,
    pub code_retry_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    pub keep_alive_seconds: u64,
    pub subscriber_buffer: usize,
}

// Confirmations are logged instead of sent while relay_url is unset.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    pub relay_url: Option<String>,
    pub sender: String,
    pub timeout_seconds: u64,
    pub failure_threshold: u32,
    pub reset_timeout_seconds: u64,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self { cancellation_window_minutes: 120, code_retry_attempts: 3 }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { keep_alive_seconds: 15, subscriber_buffer: 64 }
    }
}

impl Config {
    /// Defaults, then `BILLETTER_SECTION__KEY` variables, then the usual
    /// unprefixed `DATABASE_URL`, `REDIS_URL`, `PORT` and `RUST_LOG`.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("app.host", "0.0.0.0")?
            .set_default("app.port", 8000_i64)?
            .set_default("app.environment", "development")?
            .set_default("app.rust_log", "billetter=debug,tower_http=debug")?
            .set_default("database.pool_size", 20_i64)?
            .set_default("redis.seat_map_ttl_seconds", 30_i64)?
            .set_default("booking.cancellation_window_minutes", 120_i64)?
            .set_default("booking.code_retry_attempts", 3_i64)?
            .set_default("broadcast.keep_alive_seconds", 15_i64)?
            .set_default("broadcast.subscriber_buffer", 64_i64)?
            .set_default("notification.sender", "tickets@billetter.local")?
            .set_default("notification.timeout_seconds", 5_i64)?
            .set_default("notification.failure_threshold", 5_i64)?
            .set_default("notification.reset_timeout_seconds", 60_i64)?
            .add_source(
                config::Environment::with_prefix("BILLETTER")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(url) = env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", url)?;
        }
        if let Ok(url) = env::var("REDIS_URL") {
            builder = builder.set_override("redis.url", url)?;
        }
        if let Ok(port) = env::var("PORT") {
            builder = builder.set_override("app.port", port)?;
        }
        if let Ok(filter) = env::var("RUST_LOG") {
            builder = builder.set_override("app.rust_log", filter)?;
        }

        builder.build()?.try_deserialize()
    }
}
