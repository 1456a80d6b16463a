use anyhow::Context;
use mimalloc::MiMalloc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use billetter::{
    app,
    cache::CacheService,
    config::Config,
    database::Database,
    redis_client::RedisClient,
    services::notification::{HttpNotifier, LogNotifier, Notifier},
    store::{PgSeatStore, SeatStore},
    AppState,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("invalid configuration")?;

    let filter = tracing_subscriber::EnvFilter::new(&config.app.rust_log);
    if config.app.is_production() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!(environment = %config.app.environment, "starting billetter");

    let db = Database::connect(&config.database)
        .await
        .context("failed to connect to database")?;
    info!("database connected");
    db.run_migrations().await.context("failed to run migrations")?;

    let store: Arc<dyn SeatStore> = Arc::new(PgSeatStore::new(&db));

    // The cache is optional; a failed connection only costs read latency
    let redis = match &config.redis.url {
        Some(url) => match RedisClient::connect(url).await {
            Ok(client) => Some(client),
            Err(e) => {
                warn!("redis unavailable, seat maps served uncached: {e}");
                None
            }
        },
        None => None,
    };
    let cache = CacheService::new(
        redis,
        store.clone(),
        Duration::from_secs(config.redis.seat_map_ttl_seconds),
    );

    let notifier: Arc<dyn Notifier> = match &config.notification.relay_url {
        Some(url) => {
            info!(relay = %url, "confirmations go to the mail relay");
            Arc::new(HttpNotifier::new(url, &config.notification).context("failed to build mail relay client")?)
        }
        None => Arc::new(LogNotifier),
    };

    let addr: SocketAddr = format!("{}:{}", config.app.host, config.app.port)
        .parse()
        .context("invalid listen address")?;

    let state = AppState::new(config, store, cache, notifier);
    state.spawn_background_tasks();

    let router = app(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("server listening on {}", addr);

    axum::serve(listener, router.into_make_service()).await?;
    Ok(())
}
