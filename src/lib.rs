pub mod cache;
pub mod config;
pub mod controllers;
pub mod database;
pub mod error;
pub mod middleware;
pub mod models;
pub mod redis_client;
pub mod services;
pub mod store;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use cache::CacheService;
use services::booking::BookingManager;
use services::broadcast::BroadcastHub;
use services::cancellation::{CancellationManager, CancellationPolicy};
use services::locks::ScreeningLocks;
use services::notification::Notifier;
use store::SeatStore;

// Shared state for every handler
pub struct AppState {
    pub store: Arc<dyn SeatStore>,
    pub cache: CacheService,
    pub hub: Arc<BroadcastHub>,
    pub bookings: Arc<BookingManager>,
    pub cancellations: Arc<CancellationManager>,
    pub config: config::Config,
}

impl AppState {
    /// Wires the managers around one store, cache, hub and lock table.
    pub fn new(
        config: config::Config,
        store: Arc<dyn SeatStore>,
        cache: CacheService,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let hub = BroadcastHub::new(config.broadcast.subscriber_buffer);
        let locks = ScreeningLocks::new();

        let bookings = BookingManager::new(
            store.clone(),
            cache.clone(),
            hub.clone(),
            notifier,
            locks.clone(),
            config.booking.clone(),
        );
        let cancellations = CancellationManager::new(
            store.clone(),
            cache.clone(),
            hub.clone(),
            locks,
            CancellationPolicy::from_minutes(config.booking.cancellation_window_minutes),
        );

        Arc::new(Self {
            store,
            cache,
            hub,
            bookings: Arc::new(bookings),
            cancellations: Arc::new(cancellations),
            config,
        })
    }

    /// Starts the hub keep-alive loop; it stops once the hub is dropped.
    pub fn spawn_background_tasks(&self) {
        let period = Duration::from_secs(self.config.broadcast.keep_alive_seconds.max(1));
        self.hub.spawn_keep_alive(period);
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "subscribers": state.hub.total_subscribers(),
        "cache": state.cache.is_enabled(),
    }))
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(|| async { "Billetter API v1.0" }))
        .route("/health", get(health))
        .nest("/api", controllers::routes())
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
