use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::RedisResult;

use crate::models::ScreeningId;
use crate::{redis_client::RedisClient, store::SeatStore};

pub mod seats;

/// Key-value operations the seat-map cache needs.
///
/// Entries are keyed by screening and generation. Bumping the generation
/// retires every entry written under an older one, including entries written
/// late by a reader that loaded its seat map before the commit.
#[async_trait]
pub trait SeatMapBackend: Send + Sync {
    /// Current generation of the screening, 0 when never bumped.
    async fn generation(&self, screening_id: ScreeningId) -> RedisResult<u64>;

    async fn bump_generation(&self, screening_id: ScreeningId) -> RedisResult<u64>;

    async fn load(&self, screening_id: ScreeningId, generation: u64) -> RedisResult<Option<String>>;

    async fn save(&self, screening_id: ScreeningId, generation: u64, data: String, ttl_seconds: u64) -> RedisResult<()>;
}

/// Read-through cache in front of the seat store.
///
/// Only the public availability query goes through here; booking decisions
/// always read the store inside their transaction. Without redis every call
/// falls through to the store.
#[derive(Clone)]
pub struct CacheService {
    backend: Option<Arc<dyn SeatMapBackend>>,
    store: Arc<dyn SeatStore>,
    seat_map_ttl: Duration,
}

impl CacheService {
    pub fn new(redis: Option<RedisClient>, store: Arc<dyn SeatStore>, seat_map_ttl: Duration) -> Self {
        let backend = redis.map(|client| Arc::new(client) as Arc<dyn SeatMapBackend>);
        Self { backend, store, seat_map_ttl }
    }

    pub fn with_backend(backend: Arc<dyn SeatMapBackend>, store: Arc<dyn SeatStore>, seat_map_ttl: Duration) -> Self {
        Self { backend: Some(backend), store, seat_map_ttl }
    }

    pub fn disabled(store: Arc<dyn SeatStore>) -> Self {
        Self { backend: None, store, seat_map_ttl: Duration::ZERO }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }
}
