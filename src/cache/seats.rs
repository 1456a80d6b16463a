use async_trait::async_trait;
use redis::{AsyncCommands, RedisResult};
use tracing::{debug, warn};

use crate::cache::{CacheService, SeatMapBackend};
use crate::models::{ScreeningId, SeatView};
use crate::redis_client::RedisClient;
use crate::store::StoreResult;

fn generation_key(screening_id: ScreeningId) -> String {
    format!("seat_map_gen:{}", screening_id)
}

fn seat_map_key(screening_id: ScreeningId, generation: u64) -> String {
    format!("seat_map:{}:{}", screening_id, generation)
}

#[async_trait]
impl SeatMapBackend for RedisClient {
    async fn generation(&self, screening_id: ScreeningId) -> RedisResult<u64> {
        let mut conn = self.conn.clone();
        let generation: Option<u64> = conn.get(generation_key(screening_id)).await?;
        Ok(generation.unwrap_or(0))
    }

    async fn bump_generation(&self, screening_id: ScreeningId) -> RedisResult<u64> {
        let mut conn = self.conn.clone();
        conn.incr(generation_key(screening_id), 1u64).await
    }

    async fn load(&self, screening_id: ScreeningId, generation: u64) -> RedisResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(seat_map_key(screening_id, generation)).await
    }

    async fn save(&self, screening_id: ScreeningId, generation: u64, data: String, ttl_seconds: u64) -> RedisResult<()> {
        let mut conn = self.conn.clone();
        conn.set_ex(seat_map_key(screening_id, generation), data, ttl_seconds).await
    }
}

impl CacheService {
    /// Seat map of a screening, from redis when fresh, otherwise from the store.
    /// Redis failures degrade to a store read.
    ///
    /// A store read is cached under the generation observed before it, so a
    /// commit that lands in between leaves the entry unreachable.
    pub async fn seat_map(&self, screening_id: ScreeningId) -> StoreResult<Vec<SeatView>> {
        let Some(backend) = &self.backend else {
            return self.store.seat_map(screening_id).await;
        };
        let generation = match backend.generation(screening_id).await {
            Ok(generation) => generation,
            Err(e) => {
                warn!(screening_id, error = %e, "seat map generation read failed");
                return self.store.seat_map(screening_id).await;
            }
        };

        match cached_seat_map(backend.as_ref(), screening_id, generation).await {
            Ok(Some(seats)) => {
                debug!(screening_id, generation, "seat map cache hit");
                return Ok(seats);
            }
            Ok(None) => {}
            Err(e) => warn!(screening_id, error = %e, "seat map cache read failed"),
        }

        let seats = self.store.seat_map(screening_id).await?;
        let ttl = self.seat_map_ttl.as_secs();
        if !seats.is_empty() && ttl > 0 {
            if let Err(e) = save_seat_map(backend.as_ref(), screening_id, generation, &seats, ttl).await {
                warn!(screening_id, error = %e, "seat map cache write failed");
            }
        }
        Ok(seats)
    }

    /// Retires every cached seat map of the screening. Called after every
    /// committed change, before the change is published.
    pub async fn invalidate_seat_map(&self, screening_id: ScreeningId) {
        let Some(backend) = &self.backend else {
            return;
        };
        match backend.bump_generation(screening_id).await {
            Ok(generation) => debug!(screening_id, generation, "seat map cache invalidated"),
            // the entry still expires after its ttl
            Err(e) => warn!(screening_id, error = %e, "seat map invalidation failed"),
        }
    }
}

async fn cached_seat_map(
    backend: &dyn SeatMapBackend,
    screening_id: ScreeningId,
    generation: u64,
) -> RedisResult<Option<Vec<SeatView>>> {
    let Some(data) = backend.load(screening_id, generation).await? else {
        return Ok(None);
    };
    let seats = serde_json::from_str(&data).map_err(|_| {
        redis::RedisError::from((redis::ErrorKind::TypeError, "Parse error"))
    })?;
    Ok(Some(seats))
}

async fn save_seat_map(
    backend: &dyn SeatMapBackend,
    screening_id: ScreeningId,
    generation: u64,
    seats: &[SeatView],
    ttl: u64,
) -> RedisResult<()> {
    let data = serde_json::to_string(seats).map_err(|_| {
        redis::RedisError::from((redis::ErrorKind::TypeError, "Serialize error"))
    })?;
    backend.save(screening_id, generation, data, ttl).await
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration as StdDuration;

    use chrono::{Duration, Utc};
    use tokio::sync::Notify;

    use super::*;
    use crate::models::{
        Booking, BookingHolder, BookingId, NewBooking, Role, Screening, SeatAssignment, SeatStatus,
        TicketType, TicketTypeId, User, UserId,
    };
    use crate::store::{MemorySeatStore, SeatStore, SeatTransaction};

    #[derive(Default)]
    struct MemoryBackend {
        generations: Mutex<HashMap<ScreeningId, u64>>,
        entries: Mutex<HashMap<(ScreeningId, u64), String>>,
    }

    #[async_trait]
    impl SeatMapBackend for MemoryBackend {
        async fn generation(&self, screening_id: ScreeningId) -> RedisResult<u64> {
            Ok(self.generations.lock().unwrap().get(&screening_id).copied().unwrap_or(0))
        }

        async fn bump_generation(&self, screening_id: ScreeningId) -> RedisResult<u64> {
            let mut generations = self.generations.lock().unwrap();
            let generation = generations.entry(screening_id).or_insert(0);
            *generation += 1;
            Ok(*generation)
        }

        async fn load(&self, screening_id: ScreeningId, generation: u64) -> RedisResult<Option<String>> {
            Ok(self.entries.lock().unwrap().get(&(screening_id, generation)).cloned())
        }

        async fn save(&self, screening_id: ScreeningId, generation: u64, data: String, _ttl: u64) -> RedisResult<()> {
            self.entries.lock().unwrap().insert((screening_id, generation), data);
            Ok(())
        }
    }

    /// Counts seat map reads and, when armed, holds one read after it has
    /// loaded its snapshot until released.
    struct PausingStore {
        inner: MemorySeatStore,
        reads: AtomicUsize,
        armed: AtomicBool,
        loaded: Notify,
        release: Notify,
    }

    impl PausingStore {
        fn new(inner: MemorySeatStore) -> Self {
            Self {
                inner,
                reads: AtomicUsize::new(0),
                armed: AtomicBool::new(false),
                loaded: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl SeatStore for PausingStore {
        async fn screening(&self, id: ScreeningId) -> StoreResult<Option<Screening>> {
            self.inner.screening(id).await
        }

        async fn seat_map(&self, screening_id: ScreeningId) -> StoreResult<Vec<SeatView>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let seats = self.inner.seat_map(screening_id).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.loaded.notify_one();
                self.release.notified().await;
            }
            Ok(seats)
        }

        async fn ticket_types(&self, ids: &[TicketTypeId]) -> StoreResult<Vec<TicketType>> {
            self.inner.ticket_types(ids).await
        }

        async fn user(&self, id: UserId) -> StoreResult<Option<User>> {
            self.inner.user(id).await
        }

        async fn user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
            self.inner.user_by_email(email).await
        }

        async fn booking(&self, id: BookingId) -> StoreResult<Option<Booking>> {
            self.inner.booking(id).await
        }

        async fn bookings_for_user(&self, user_id: UserId) -> StoreResult<Vec<Booking>> {
            self.inner.bookings_for_user(user_id).await
        }

        async fn begin(&self, screening_id: ScreeningId) -> StoreResult<Box<dyn SeatTransaction>> {
            self.inner.begin(screening_id).await
        }
    }

    struct Fixture {
        memory: MemorySeatStore,
        store: Arc<PausingStore>,
        cache: CacheService,
        screening: ScreeningId,
        seat: crate::models::SeatId,
        ticket: TicketTypeId,
        owner: UserId,
    }

    fn fixture() -> Fixture {
        let memory = MemorySeatStore::new();
        let auditorium = memory.add_auditorium(1, 4);
        let screening = memory.add_screening("Heat", auditorium, Utc::now() + Duration::days(1));
        let ticket = memory.add_ticket_type("adult", 1000);
        let owner = memory.add_user("owner@example.com", "Owner", "x", Role::Customer);
        let seat = memory.seat_at(auditorium, 1, 2).unwrap();

        let store = Arc::new(PausingStore::new(memory.clone()));
        let cache = CacheService::with_backend(
            Arc::new(MemoryBackend::default()),
            store.clone(),
            StdDuration::from_secs(30),
        );
        Fixture { memory, store, cache, screening, seat, ticket, owner }
    }

    impl Fixture {
        async fn book_and_invalidate(&self) {
            let mut tx = self.memory.begin(self.screening).await.unwrap();
            tx.insert_booking(&NewBooking {
                code: "AAA111".to_string(),
                screening_id: self.screening,
                holder: BookingHolder::Owner { user_id: self.owner },
                created_at: Utc::now(),
                seats: vec![SeatAssignment { seat_id: self.seat, ticket_type_id: self.ticket }],
            })
            .await
            .unwrap();
            tx.commit().await.unwrap();
            self.cache.invalidate_seat_map(self.screening).await;
        }

        async fn status_of_seat(&self) -> SeatStatus {
            let seats = self.cache.seat_map(self.screening).await.unwrap();
            seats.iter().find(|s| s.seat_id == self.seat).unwrap().status
        }
    }

    #[tokio::test]
    async fn disabled_cache_reads_through_to_store() {
        let store = MemorySeatStore::new();
        let auditorium = store.add_auditorium(2, 3);
        let screening = store.add_screening("Heat", auditorium, Utc::now() + Duration::days(1));

        let cache = CacheService::disabled(Arc::new(store));
        assert!(!cache.is_enabled());
        let seats = cache.seat_map(screening).await.unwrap();
        assert_eq!(seats.len(), 6);
        assert!(seats.iter().all(|s| s.is_available()));

        cache.invalidate_seat_map(screening).await;
        assert!(cache.seat_map(9999).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_reads_are_served_from_the_cache_until_invalidated() {
        let f = fixture();
        assert_eq!(f.status_of_seat().await, SeatStatus::Available);
        assert_eq!(f.status_of_seat().await, SeatStatus::Available);
        assert_eq!(f.store.reads.load(Ordering::SeqCst), 1);

        f.book_and_invalidate().await;
        assert_eq!(f.status_of_seat().await, SeatStatus::Booked);
        assert_eq!(f.store.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn read_racing_a_commit_cannot_cache_the_old_map() {
        let f = fixture();
        f.store.armed.store(true, Ordering::SeqCst);

        let cache = f.cache.clone();
        let screening = f.screening;
        let reader = tokio::spawn(async move { cache.seat_map(screening).await });

        // the reader holds a pre-commit snapshot while the booking commits
        f.store.loaded.notified().await;
        f.book_and_invalidate().await;
        f.store.release.notify_one();

        let stale = reader.await.unwrap().unwrap();
        assert!(stale.iter().all(|s| s.is_available()));

        assert_eq!(f.status_of_seat().await, SeatStatus::Booked);
    }
}
