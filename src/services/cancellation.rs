use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::CacheService;
use crate::error::BookingError;
use crate::models::{BookingId, ScreeningId, SeatId, SeatStatus, UserId};
use crate::services::announce_seat_change;
use crate::services::broadcast::BroadcastHub;
use crate::services::locks::ScreeningLocks;
use crate::store::{SeatStore, SeatTransaction};

/// Who is asking for a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requester {
    pub user_id: UserId,
    pub is_admin: bool,
}

/// Cancellations close `window` before the screening starts. The deadline
/// itself is still accepted.
#[derive(Debug, Clone, Copy)]
pub struct CancellationPolicy {
    pub window: Duration,
}

impl CancellationPolicy {
    pub fn from_minutes(minutes: i64) -> Self {
        Self { window: Duration::minutes(minutes) }
    }

    pub fn deadline(&self, starts_at: DateTime<Utc>) -> DateTime<Utc> {
        starts_at - self.window
    }

    pub fn check(&self, now: DateTime<Utc>, starts_at: DateTime<Utc>) -> Result<(), BookingError> {
        let deadline = self.deadline(starts_at);
        if now > deadline {
            return Err(BookingError::TooLate { deadline });
        }
        Ok(())
    }
}

impl Default for CancellationPolicy {
    fn default() -> Self {
        Self::from_minutes(120)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelledBooking {
    pub booking_id: BookingId,
    pub screening_id: ScreeningId,
    pub seat_ids: Vec<SeatId>,
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct CancellationManager {
    store: Arc<dyn SeatStore>,
    cache: CacheService,
    hub: Arc<BroadcastHub>,
    locks: ScreeningLocks,
    policy: CancellationPolicy,
    clock: Clock,
}

impl CancellationManager {
    pub fn new(
        store: Arc<dyn SeatStore>,
        cache: CacheService,
        hub: Arc<BroadcastHub>,
        locks: ScreeningLocks,
        policy: CancellationPolicy,
    ) -> Self {
        Self { store, cache, hub, locks, policy, clock: Arc::new(Utc::now) }
    }

    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn policy(&self) -> CancellationPolicy {
        self.policy
    }

    /// Deletes the booking and frees its seats, then publishes `available`
    /// for them. Only the owner or an admin may cancel, and only until the
    /// policy deadline.
    pub async fn cancel_booking(
        &self,
        booking_id: BookingId,
        requester: Requester,
    ) -> Result<CancelledBooking, BookingError> {
        // the screening id decides which lock to take; it is re-read under the lock
        let screening_id = self
            .store
            .booking(booking_id)
            .await?
            .map(|b| b.screening_id)
            .ok_or_else(|| BookingError::NotFound(format!("booking {booking_id}")))?;

        let guard = self.locks.acquire(screening_id).await;
        let mut tx = self.store.begin(screening_id).await?;

        let seat_ids = match self.stage(tx.as_mut(), booking_id, requester).await {
            Ok(seat_ids) => {
                tx.commit().await?;
                seat_ids
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(booking_id, error = %rollback_err, "rollback failed");
                }
                return Err(e);
            }
        };

        info!(booking_id, screening_id, seats = seat_ids.len(), "booking cancelled");
        announce_seat_change(
            &self.cache,
            &self.hub,
            screening_id,
            seat_ids.clone(),
            SeatStatus::Available,
        )
        .await;
        drop(guard);

        Ok(CancelledBooking { booking_id, screening_id, seat_ids })
    }

    async fn stage(
        &self,
        tx: &mut dyn SeatTransaction,
        booking_id: BookingId,
        requester: Requester,
    ) -> Result<Vec<SeatId>, BookingError> {
        let booking = tx
            .booking(booking_id)
            .await?
            .ok_or_else(|| BookingError::NotFound(format!("booking {booking_id}")))?;

        let is_owner = booking.holder.owner_id() == Some(requester.user_id);
        if !is_owner && !requester.is_admin {
            return Err(BookingError::Forbidden);
        }

        self.policy.check((self.clock)(), tx.screening().starts_at)?;

        Ok(tx.delete_booking(booking_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BookingHolder, NewBooking, SeatAssignment};
    use crate::store::MemorySeatStore;

    #[test]
    fn window_boundaries() {
        let policy = CancellationPolicy::from_minutes(120);
        let now = Utc::now();

        let late = now + Duration::minutes(119);
        assert!(matches!(policy.check(now, late), Err(BookingError::TooLate { .. })));

        let early = now + Duration::minutes(121);
        assert!(policy.check(now, early).is_ok());

        let exact = now + Duration::minutes(120);
        assert!(policy.check(now, exact).is_ok());
    }

    #[test]
    fn too_late_reports_deadline() {
        let policy = CancellationPolicy::default();
        let now = Utc::now();
        let starts_at = now + Duration::minutes(30);
        match policy.check(now, starts_at) {
            Err(BookingError::TooLate { deadline }) => assert_eq!(deadline, starts_at - Duration::hours(2)),
            other => panic!("expected TooLate, got {other:?}"),
        }
    }

    struct Fixture {
        store: MemorySeatStore,
        manager: CancellationManager,
        booking_id: BookingId,
        owner: UserId,
    }

    async fn fixture(starts_in: Duration) -> Fixture {
        let store = MemorySeatStore::new();
        let auditorium = store.add_auditorium(1, 4);
        let screening = store.add_screening("Ran", auditorium, Utc::now() + starts_in);
        let ticket = store.add_ticket_type("adult", 1000);
        let owner = store.add_user("owner@example.com", "Owner", "x", crate::models::Role::Customer);
        let seat = store.seat_at(auditorium, 1, 2).unwrap();

        let mut tx = store.begin(screening).await.unwrap();
        let booking_id = tx
            .insert_booking(&NewBooking {
                code: "AAA111".to_string(),
                screening_id: screening,
                holder: BookingHolder::Owner { user_id: owner },
                created_at: Utc::now(),
                seats: vec![SeatAssignment { seat_id: seat, ticket_type_id: ticket }],
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let shared: Arc<dyn SeatStore> = Arc::new(store.clone());
        let manager = CancellationManager::new(
            shared.clone(),
            CacheService::disabled(shared),
            BroadcastHub::new(8),
            ScreeningLocks::new(),
            CancellationPolicy::default(),
        );
        Fixture { store, manager, booking_id, owner }
    }

    #[tokio::test]
    async fn owner_cancels_with_time_left() {
        let f = fixture(Duration::minutes(121)).await;
        let cancelled = f
            .manager
            .cancel_booking(f.booking_id, Requester { user_id: f.owner, is_admin: false })
            .await
            .unwrap();
        assert_eq!(cancelled.seat_ids.len(), 1);
        assert_eq!(f.store.booking_count(), 0);
    }

    #[tokio::test]
    async fn too_late_changes_nothing() {
        let f = fixture(Duration::minutes(119)).await;
        let result = f
            .manager
            .cancel_booking(f.booking_id, Requester { user_id: f.owner, is_admin: false })
            .await;
        assert!(matches!(result, Err(BookingError::TooLate { .. })));
        assert_eq!(f.store.booking_count(), 1);
    }

    #[tokio::test]
    async fn strangers_are_forbidden_admins_are_not() {
        let f = fixture(Duration::days(1)).await;
        let stranger = Requester { user_id: f.owner + 1000, is_admin: false };
        assert!(matches!(
            f.manager.cancel_booking(f.booking_id, stranger).await,
            Err(BookingError::Forbidden)
        ));
        assert_eq!(f.store.booking_count(), 1);

        let admin = Requester { user_id: f.owner + 1000, is_admin: true };
        assert!(f.manager.cancel_booking(f.booking_id, admin).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_or_already_cancelled_is_not_found() {
        let f = fixture(Duration::days(1)).await;
        let requester = Requester { user_id: f.owner, is_admin: false };
        f.manager.cancel_booking(f.booking_id, requester).await.unwrap();
        assert!(matches!(
            f.manager.cancel_booking(f.booking_id, requester).await,
            Err(BookingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn injected_clock_drives_the_policy() {
        let f = fixture(Duration::hours(5)).await;
        let manager = f.manager.with_clock(|| Utc::now() + Duration::hours(4));
        let result = manager
            .cancel_booking(f.booking_id, Requester { user_id: f.owner, is_admin: false })
            .await;
        assert!(matches!(result, Err(BookingError::TooLate { .. })));
    }
}
