use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    AuditoriumId, Booking, BookingId, NewBooking, Role, Screening, ScreeningId, Seat, SeatId,
    SeatStatus, SeatView, TicketType, TicketTypeId, User, UserId,
};
use crate::services::locks::{ScreeningGuard, ScreeningLocks};

use super::{SeatStore, SeatTransaction, StoreError, StoreResult};

#[derive(Default)]
struct MemoryData {
    next_id: i64,
    seats: BTreeMap<SeatId, Seat>,
    screenings: BTreeMap<ScreeningId, Screening>,
    ticket_types: BTreeMap<TicketTypeId, TicketType>,
    users: BTreeMap<UserId, User>,
    bookings: BTreeMap<BookingId, Booking>,
}

impl MemoryData {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn booked_seats(&self, screening_id: ScreeningId) -> BTreeSet<SeatId> {
        self.bookings
            .values()
            .filter(|b| b.screening_id == screening_id)
            .flat_map(|b| b.seats.iter().map(|s| s.seat_id))
            .collect()
    }

    fn code_taken(&self, code: &str) -> bool {
        self.bookings.values().any(|b| b.code == code)
    }

    fn seat_map(&self, screening: &Screening, booked: &BTreeSet<SeatId>) -> Vec<SeatView> {
        let mut map: Vec<SeatView> = self
            .seats
            .values()
            .filter(|seat| seat.auditorium_id == screening.auditorium_id)
            .map(|seat| SeatView {
                seat_id: seat.id,
                row_num: seat.row_num,
                seat_num: seat.seat_num,
                status: if booked.contains(&seat.id) {
                    SeatStatus::Booked
                } else {
                    SeatStatus::Available
                },
            })
            .collect();
        map.sort_by_key(|s| (s.row_num, s.seat_num, s.seat_id));
        map
    }
}

/// In-process store with the same transactional contract as [`super::PgSeatStore`].
///
/// Transactions hold the screening's lock from `begin` until commit or
/// rollback and stage their writes; nothing becomes visible before commit.
#[derive(Clone, Default)]
pub struct MemorySeatStore {
    data: Arc<RwLock<MemoryData>>,
    locks: ScreeningLocks,
}

impl MemorySeatStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_seat(&self, auditorium_id: AuditoriumId, row_num: i32, seat_num: i32) -> SeatId {
        let mut data = self.write();
        let id = data.next_id();
        data.seats.insert(id, Seat { id, auditorium_id, row_num, seat_num });
        id
    }

    /// Creates a rectangular auditorium; rows and seats are numbered from 1.
    pub fn add_auditorium(&self, rows: i32, seats_per_row: i32) -> AuditoriumId {
        let auditorium_id = self.write().next_id();
        for row in 1..=rows {
            for seat in 1..=seats_per_row {
                self.add_seat(auditorium_id, row, seat);
            }
        }
        auditorium_id
    }

    pub fn add_screening(
        &self,
        movie_title: &str,
        auditorium_id: AuditoriumId,
        starts_at: DateTime<Utc>,
    ) -> ScreeningId {
        let mut data = self.write();
        let id = data.next_id();
        data.screenings.insert(
            id,
            Screening { id, movie_title: movie_title.to_string(), auditorium_id, starts_at },
        );
        id
    }

    pub fn add_ticket_type(&self, name: &str, price_cents: i64) -> TicketTypeId {
        let mut data = self.write();
        let id = data.next_id();
        data.ticket_types.insert(id, TicketType { id, name: name.to_string(), price_cents });
        id
    }

    pub fn add_user(&self, email: &str, full_name: &str, password_hash: &str, role: Role) -> UserId {
        let mut data = self.write();
        let id = data.next_id();
        data.users.insert(
            id,
            User {
                id,
                email: email.to_string(),
                full_name: full_name.to_string(),
                password_hash: password_hash.to_string(),
                role,
            },
        );
        id
    }

    /// Seat id at the given position of an auditorium.
    pub fn seat_at(&self, auditorium_id: AuditoriumId, row_num: i32, seat_num: i32) -> Option<SeatId> {
        self.read()
            .seats
            .values()
            .find(|s| s.auditorium_id == auditorium_id && s.row_num == row_num && s.seat_num == seat_num)
            .map(|s| s.id)
    }

    pub fn booking_count(&self) -> usize {
        self.read().bookings.len()
    }
}

#[async_trait]
impl SeatStore for MemorySeatStore {
    async fn screening(&self, id: ScreeningId) -> StoreResult<Option<Screening>> {
        Ok(self.read().screenings.get(&id).cloned())
    }

    async fn seat_map(&self, screening_id: ScreeningId) -> StoreResult<Vec<SeatView>> {
        let data = self.read();
        let Some(screening) = data.screenings.get(&screening_id) else {
            return Ok(Vec::new());
        };
        let booked = data.booked_seats(screening_id);
        Ok(data.seat_map(screening, &booked))
    }

    async fn ticket_types(&self, ids: &[TicketTypeId]) -> StoreResult<Vec<TicketType>> {
        let data = self.read();
        let wanted: BTreeSet<TicketTypeId> = ids.iter().copied().collect();
        Ok(wanted.iter().filter_map(|id| data.ticket_types.get(id).cloned()).collect())
    }

    async fn user(&self, id: UserId) -> StoreResult<Option<User>> {
        Ok(self.read().users.get(&id).cloned())
    }

    async fn user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        Ok(self.read().users.values().find(|u| u.email == email).cloned())
    }

    async fn booking(&self, id: BookingId) -> StoreResult<Option<Booking>> {
        Ok(self.read().bookings.get(&id).cloned())
    }

    async fn bookings_for_user(&self, user_id: UserId) -> StoreResult<Vec<Booking>> {
        let mut bookings: Vec<Booking> = self
            .read()
            .bookings
            .values()
            .filter(|b| b.holder.owner_id() == Some(user_id))
            .cloned()
            .collect();
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(bookings)
    }

    async fn begin(&self, screening_id: ScreeningId) -> StoreResult<Box<dyn SeatTransaction>> {
        let guard = self.locks.acquire(screening_id).await;
        let screening = self
            .read()
            .screenings
            .get(&screening_id)
            .cloned()
            .ok_or(StoreError::ScreeningNotFound(screening_id))?;

        Ok(Box::new(MemorySeatTransaction {
            data: self.data.clone(),
            screening,
            inserted: Vec::new(),
            deleted: BTreeSet::new(),
            _guard: guard,
        }))
    }
}

struct MemorySeatTransaction {
    data: Arc<RwLock<MemoryData>>,
    screening: Screening,
    inserted: Vec<Booking>,
    deleted: BTreeSet<BookingId>,
    _guard: ScreeningGuard,
}

impl MemorySeatTransaction {
    fn read(&self) -> RwLockReadGuard<'_, MemoryData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Booked seats as seen by this transaction: committed state plus staged changes.
    fn booked_seats(&self, data: &MemoryData) -> BTreeSet<SeatId> {
        let mut booked: BTreeSet<SeatId> = data
            .bookings
            .values()
            .filter(|b| b.screening_id == self.screening.id && !self.deleted.contains(&b.id))
            .flat_map(|b| b.seats.iter().map(|s| s.seat_id))
            .collect();
        booked.extend(self.inserted.iter().flat_map(|b| b.seats.iter().map(|s| s.seat_id)));
        booked
    }

    fn visible_booking(&self, data: &MemoryData, id: BookingId) -> Option<Booking> {
        if self.deleted.contains(&id) {
            return None;
        }
        self.inserted
            .iter()
            .find(|b| b.id == id)
            .or_else(|| data.bookings.get(&id))
            .cloned()
    }
}

#[async_trait]
impl SeatTransaction for MemorySeatTransaction {
    fn screening(&self) -> &Screening {
        &self.screening
    }

    async fn seat_map(&mut self) -> StoreResult<Vec<SeatView>> {
        let data = self.read();
        let booked = self.booked_seats(&data);
        Ok(data.seat_map(&self.screening, &booked))
    }

    async fn insert_booking(&mut self, booking: &NewBooking) -> StoreResult<BookingId> {
        let id = {
            let data = self.read();
            if data.code_taken(&booking.code) || self.inserted.iter().any(|b| b.code == booking.code) {
                return Err(StoreError::CodeCollision(booking.code.clone()));
            }
            let booked = self.booked_seats(&data);
            if booking.seats.iter().any(|s| booked.contains(&s.seat_id)) {
                return Err(StoreError::SeatTaken { screening_id: booking.screening_id });
            }
            drop(data);
            self.data.write().unwrap_or_else(PoisonError::into_inner).next_id()
        };

        self.inserted.push(Booking {
            id,
            code: booking.code.clone(),
            screening_id: booking.screening_id,
            holder: booking.holder.clone(),
            created_at: booking.created_at,
            seats: booking.seats.clone(),
        });
        Ok(id)
    }

    async fn booking(&mut self, id: BookingId) -> StoreResult<Option<Booking>> {
        let data = self.read();
        Ok(self.visible_booking(&data, id))
    }

    async fn delete_booking(&mut self, id: BookingId) -> StoreResult<Vec<SeatId>> {
        let booking = {
            let data = self.read();
            self.visible_booking(&data, id)
        };
        let Some(booking) = booking else {
            return Ok(Vec::new());
        };

        self.inserted.retain(|b| b.id != id);
        self.deleted.insert(id);

        let mut freed = booking.seat_ids();
        freed.sort_unstable();
        Ok(freed)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);

        // Codes are unique across screenings, which this transaction's lock does not cover.
        if let Some(dup) = self.inserted.iter().find(|b| data.code_taken(&b.code)) {
            return Err(StoreError::CodeCollision(dup.code.clone()));
        }

        for id in &self.deleted {
            data.bookings.remove(id);
        }
        for booking in &self.inserted {
            data.bookings.insert(booking.id, booking.clone());
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
