//! Seat State Store.
//!
//! The store is the single source of truth for bookings. Seat status is never
//! persisted; both implementations derive it by joining the auditorium's seats
//! with the seat assignments of the screening's bookings.
//!
//! Every state change goes through a [`SeatTransaction`] obtained from
//! [`SeatStore::begin`], which serializes all transactions touching the same
//! screening until commit or rollback.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::models::{
    Booking, BookingId, NewBooking, Screening, ScreeningId, SeatId, SeatView, TicketType,
    TicketTypeId, User, UserId,
};

pub use memory::MemorySeatStore;
pub use postgres::PgSeatStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another booking already owns this code. Retryable with a fresh code.
    #[error("booking code {0} is already taken")]
    CodeCollision(String),

    #[error("a requested seat is already assigned for screening {screening_id}")]
    SeatTaken { screening_id: ScreeningId },

    #[error("screening {0} not found")]
    ScreeningNotFound(ScreeningId),

    #[error("inconsistent stored data: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read access plus the entry point for serialized write transactions.
#[async_trait]
pub trait SeatStore: Send + Sync {
    async fn screening(&self, id: ScreeningId) -> StoreResult<Option<Screening>>;

    /// All seats of the screening's auditorium with their derived status,
    /// ordered by row then seat number. Empty when the screening is unknown.
    async fn seat_map(&self, screening_id: ScreeningId) -> StoreResult<Vec<SeatView>>;

    async fn ticket_types(&self, ids: &[TicketTypeId]) -> StoreResult<Vec<TicketType>>;

    async fn user(&self, id: UserId) -> StoreResult<Option<User>>;

    async fn user_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    async fn booking(&self, id: BookingId) -> StoreResult<Option<Booking>>;

    async fn bookings_for_user(&self, user_id: UserId) -> StoreResult<Vec<Booking>>;

    /// Opens a transaction holding the screening's exclusive lock.
    ///
    /// Fails with [`StoreError::ScreeningNotFound`] when the screening does not exist.
    async fn begin(&self, screening_id: ScreeningId) -> StoreResult<Box<dyn SeatTransaction>>;
}

/// A unit of work scoped to one screening. Dropping it without committing
/// discards every staged change.
#[async_trait]
pub trait SeatTransaction: Send {
    fn screening(&self) -> &Screening;

    /// Authoritative seat map as seen from inside the transaction.
    async fn seat_map(&mut self) -> StoreResult<Vec<SeatView>>;

    /// Inserts the booking and all of its seat assignments.
    async fn insert_booking(&mut self, booking: &NewBooking) -> StoreResult<BookingId>;

    async fn booking(&mut self, id: BookingId) -> StoreResult<Option<Booking>>;

    /// Deletes the booking and its seat assignments, returning the freed seat ids.
    async fn delete_booking(&mut self, id: BookingId) -> StoreResult<Vec<SeatId>>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
