use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BookingId, ScreeningId, SeatId, TicketTypeId, UserId};

/// Who a booking belongs to: a registered user or a guest identified only by email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BookingHolder {
    Owner { user_id: UserId },
    Guest { email: String },
}

impl BookingHolder {
    /// Builds a holder from the two optional request fields; exactly one must be set.
    pub fn from_parts(owner: Option<UserId>, guest_email: Option<String>) -> Option<Self> {
        match (owner, guest_email) {
            (Some(user_id), None) => Some(BookingHolder::Owner { user_id }),
            (None, Some(email)) => Some(BookingHolder::Guest { email }),
            _ => None,
        }
    }

    pub fn owner_id(&self) -> Option<UserId> {
        match self {
            BookingHolder::Owner { user_id } => Some(*user_id),
            BookingHolder::Guest { .. } => None,
        }
    }

    pub fn guest_email(&self) -> Option<&str> {
        match self {
            BookingHolder::Owner { .. } => None,
            BookingHolder::Guest { email } => Some(email),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatAssignment {
    pub seat_id: SeatId,
    pub ticket_type_id: TicketTypeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub code: String,
    pub screening_id: ScreeningId,
    pub holder: BookingHolder,
    pub created_at: DateTime<Utc>,
    pub seats: Vec<SeatAssignment>,
}

impl Booking {
    pub fn seat_ids(&self) -> Vec<SeatId> {
        self.seats.iter().map(|s| s.seat_id).collect()
    }
}

/// Booking row as handed to the store inside a transaction, before it has an id.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub code: String,
    pub screening_id: ScreeningId,
    pub holder: BookingHolder,
    pub created_at: DateTime<Utc>,
    pub seats: Vec<SeatAssignment>,
}
