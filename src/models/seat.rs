use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{AuditoriumId, SeatId};

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Seat {
    pub id: SeatId,
    pub auditorium_id: AuditoriumId,
    pub row_num: i32,
    pub seat_num: i32,
}

/// Status of a seat for one screening. Never stored: derived from the seat
/// assignments of the screening's active bookings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeatStatus {
    Available,
    Booked,
}

impl SeatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeatStatus::Available => "available",
            SeatStatus::Booked => "booked",
        }
    }
}

/// One entry of a screening's seat map: a seat of the auditorium joined with
/// its derived status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatView {
    pub seat_id: SeatId,
    pub row_num: i32,
    pub seat_num: i32,
    pub status: SeatStatus,
}

impl SeatView {
    pub fn is_available(&self) -> bool {
        self.status == SeatStatus::Available
    }
}
