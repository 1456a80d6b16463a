pub mod user;
pub mod screening;
pub mod seat;
pub mod booking;
pub mod ticket_type;

pub use user::{Role, User};
pub use screening::Screening;
pub use seat::{Seat, SeatStatus, SeatView};
pub use booking::{Booking, BookingHolder, NewBooking, SeatAssignment};
pub use ticket_type::TicketType;

pub type UserId = i64;
pub type AuditoriumId = i64;
pub type ScreeningId = i64;
pub type SeatId = i64;
pub type BookingId = i64;
pub type TicketTypeId = i64;
