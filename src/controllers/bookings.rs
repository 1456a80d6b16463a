use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::error;

use crate::error::BookingError;
use crate::middleware::AuthUser;
use crate::models::{Booking, BookingId, ScreeningId, SeatAssignment, SeatId, TicketTypeId};
use crate::services::booking::{AllocationRequest, BookingRequest};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bookings", get(get_user_bookings).post(create_booking))
        .route("/bookings/allocate", post(create_allocated_booking))
        .route("/bookings/cancel", patch(cancel_booking))
}

/* ---------- helpers ---------- */

// Runs the operation on its own task so that a client disconnect, which drops
// the handler future, cannot stop it between commit and publish.
async fn detached<T, F>(operation: F) -> Result<T, BookingError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, BookingError>> + Send + 'static,
{
    tokio::spawn(operation).await.map_err(|e| {
        error!("booking task aborted: {e}");
        BookingError::Internal("booking task aborted".to_string())
    })?
}

/* ---------- BOOKINGS ---------- */

// POST /api/bookings
#[derive(Debug, Deserialize)]
struct CreateBookingRequest {
    screening_id: ScreeningId,
    seats: Vec<SeatAssignment>,
    guest_email: Option<String>,
}

async fn create_booking(
    State(state): State<Arc<AppState>>,
    user: Option<AuthUser>,
    Json(req): Json<CreateBookingRequest>,
) -> Result<impl IntoResponse, BookingError> {
    let request = BookingRequest {
        screening_id: req.screening_id,
        seats: req.seats,
        owner: user.map(|u| u.user_id),
        guest_email: req.guest_email,
    };
    let bookings = state.bookings.clone();
    let confirmation = detached(async move { bookings.create_booking(request).await }).await?;
    Ok((StatusCode::CREATED, Json(confirmation)))
}

// POST /api/bookings/allocate
#[derive(Debug, Deserialize)]
struct AllocateBookingRequest {
    screening_id: ScreeningId,
    ticket_type_ids: Vec<TicketTypeId>,
    anchor_seat_id: Option<SeatId>,
    guest_email: Option<String>,
}

async fn create_allocated_booking(
    State(state): State<Arc<AppState>>,
    user: Option<AuthUser>,
    Json(req): Json<AllocateBookingRequest>,
) -> Result<impl IntoResponse, BookingError> {
    let request = AllocationRequest {
        screening_id: req.screening_id,
        ticket_type_ids: req.ticket_type_ids,
        anchor_seat_id: req.anchor_seat_id,
        owner: user.map(|u| u.user_id),
        guest_email: req.guest_email,
    };
    let bookings = state.bookings.clone();
    let confirmation = detached(async move { bookings.create_allocated_booking(request).await }).await?;
    Ok((StatusCode::CREATED, Json(confirmation)))
}

// PATCH /api/bookings/cancel
#[derive(Debug, Deserialize)]
struct CancelBookingRequest {
    booking_id: BookingId,
}

async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CancelBookingRequest>,
) -> Result<impl IntoResponse, BookingError> {
    let cancellations = state.cancellations.clone();
    let requester = user.requester();
    let cancelled = detached(async move { cancellations.cancel_booking(req.booking_id, requester).await }).await?;
    Ok(Json(cancelled))
}

// GET /api/bookings
#[derive(Debug, Serialize)]
struct BookingResponse {
    id: BookingId,
    code: String,
    screening_id: ScreeningId,
    created_at: DateTime<Utc>,
    seats: Vec<SeatAssignment>,
}

impl From<Booking> for BookingResponse {
    fn from(booking: Booking) -> Self {
        Self {
            id: booking.id,
            code: booking.code,
            screening_id: booking.screening_id,
            created_at: booking.created_at,
            seats: booking.seats,
        }
    }
}

async fn get_user_bookings(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<impl IntoResponse, BookingError> {
    let bookings = state.store.bookings_for_user(user.user_id).await?;
    let resp: Vec<BookingResponse> = bookings.into_iter().map(BookingResponse::from).collect();
    Ok(Json(resp))
}
