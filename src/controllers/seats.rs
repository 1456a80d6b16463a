use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::BookingError;
use crate::models::{ScreeningId, SeatId, SeatView};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/screenings/{id}/seats", get(get_seats))
        .route("/screenings/{id}/seats/suggest", get(suggest_seats))
}

#[derive(Debug, Serialize)]
struct SeatMapResponse {
    screening_id: ScreeningId,
    seats: Vec<SeatView>,
}

// GET /api/screenings/{id}/seats
async fn get_seats(
    State(state): State<Arc<AppState>>,
    Path(screening_id): Path<ScreeningId>,
) -> Result<Json<SeatMapResponse>, BookingError> {
    let seats = state.bookings.availability(screening_id).await?;
    Ok(Json(SeatMapResponse { screening_id, seats }))
}

#[derive(Debug, Deserialize)]
struct SuggestQuery {
    count: usize,
    anchor: Option<SeatId>,
}

#[derive(Debug, Serialize)]
struct SuggestResponse {
    seat_ids: Vec<SeatId>,
}

// GET /api/screenings/{id}/seats/suggest?count=N&anchor=SEAT
async fn suggest_seats(
    State(state): State<Arc<AppState>>,
    Path(screening_id): Path<ScreeningId>,
    Query(query): Query<SuggestQuery>,
) -> Result<Json<SuggestResponse>, BookingError> {
    let seat_ids = state
        .bookings
        .suggest_seats(screening_id, query.count, query.anchor)
        .await?;
    Ok(Json(SuggestResponse { seat_ids }))
}
