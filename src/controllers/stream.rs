use axum::{
    extract::{Path, State},
    response::sse::{Event, Sse},
    routing::get,
    Router,
};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::BookingError;
use crate::models::ScreeningId;
use crate::services::broadcast::HubMessage;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/screenings/{id}/seats/stream", get(seat_stream))
}

fn to_sse(message: HubMessage) -> Event {
    match message {
        HubMessage::Seats(event) => match serde_json::to_string(&event) {
            Ok(data) => Event::default().event("seats").data(data),
            Err(e) => {
                warn!("seat event encoding failed: {e}");
                Event::default().comment("dropped")
            }
        },
        HubMessage::KeepAlive => Event::default().comment("keep-alive"),
    }
}

// GET /api/screenings/{id}/seats/stream
//
// Live seat changes, no replay. Clients fetch the seat map after connecting.
// The stream ends when the hub drops a lagging subscriber; the client then
// reconnects and refetches.
async fn seat_stream(
    State(state): State<Arc<AppState>>,
    Path(screening_id): Path<ScreeningId>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, BookingError> {
    if state.store.screening(screening_id).await?.is_none() {
        return Err(BookingError::NotFound(format!("screening {screening_id}")));
    }

    let subscription = state.hub.subscribe(screening_id);
    info!(screening_id, subscriber_id = subscription.id(), "seat stream opened");

    Ok(Sse::new(subscription.map(|message| Ok(to_sse(message)))))
}
