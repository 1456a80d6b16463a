pub mod bookings;
pub mod seats;
pub mod stream;

use axum::Router;
use std::sync::Arc;

pub fn routes() -> Router<Arc<crate::AppState>> {
    Router::new()
        .merge(seats::routes())
        .merge(stream::routes())
        .merge(bookings::routes())
}
