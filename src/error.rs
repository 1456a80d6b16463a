use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::models::SeatId;
use crate::store::StoreError;

/// Outcome taxonomy of the booking and cancellation paths.
///
/// Every variant raised inside a transaction is returned only after the
/// transaction has been rolled back.
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("{0}")]
    Validation(String),

    #[error("seats no longer available: {seat_ids:?}")]
    Conflict { seat_ids: Vec<SeatId> },

    #[error("no block of {requested} adjacent seats is free")]
    NoContiguousBlock { requested: usize },

    #[error("not allowed to cancel this booking")]
    Forbidden,

    #[error("cancellation closed at {deadline}")]
    TooLate { deadline: DateTime<Utc> },

    #[error("{0} not found")]
    NotFound(String),

    #[error("temporary storage conflict: {0}")]
    TransientStoreFailure(String),

    #[error(transparent)]
    Store(StoreError),

    /// A fault outside the store, such as a panicked booking task. The
    /// operation may or may not have committed.
    #[error("internal failure: {0}")]
    Internal(String),
}

impl From<StoreError> for BookingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ScreeningNotFound(id) => BookingError::NotFound(format!("screening {id}")),
            // the constraint fired, so some requested seat was taken concurrently
            StoreError::SeatTaken { .. } => BookingError::Conflict { seat_ids: Vec::new() },
            other => BookingError::Store(other),
        }
    }
}

impl BookingError {
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::Validation(_) => "validation_error",
            BookingError::Conflict { .. } => "seat_conflict",
            BookingError::NoContiguousBlock { .. } => "no_contiguous_block",
            BookingError::Forbidden => "forbidden",
            BookingError::TooLate { .. } => "cancellation_too_late",
            BookingError::NotFound(_) => "not_found",
            BookingError::TransientStoreFailure(_) => "transient_failure",
            BookingError::Store(_) | BookingError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            BookingError::Validation(_) => StatusCode::BAD_REQUEST,
            BookingError::Conflict { .. } | BookingError::NoContiguousBlock { .. } => StatusCode::CONFLICT,
            BookingError::Forbidden => StatusCode::FORBIDDEN,
            BookingError::TooLate { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            BookingError::NotFound(_) => StatusCode::NOT_FOUND,
            BookingError::TransientStoreFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            BookingError::Store(_) | BookingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BookingError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            BookingError::Store(err) => {
                tracing::error!("store failure: {err}");
                "Internal server error".to_string()
            }
            BookingError::Internal(detail) => {
                tracing::error!("internal failure: {detail}");
                "Internal server error".to_string()
            }
            BookingError::TransientStoreFailure(detail) => {
                tracing::warn!("transient store failure: {detail}");
                "The booking could not be stored, please try again".to_string()
            }
            other => other.to_string(),
        };

        let mut body = json!({ "error": self.code(), "message": message });
        match &self {
            BookingError::Conflict { seat_ids } if !seat_ids.is_empty() => {
                body["seat_ids"] = json!(seat_ids);
            }
            BookingError::TooLate { deadline } => {
                body["deadline"] = json!(deadline);
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}
