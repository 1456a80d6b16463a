use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{AuditoriumId, ScreeningId};

/// A showing of a movie in one auditorium at a fixed start time.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Screening {
    pub id: ScreeningId,
    pub movie_title: String,
    pub auditorium_id: AuditoriumId,
    pub starts_at: DateTime<Utc>,
}
