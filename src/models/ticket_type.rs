use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::TicketTypeId;

/// Priced ticket category (adult, child, senior...). Prices are looked up, never computed here.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct TicketType {
    pub id: TicketTypeId,
    pub name: String,
    pub price_cents: i64,
}
