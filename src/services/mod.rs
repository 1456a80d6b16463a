pub mod allocator;
pub mod booking;
pub mod broadcast;
pub mod cancellation;
pub mod locks;
pub mod notification;

use tracing::debug;

use crate::cache::CacheService;
use crate::models::{ScreeningId, SeatId, SeatStatus};
use broadcast::{BroadcastHub, SeatEvent};

/// Post-commit effects shared by booking and cancellation. Callers hold the
/// screening lock so that events leave in commit order.
pub(crate) async fn announce_seat_change(
    cache: &CacheService,
    hub: &BroadcastHub,
    screening_id: ScreeningId,
    seat_ids: Vec<SeatId>,
    status: SeatStatus,
) {
    cache.invalidate_seat_map(screening_id).await;
    let delivered = hub.publish(screening_id, SeatEvent { seat_ids, status });
    debug!(screening_id, status = status.as_str(), delivered, "seat change announced");
}
