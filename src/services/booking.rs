//! Booking Transaction Manager.
//!
//! Validates a request, then commits it in a transaction serialized per
//! screening. After commit the cached seat map is dropped, the `booked` event
//! is published while the screening lock is still held, and the confirmation
//! is sent. Nothing after commit can fail the booking.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};
use validator::ValidateEmail;

use crate::cache::CacheService;
use crate::config::BookingConfig;
use crate::error::BookingError;
use crate::models::{
    BookingHolder, BookingId, NewBooking, Screening, ScreeningId, SeatAssignment, SeatId,
    SeatStatus, SeatView, TicketType, TicketTypeId, UserId,
};
use crate::services::allocator;
use crate::services::announce_seat_change;
use crate::services::broadcast::BroadcastHub;
use crate::services::locks::ScreeningLocks;
use crate::services::notification::{Confirmation, ConfirmationSeat, Notifier};
use crate::store::{SeatStore, SeatTransaction, StoreError};

/// Booking of explicitly chosen seats.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub screening_id: ScreeningId,
    pub seats: Vec<SeatAssignment>,
    pub owner: Option<UserId>,
    pub guest_email: Option<String>,
}

/// Booking of one adjacent block, one seat per ticket type, optionally
/// around an anchor seat.
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub screening_id: ScreeningId,
    pub ticket_type_ids: Vec<TicketTypeId>,
    pub anchor_seat_id: Option<SeatId>,
    pub owner: Option<UserId>,
    pub guest_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingConfirmation {
    pub booking_id: BookingId,
    pub booking_code: String,
    pub screening_id: ScreeningId,
    pub seat_ids: Vec<SeatId>,
    /// Post-commit problems the caller should know about, such as an
    /// undelivered confirmation. The booking stands regardless.
    pub warnings: Vec<String>,
}

/// Three uppercase letters followed by three digits, e.g. `QHX042`.
pub fn generate_booking_code() -> String {
    let mut rng = rand::thread_rng();
    let mut code = String::with_capacity(6);
    for _ in 0..3 {
        code.push(rng.gen_range(b'A'..=b'Z') as char);
    }
    for _ in 0..3 {
        code.push(rng.gen_range(b'0'..=b'9') as char);
    }
    code
}

type CodeSource = Arc<dyn Fn() -> String + Send + Sync>;

enum SeatPlan {
    Explicit(Vec<SeatAssignment>),
    Allocate {
        ticket_type_ids: Vec<TicketTypeId>,
        anchor: Option<SeatId>,
    },
}

struct Prepared {
    screening_id: ScreeningId,
    holder: BookingHolder,
    plan: SeatPlan,
    ticket_types: BTreeMap<TicketTypeId, TicketType>,
}

struct Committed {
    booking_id: BookingId,
    code: String,
    screening: Screening,
    seats: Vec<SeatAssignment>,
    seat_map: Vec<SeatView>,
}

impl Committed {
    fn seat_ids(&self) -> Vec<SeatId> {
        self.seats.iter().map(|s| s.seat_id).collect()
    }
}

pub struct BookingManager {
    store: Arc<dyn SeatStore>,
    cache: CacheService,
    hub: Arc<BroadcastHub>,
    notifier: Arc<dyn Notifier>,
    locks: ScreeningLocks,
    config: BookingConfig,
    codes: CodeSource,
}

impl BookingManager {
    pub fn new(
        store: Arc<dyn SeatStore>,
        cache: CacheService,
        hub: Arc<BroadcastHub>,
        notifier: Arc<dyn Notifier>,
        locks: ScreeningLocks,
        config: BookingConfig,
    ) -> Self {
        Self {
            store,
            cache,
            hub,
            notifier,
            locks,
            config,
            codes: Arc::new(generate_booking_code),
        }
    }

    /// Replaces the booking code generator.
    pub fn with_code_source<F>(mut self, source: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.codes = Arc::new(source);
        self
    }

    /// Seat map of a screening for display; may be served from the cache.
    pub async fn availability(&self, screening_id: ScreeningId) -> Result<Vec<SeatView>, BookingError> {
        self.ensure_screening(screening_id).await?;
        Ok(self.cache.seat_map(screening_id).await?)
    }

    /// Proposes a block of `count` adjacent free seats without reserving it.
    /// An empty result means no such block exists right now.
    pub async fn suggest_seats(
        &self,
        screening_id: ScreeningId,
        count: usize,
        anchor: Option<SeatId>,
    ) -> Result<Vec<SeatId>, BookingError> {
        if count == 0 {
            return Err(BookingError::Validation("count must be at least 1".to_string()));
        }
        let seat_map = self.availability(screening_id).await?;
        if let Some(anchor) = anchor {
            if !seat_map.iter().any(|s| s.seat_id == anchor) {
                return Err(BookingError::Validation(format!(
                    "seat {anchor} is not part of screening {screening_id}"
                )));
            }
        }
        if count > seat_map.len() {
            return Ok(Vec::new());
        }
        Ok(allocator::allocate(&seat_map, count, anchor))
    }

    pub async fn create_booking(&self, request: BookingRequest) -> Result<BookingConfirmation, BookingError> {
        let holder = validate_holder(request.owner, request.guest_email)?;
        if request.seats.is_empty() {
            return Err(BookingError::Validation("at least one seat is required".to_string()));
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = request.seats.iter().find(|s| !seen.insert(s.seat_id)) {
            return Err(BookingError::Validation(format!("seat {} is requested twice", dup.seat_id)));
        }

        let layout = self.layout(request.screening_id).await?;
        if let Some(foreign) = request.seats.iter().find(|s| !layout.contains(&s.seat_id)) {
            return Err(BookingError::Validation(format!(
                "seat {} is not part of screening {}",
                foreign.seat_id, request.screening_id
            )));
        }
        let ticket_types = self
            .load_ticket_types(request.seats.iter().map(|s| s.ticket_type_id))
            .await?;

        self.book(Prepared {
            screening_id: request.screening_id,
            holder,
            plan: SeatPlan::Explicit(request.seats),
            ticket_types,
        })
        .await
    }

    /// Books the block the allocator picks inside the transaction. Ticket
    /// types are assigned to the allocated seats in seat order.
    pub async fn create_allocated_booking(
        &self,
        request: AllocationRequest,
    ) -> Result<BookingConfirmation, BookingError> {
        let holder = validate_holder(request.owner, request.guest_email)?;
        if request.ticket_type_ids.is_empty() {
            return Err(BookingError::Validation("at least one ticket is required".to_string()));
        }

        let layout = self.layout(request.screening_id).await?;
        if let Some(anchor) = request.anchor_seat_id {
            if !layout.contains(&anchor) {
                return Err(BookingError::Validation(format!(
                    "seat {anchor} is not part of screening {}",
                    request.screening_id
                )));
            }
        }
        if request.ticket_type_ids.len() > layout.len() {
            return Err(BookingError::NoContiguousBlock { requested: request.ticket_type_ids.len() });
        }
        let ticket_types = self
            .load_ticket_types(request.ticket_type_ids.iter().copied())
            .await?;

        self.book(Prepared {
            screening_id: request.screening_id,
            holder,
            plan: SeatPlan::Allocate {
                ticket_type_ids: request.ticket_type_ids,
                anchor: request.anchor_seat_id,
            },
            ticket_types,
        })
        .await
    }

    async fn ensure_screening(&self, screening_id: ScreeningId) -> Result<Screening, BookingError> {
        self.store
            .screening(screening_id)
            .await?
            .ok_or_else(|| BookingError::NotFound(format!("screening {screening_id}")))
    }

    /// Seat ids of the screening's auditorium, read from the store.
    async fn layout(&self, screening_id: ScreeningId) -> Result<BTreeSet<SeatId>, BookingError> {
        self.ensure_screening(screening_id).await?;
        let seat_map = self.store.seat_map(screening_id).await?;
        Ok(seat_map.into_iter().map(|s| s.seat_id).collect())
    }

    async fn load_ticket_types(
        &self,
        ids: impl Iterator<Item = TicketTypeId>,
    ) -> Result<BTreeMap<TicketTypeId, TicketType>, BookingError> {
        let wanted: Vec<TicketTypeId> = ids.collect::<BTreeSet<_>>().into_iter().collect();
        let found: BTreeMap<TicketTypeId, TicketType> = self
            .store
            .ticket_types(&wanted)
            .await?
            .into_iter()
            .map(|t| (t.id, t))
            .collect();

        if let Some(missing) = wanted.iter().find(|id| !found.contains_key(id)) {
            return Err(BookingError::Validation(format!("unknown ticket type {missing}")));
        }
        Ok(found)
    }

    async fn book(&self, prepared: Prepared) -> Result<BookingConfirmation, BookingError> {
        let screening_id = prepared.screening_id;
        let attempts = self.config.code_retry_attempts.max(1);

        for attempt in 1..=attempts {
            let code = (self.codes)();
            let guard = self.locks.acquire(screening_id).await;

            match self.try_commit(&prepared, &code).await {
                Ok(committed) => {
                    info!(
                        booking_id = committed.booking_id,
                        screening_id,
                        booking_code = %committed.code,
                        seats = committed.seats.len(),
                        "booking committed"
                    );
                    announce_seat_change(
                        &self.cache,
                        &self.hub,
                        screening_id,
                        committed.seat_ids(),
                        SeatStatus::Booked,
                    )
                    .await;
                    drop(guard);

                    let warnings = self.send_confirmation(&prepared, &committed).await;
                    return Ok(BookingConfirmation {
                        booking_id: committed.booking_id,
                        booking_code: committed.code.clone(),
                        screening_id,
                        seat_ids: committed.seat_ids(),
                        warnings,
                    });
                }
                Err(BookingError::Store(StoreError::CodeCollision(code))) => {
                    warn!(screening_id, attempt, booking_code = %code, "booking code collision, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(BookingError::TransientStoreFailure(format!(
            "no unique booking code after {attempts} attempts"
        )))
    }

    async fn try_commit(&self, prepared: &Prepared, code: &str) -> Result<Committed, BookingError> {
        let mut tx = self.store.begin(prepared.screening_id).await?;
        match stage(tx.as_mut(), prepared, code).await {
            Ok(committed) => {
                tx.commit().await?;
                Ok(committed)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(screening_id = prepared.screening_id, error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn send_confirmation(&self, prepared: &Prepared, committed: &Committed) -> Vec<String> {
        let recipient = match &prepared.holder {
            BookingHolder::Guest { email } => email.clone(),
            BookingHolder::Owner { user_id } => match self.store.user(*user_id).await {
                Ok(Some(user)) => user.email,
                Ok(None) => {
                    warn!(booking_id = committed.booking_id, user_id, "booking owner not found");
                    return vec!["confirmation not sent: account not found".to_string()];
                }
                Err(e) => {
                    warn!(booking_id = committed.booking_id, error = %e, "could not load booking owner");
                    return vec!["confirmation not sent: account lookup failed".to_string()];
                }
            },
        };

        let confirmation = build_confirmation(committed, &prepared.ticket_types);
        match self.notifier.send(&recipient, &confirmation).await {
            Ok(()) => {
                debug!(booking_id = committed.booking_id, "confirmation sent");
                Vec::new()
            }
            Err(e) => {
                warn!(booking_id = committed.booking_id, error = %e, "confirmation delivery failed");
                vec![format!("confirmation could not be delivered: {e}")]
            }
        }
    }
}

fn validate_holder(owner: Option<UserId>, guest_email: Option<String>) -> Result<BookingHolder, BookingError> {
    let guest_email = guest_email.map(|e| e.trim().to_string());
    if let Some(email) = &guest_email {
        if !email.validate_email() {
            return Err(BookingError::Validation(format!("invalid guest email {email:?}")));
        }
    }
    BookingHolder::from_parts(owner, guest_email).ok_or_else(|| {
        BookingError::Validation("a booking needs exactly one of a signed-in owner or a guest email".to_string())
    })
}

/// Everything that happens between begin and commit. Reads the seat map
/// inside the transaction, so the decision never relies on cached state.
async fn stage(
    tx: &mut dyn SeatTransaction,
    prepared: &Prepared,
    code: &str,
) -> Result<Committed, BookingError> {
    let seat_map = tx.seat_map().await?;

    let seats = match &prepared.plan {
        SeatPlan::Explicit(seats) => {
            let available: BTreeSet<SeatId> = seat_map
                .iter()
                .filter(|s| s.is_available())
                .map(|s| s.seat_id)
                .collect();
            let taken: Vec<SeatId> = seats
                .iter()
                .map(|s| s.seat_id)
                .filter(|id| !available.contains(id))
                .collect();
            if !taken.is_empty() {
                return Err(BookingError::Conflict { seat_ids: taken });
            }
            seats.clone()
        }
        SeatPlan::Allocate { ticket_type_ids, anchor } => {
            let block = allocator::allocate(&seat_map, ticket_type_ids.len(), *anchor);
            if block.is_empty() {
                return Err(BookingError::NoContiguousBlock { requested: ticket_type_ids.len() });
            }
            block
                .into_iter()
                .zip(ticket_type_ids.iter().copied())
                .map(|(seat_id, ticket_type_id)| SeatAssignment { seat_id, ticket_type_id })
                .collect()
        }
    };

    let booking = NewBooking {
        code: code.to_string(),
        screening_id: prepared.screening_id,
        holder: prepared.holder.clone(),
        created_at: Utc::now(),
        seats,
    };

    let booking_id = match tx.insert_booking(&booking).await {
        Ok(id) => id,
        Err(StoreError::SeatTaken { .. }) => {
            return Err(BookingError::Conflict {
                seat_ids: booking.seats.iter().map(|s| s.seat_id).collect(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    Ok(Committed {
        booking_id,
        code: booking.code,
        screening: tx.screening().clone(),
        seats: booking.seats,
        seat_map,
    })
}

fn build_confirmation(committed: &Committed, ticket_types: &BTreeMap<TicketTypeId, TicketType>) -> Confirmation {
    let positions: BTreeMap<SeatId, &SeatView> = committed.seat_map.iter().map(|s| (s.seat_id, s)).collect();

    let seats: Vec<ConfirmationSeat> = committed
        .seats
        .iter()
        .map(|assignment| {
            let position = positions.get(&assignment.seat_id);
            let ticket = ticket_types.get(&assignment.ticket_type_id);
            ConfirmationSeat {
                seat_id: assignment.seat_id,
                row_num: position.map(|p| p.row_num).unwrap_or_default(),
                seat_num: position.map(|p| p.seat_num).unwrap_or_default(),
                ticket_type: ticket.map(|t| t.name.clone()).unwrap_or_default(),
                price_cents: ticket.map(|t| t.price_cents).unwrap_or_default(),
            }
        })
        .collect();

    Confirmation {
        booking_id: committed.booking_id,
        booking_code: committed.code.clone(),
        movie_title: committed.screening.movie_title.clone(),
        starts_at: committed.screening.starts_at,
        total_cents: seats.iter().map(|s| s.price_cents).sum(),
        seats,
    }
}
