use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgExecutor, PgPool, Postgres, Transaction};

use crate::database::Database;
use crate::models::{
    Booking, BookingHolder, BookingId, NewBooking, Role, Screening, ScreeningId, SeatAssignment,
    SeatId, SeatStatus, SeatView, TicketType, TicketTypeId, User, UserId,
};

use super::{SeatStore, SeatTransaction, StoreError, StoreResult};

// Names of the unique constraints in src/migrations
const BOOKING_CODE_CONSTRAINT: &str = "bookings_code_key";
const SEAT_ASSIGNMENT_CONSTRAINT: &str = "booking_seats_screening_seat_key";

const SEAT_MAP_SQL: &str = r#"
    SELECT s.id AS seat_id, s.row_num, s.seat_num, (bs.seat_id IS NOT NULL) AS booked
    FROM screenings sc
    JOIN seats s ON s.auditorium_id = sc.auditorium_id
    LEFT JOIN booking_seats bs ON bs.screening_id = sc.id AND bs.seat_id = s.id
    WHERE sc.id = $1
    ORDER BY s.row_num, s.seat_num
"#;

#[derive(FromRow)]
struct SeatMapRow {
    seat_id: i64,
    row_num: i32,
    seat_num: i32,
    booked: bool,
}

impl From<SeatMapRow> for SeatView {
    fn from(row: SeatMapRow) -> Self {
        SeatView {
            seat_id: row.seat_id,
            row_num: row.row_num,
            seat_num: row.seat_num,
            status: if row.booked { SeatStatus::Booked } else { SeatStatus::Available },
        }
    }
}

#[derive(FromRow)]
struct BookingRow {
    id: i64,
    code: String,
    screening_id: i64,
    user_id: Option<i64>,
    guest_email: Option<String>,
    created_at: DateTime<Utc>,
}

impl BookingRow {
    fn into_booking(self, seats: Vec<SeatAssignment>) -> StoreResult<Booking> {
        let holder = BookingHolder::from_parts(self.user_id, self.guest_email).ok_or_else(|| {
            StoreError::Corrupt(format!("booking {} must have exactly one holder", self.id))
        })?;
        Ok(Booking {
            id: self.id,
            code: self.code,
            screening_id: self.screening_id,
            holder,
            created_at: self.created_at,
            seats,
        })
    }
}

#[derive(FromRow)]
struct BookingSeatRow {
    booking_id: i64,
    seat_id: i64,
    ticket_type_id: i64,
}

#[derive(FromRow)]
struct UserRow {
    id: i64,
    email: String,
    full_name: String,
    password_hash: String,
    role: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            email: row.email,
            full_name: row.full_name,
            password_hash: row.password_hash,
            role: Role::parse(&row.role),
        }
    }
}

async fn fetch_seat_map<'e, E: PgExecutor<'e>>(
    executor: E,
    screening_id: ScreeningId,
) -> Result<Vec<SeatView>, sqlx::Error> {
    let rows = sqlx::query_as::<_, SeatMapRow>(SEAT_MAP_SQL)
        .bind(screening_id)
        .fetch_all(executor)
        .await?;
    Ok(rows.into_iter().map(SeatView::from).collect())
}

async fn fetch_booking_row<'e, E: PgExecutor<'e>>(
    executor: E,
    id: BookingId,
) -> Result<Option<BookingRow>, sqlx::Error> {
    sqlx::query_as::<_, BookingRow>(
        "SELECT id, code, screening_id, user_id, guest_email, created_at
         FROM bookings WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(executor)
    .await
}

async fn fetch_assignments<'e, E: PgExecutor<'e>>(
    executor: E,
    booking_ids: &[BookingId],
) -> Result<BTreeMap<BookingId, Vec<SeatAssignment>>, sqlx::Error> {
    let rows = sqlx::query_as::<_, BookingSeatRow>(
        "SELECT booking_id, seat_id, ticket_type_id
         FROM booking_seats
         WHERE booking_id = ANY($1)
         ORDER BY booking_id, seat_id",
    )
    .bind(booking_ids)
    .fetch_all(executor)
    .await?;

    let mut grouped: BTreeMap<BookingId, Vec<SeatAssignment>> = BTreeMap::new();
    for row in rows {
        grouped.entry(row.booking_id).or_default().push(SeatAssignment {
            seat_id: row.seat_id,
            ticket_type_id: row.ticket_type_id,
        });
    }
    Ok(grouped)
}

/// Translates the unique violations the booking insert can hit into domain errors.
fn classify_insert_error(err: sqlx::Error, booking: &NewBooking) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            match db_err.constraint() {
                Some(BOOKING_CODE_CONSTRAINT) => {
                    return StoreError::CodeCollision(booking.code.clone());
                }
                Some(SEAT_ASSIGNMENT_CONSTRAINT) => {
                    return StoreError::SeatTaken { screening_id: booking.screening_id };
                }
                _ => {}
            }
        }
    }
    StoreError::Database(err)
}

/// Postgres-backed store. Transactions lock the screening row with
/// `SELECT ... FOR UPDATE`, which orders every booking and cancellation of
/// that screening.
#[derive(Clone)]
pub struct PgSeatStore {
    pool: PgPool,
}

impl PgSeatStore {
    pub fn new(db: &Database) -> Self {
        Self { pool: db.pool.clone() }
    }
}

#[async_trait]
impl SeatStore for PgSeatStore {
    async fn screening(&self, id: ScreeningId) -> StoreResult<Option<Screening>> {
        let screening = sqlx::query_as::<_, Screening>(
            "SELECT id, movie_title, auditorium_id, starts_at FROM screenings WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(screening)
    }

    async fn seat_map(&self, screening_id: ScreeningId) -> StoreResult<Vec<SeatView>> {
        Ok(fetch_seat_map(&self.pool, screening_id).await?)
    }

    async fn ticket_types(&self, ids: &[TicketTypeId]) -> StoreResult<Vec<TicketType>> {
        let types = sqlx::query_as::<_, TicketType>(
            "SELECT id, name, price_cents FROM ticket_types WHERE id = ANY($1) ORDER BY id",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(types)
    }

    async fn user(&self, id: UserId) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, full_name, password_hash, role FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    async fn user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, full_name, password_hash, role FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    async fn booking(&self, id: BookingId) -> StoreResult<Option<Booking>> {
        let Some(row) = fetch_booking_row(&self.pool, id).await? else {
            return Ok(None);
        };
        let mut seats = fetch_assignments(&self.pool, &[id]).await?;
        row.into_booking(seats.remove(&id).unwrap_or_default()).map(Some)
    }

    async fn bookings_for_user(&self, user_id: UserId) -> StoreResult<Vec<Booking>> {
        let rows = sqlx::query_as::<_, BookingRow>(
            "SELECT id, code, screening_id, user_id, guest_email, created_at
             FROM bookings
             WHERE user_id = $1
             ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<BookingId> = rows.iter().map(|row| row.id).collect();
        let mut seats = fetch_assignments(&self.pool, &ids).await?;

        rows.into_iter()
            .map(|row| {
                let assignments = seats.remove(&row.id).unwrap_or_default();
                row.into_booking(assignments)
            })
            .collect()
    }

    async fn begin(&self, screening_id: ScreeningId) -> StoreResult<Box<dyn SeatTransaction>> {
        let mut tx = self.pool.begin().await?;

        let screening = sqlx::query_as::<_, Screening>(
            "SELECT id, movie_title, auditorium_id, starts_at
             FROM screenings WHERE id = $1
             FOR UPDATE",
        )
        .bind(screening_id)
        .fetch_optional(&mut *tx)
        .await?;

        match screening {
            Some(screening) => Ok(Box::new(PgSeatTransaction { tx, screening })),
            None => {
                tx.rollback().await?;
                Err(StoreError::ScreeningNotFound(screening_id))
            }
        }
    }
}

pub struct PgSeatTransaction {
    tx: Transaction<'static, Postgres>,
    screening: Screening,
}

#[async_trait]
impl SeatTransaction for PgSeatTransaction {
    fn screening(&self) -> &Screening {
        &self.screening
    }

    async fn seat_map(&mut self) -> StoreResult<Vec<SeatView>> {
        Ok(fetch_seat_map(&mut *self.tx, self.screening.id).await?)
    }

    async fn insert_booking(&mut self, booking: &NewBooking) -> StoreResult<BookingId> {
        let booking_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO bookings (code, screening_id, user_id, guest_email, created_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id",
        )
        .bind(&booking.code)
        .bind(booking.screening_id)
        .bind(booking.holder.owner_id())
        .bind(booking.holder.guest_email())
        .bind(booking.created_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| classify_insert_error(e, booking))?;

        let seat_ids: Vec<SeatId> = booking.seats.iter().map(|s| s.seat_id).collect();
        let ticket_type_ids: Vec<TicketTypeId> =
            booking.seats.iter().map(|s| s.ticket_type_id).collect();

        sqlx::query(
            "INSERT INTO booking_seats (booking_id, screening_id, seat_id, ticket_type_id)
             SELECT $1, $2, t.seat_id, t.ticket_type_id
             FROM UNNEST($3::BIGINT[], $4::BIGINT[]) AS t(seat_id, ticket_type_id)",
        )
        .bind(booking_id)
        .bind(booking.screening_id)
        .bind(&seat_ids)
        .bind(&ticket_type_ids)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| classify_insert_error(e, booking))?;

        Ok(booking_id)
    }

    async fn booking(&mut self, id: BookingId) -> StoreResult<Option<Booking>> {
        let Some(row) = fetch_booking_row(&mut *self.tx, id).await? else {
            return Ok(None);
        };
        let mut seats = fetch_assignments(&mut *self.tx, &[id]).await?;
        row.into_booking(seats.remove(&id).unwrap_or_default()).map(Some)
    }

    async fn delete_booking(&mut self, id: BookingId) -> StoreResult<Vec<SeatId>> {
        let mut freed = sqlx::query_scalar::<_, i64>(
            "DELETE FROM booking_seats WHERE booking_id = $1 RETURNING seat_id",
        )
        .bind(id)
        .fetch_all(&mut *self.tx)
        .await?;
        freed.sort_unstable();

        sqlx::query("DELETE FROM bookings WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;

        Ok(freed)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
