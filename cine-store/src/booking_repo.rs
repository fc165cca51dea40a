use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cine_core::{
    Booking, BookingRepository, BookingSeatLine, BookingSnackLine, BookingStatus, BookingTransition, CoreError,
    CoreResult, Payment, RefundMetadata, SeatEffect, SeatStatus,
};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::lock_repo::{lock_for_update, lock_lines, seats_for_update, set_seat_status};
use crate::payment_repo::{insert_payment_row, payment_status_for_update, update_payment_row, upsert_refund_row};
use crate::pg_store::{db_err, PgStore};

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    user_id: Uuid,
    showtime_id: Uuid,
    promotion_code: Option<String>,
    subtotal: f64,
    discount_amount: f64,
    discount_reason: Option<String>,
    final_price: f64,
    status: String,
    booked_at: DateTime<Utc>,
    payment_expires_at: DateTime<Utc>,
    qr_payload: Option<String>,
    loyalty_points: i64,
    loyalty_points_awarded: bool,
    refund: Option<Json<RefundMetadata>>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct BookingSeatRow {
    showtime_seat_id: Uuid,
    ticket_type_id: Uuid,
    price: f64,
}

#[derive(sqlx::FromRow)]
struct BookingSnackRow {
    snack_id: Uuid,
    name: String,
    quantity: i32,
    unit_price: f64,
    total: f64,
}

const BOOKING_COLUMNS: &str = "id, user_id, showtime_id, promotion_code, subtotal, discount_amount, \
    discount_reason, final_price, status, booked_at, payment_expires_at, qr_payload, loyalty_points, \
    loyalty_points_awarded, refund, updated_at";

async fn hydrate(pool: &PgPool, row: BookingRow) -> CoreResult<Booking> {
    let seats: Vec<BookingSeatRow> = sqlx::query_as(
        "SELECT showtime_seat_id, ticket_type_id, price FROM booking_seats WHERE booking_id = $1",
    )
    .bind(row.id)
    .fetch_all(pool)
    .await
    .map_err(db_err)?;

    let snacks: Vec<BookingSnackRow> = sqlx::query_as(
        "SELECT snack_id, name, quantity, unit_price, total FROM booking_snacks WHERE booking_id = $1",
    )
    .bind(row.id)
    .fetch_all(pool)
    .await
    .map_err(db_err)?;

    Ok(Booking {
        id: row.id,
        user_id: row.user_id,
        showtime_id: row.showtime_id,
        seats: seats
            .into_iter()
            .map(|s| BookingSeatLine {
                showtime_seat_id: s.showtime_seat_id,
                ticket_type_id: s.ticket_type_id,
                price: s.price,
            })
            .collect(),
        snacks: snacks
            .into_iter()
            .map(|s| BookingSnackLine {
                snack_id: s.snack_id,
                name: s.name,
                quantity: s.quantity.max(0) as u32,
                unit_price: s.unit_price,
                total: s.total,
            })
            .collect(),
        promotion_code: row.promotion_code,
        subtotal: row.subtotal,
        discount_amount: row.discount_amount,
        discount_reason: row.discount_reason,
        final_price: row.final_price,
        status: row.status.parse::<BookingStatus>()?,
        booked_at: row.booked_at,
        payment_expires_at: row.payment_expires_at,
        qr_payload: row.qr_payload,
        loyalty_points: row.loyalty_points,
        loyalty_points_awarded: row.loyalty_points_awarded,
        refund: row.refund.map(|j| j.0),
        updated_at: row.updated_at,
    })
}

async fn insert_booking_rows(conn: &mut PgConnection, b: &Booking) -> CoreResult<()> {
    sqlx::query(&format!(
        "INSERT INTO bookings ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        BOOKING_COLUMNS
    ))
    .bind(b.id)
    .bind(b.user_id)
    .bind(b.showtime_id)
    .bind(&b.promotion_code)
    .bind(b.subtotal)
    .bind(b.discount_amount)
    .bind(&b.discount_reason)
    .bind(b.final_price)
    .bind(b.status.as_str())
    .bind(b.booked_at)
    .bind(b.payment_expires_at)
    .bind(&b.qr_payload)
    .bind(b.loyalty_points)
    .bind(b.loyalty_points_awarded)
    .bind(b.refund.as_ref().map(Json))
    .bind(b.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    for seat in &b.seats {
        sqlx::query(
            "INSERT INTO booking_seats (booking_id, showtime_seat_id, ticket_type_id, price) VALUES ($1, $2, $3, $4)",
        )
        .bind(b.id)
        .bind(seat.showtime_seat_id)
        .bind(seat.ticket_type_id)
        .bind(seat.price)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    }

    for snack in &b.snacks {
        sqlx::query(
            r#"
            INSERT INTO booking_snacks (booking_id, snack_id, name, quantity, unit_price, total)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(b.id)
        .bind(snack.snack_id)
        .bind(&snack.name)
        .bind(snack.quantity as i32)
        .bind(snack.unit_price)
        .bind(snack.total)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    }

    Ok(())
}

#[async_trait]
impl BookingRepository for PgStore {
    async fn insert_booking_from_lock(
        &self,
        lock_id: Uuid,
        now: DateTime<Utc>,
        booking: &Booking,
        payment: Option<&Payment>,
    ) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // The sweep takes the same row lock, so only one of them sees the lock
        let lock = match lock_for_update(&mut tx, lock_id).await? {
            Some(lock) if !lock.is_expired(now) => lock,
            _ => return Err(CoreError::LockExpired(lock_id)),
        };

        let seat_ids: Vec<Uuid> = lock_lines(&mut tx, lock.id)
            .await?
            .into_iter()
            .map(|l| l.showtime_seat_id)
            .collect();
        let not_locked: Vec<Uuid> = seats_for_update(&mut tx, &seat_ids)
            .await?
            .into_iter()
            .filter(|(_, status)| *status != SeatStatus::Locked)
            .map(|(id, _)| id)
            .collect();
        if !not_locked.is_empty() {
            return Err(CoreError::SeatLocked { seat_ids: not_locked });
        }

        set_seat_status(&mut tx, &seat_ids, SeatStatus::Locked, SeatStatus::Booked).await?;
        sqlx::query("DELETE FROM seat_locks WHERE id = $1")
            .bind(lock.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        insert_booking_rows(&mut tx, booking).await?;
        if let Some(payment) = payment {
            insert_payment_row(&mut tx, payment).await?;
        }

        tx.commit().await.map_err(db_err)?;
        info!("Booking {} created from lock {}", booking.id, lock_id);
        Ok(())
    }

    async fn get_booking(&self, booking_id: Uuid) -> CoreResult<Option<Booking>> {
        let row: Option<BookingRow> =
            sqlx::query_as(&format!("SELECT {} FROM bookings WHERE id = $1", BOOKING_COLUMNS))
                .bind(booking_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;

        match row {
            Some(row) => Ok(Some(hydrate(&self.pool, row).await?)),
            None => Ok(None),
        }
    }

    async fn list_overdue_bookings(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>> {
        let rows: Vec<BookingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM bookings WHERE status = 'PENDING_PAYMENT' AND payment_expires_at < $1 \
             ORDER BY payment_expires_at LIMIT $2",
            BOOKING_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut bookings = Vec::with_capacity(rows.len());
        for row in rows {
            bookings.push(hydrate(&self.pool, row).await?);
        }
        Ok(bookings)
    }

    async fn commit_transition(&self, t: &BookingTransition) -> CoreResult<bool> {
        let booking = &t.booking;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let current: Option<String> = sqlx::query_scalar("SELECT status FROM bookings WHERE id = $1 FOR UPDATE")
            .bind(booking.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        let current = match current {
            Some(s) => s.parse::<BookingStatus>()?,
            None => return Err(CoreError::not_found("booking", booking.id)),
        };
        if current != t.expected_booking_status {
            debug!("Booking {} is {} not {}, transition skipped", booking.id, current, t.expected_booking_status);
            return Ok(false);
        }

        if let (Some(payment), Some(expected)) = (&t.payment, t.expected_payment_status) {
            match payment_status_for_update(&mut tx, payment.id).await? {
                Some(status) if status == expected => {}
                Some(_) => return Ok(false),
                None => return Err(CoreError::not_found("payment", payment.id)),
            }
        }

        let seat_ids = booking.seat_ids();
        match t.seat_effect {
            SeatEffect::Keep => {}
            SeatEffect::Release => {
                seats_for_update(&mut tx, &seat_ids).await?;
                set_seat_status(&mut tx, &seat_ids, SeatStatus::Booked, SeatStatus::Available).await?;
            }
            SeatEffect::Reclaim => {
                let taken: Vec<Uuid> = seats_for_update(&mut tx, &seat_ids)
                    .await?
                    .into_iter()
                    .filter(|(_, status)| *status != SeatStatus::Available)
                    .map(|(id, _)| id)
                    .collect();
                if !taken.is_empty() {
                    return Err(CoreError::SeatLocked { seat_ids: taken });
                }
                set_seat_status(&mut tx, &seat_ids, SeatStatus::Available, SeatStatus::Booked).await?;
            }
        }

        sqlx::query(
            r#"
            UPDATE bookings
            SET status = $2, qr_payload = $3, loyalty_points_awarded = $4, refund = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(booking.id)
        .bind(booking.status.as_str())
        .bind(&booking.qr_payload)
        .bind(booking.loyalty_points_awarded)
        .bind(booking.refund.as_ref().map(Json))
        .bind(booking.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if let Some(payment) = &t.payment {
            update_payment_row(&mut tx, payment).await?;
        }

        if t.loyalty_points_delta != 0 {
            sqlx::query("UPDATE users SET loyalty_points = loyalty_points + $2 WHERE id = $1")
                .bind(booking.user_id)
                .bind(t.loyalty_points_delta)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        if let Some(refund) = &t.refund {
            upsert_refund_row(&mut tx, refund).await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }
}
