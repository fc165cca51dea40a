use async_trait::async_trait;
use chrono::NaiveDateTime;
use cine_core::{CatalogRepository, CoreResult, SeatStatus, Showtime, ShowtimeSeat, Snack};
use cine_pricing::{Adjustment, ModifierKind, TicketType};
use uuid::Uuid;

use crate::pg_store::{db_err, PgStore};

// Internal structs for type-safe querying
#[derive(sqlx::FromRow)]
struct ShowtimeRow {
    id: Uuid,
    movie_id: Uuid,
    room_id: Uuid,
    start_time: NaiveDateTime,
    format: String,
    room_type: String,
}

#[derive(sqlx::FromRow)]
pub(crate) struct ShowtimeSeatRow {
    id: Uuid,
    showtime_id: Uuid,
    seat_id: Uuid,
    row_label: String,
    seat_number: i32,
    seat_type: String,
    status: String,
}

impl ShowtimeSeatRow {
    pub(crate) fn into_seat(self) -> CoreResult<ShowtimeSeat> {
        Ok(ShowtimeSeat {
            id: self.id,
            showtime_id: self.showtime_id,
            seat_id: self.seat_id,
            row_label: self.row_label,
            seat_number: self.seat_number,
            seat_type: self.seat_type,
            status: self.status.parse::<SeatStatus>()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TicketTypeRow {
    id: Uuid,
    name: String,
    modifier_type: String,
    modifier_value: f64,
    is_active: bool,
}

#[derive(sqlx::FromRow)]
struct SnackRow {
    id: Uuid,
    name: String,
    price: f64,
    is_active: bool,
}

pub(crate) const SEAT_COLUMNS: &str =
    "id, showtime_id, seat_id, row_label, seat_number, seat_type, status";

#[async_trait]
impl CatalogRepository for PgStore {
    async fn get_showtime(&self, showtime_id: Uuid) -> CoreResult<Option<Showtime>> {
        let row: Option<ShowtimeRow> = sqlx::query_as(
            "SELECT id, movie_id, room_id, start_time, format, room_type FROM showtimes WHERE id = $1",
        )
        .bind(showtime_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| Showtime {
            id: r.id,
            movie_id: r.movie_id,
            room_id: r.room_id,
            start_time: r.start_time,
            format: r.format,
            room_type: r.room_type,
        }))
    }

    async fn list_showtime_seats(&self, showtime_id: Uuid) -> CoreResult<Vec<ShowtimeSeat>> {
        let rows: Vec<ShowtimeSeatRow> = sqlx::query_as(&format!(
            "SELECT {} FROM showtime_seats WHERE showtime_id = $1 ORDER BY row_label, seat_number",
            SEAT_COLUMNS
        ))
        .bind(showtime_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(ShowtimeSeatRow::into_seat).collect()
    }

    async fn get_showtime_seats(&self, showtime_id: Uuid, seat_ids: &[Uuid]) -> CoreResult<Vec<ShowtimeSeat>> {
        let rows: Vec<ShowtimeSeatRow> = sqlx::query_as(&format!(
            "SELECT {} FROM showtime_seats WHERE showtime_id = $1 AND id = ANY($2)",
            SEAT_COLUMNS
        ))
        .bind(showtime_id)
        .bind(seat_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(ShowtimeSeatRow::into_seat).collect()
    }

    async fn get_ticket_type(&self, ticket_type_id: Uuid) -> CoreResult<Option<TicketType>> {
        let row: Option<TicketTypeRow> = sqlx::query_as(
            "SELECT id, name, modifier_type, modifier_value, is_active FROM ticket_types WHERE id = $1",
        )
        .bind(ticket_type_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(r) => Ok(Some(TicketType {
                id: r.id,
                name: r.name,
                adjustment: Adjustment {
                    kind: r.modifier_type.parse::<ModifierKind>()?,
                    value: r.modifier_value,
                },
                is_active: r.is_active,
            })),
            None => Ok(None),
        }
    }

    async fn is_ticket_type_assignable(&self, showtime_id: Uuid, ticket_type_id: Uuid) -> CoreResult<bool> {
        let assignable: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM showtime_ticket_types stt
                JOIN ticket_types tt ON tt.id = stt.ticket_type_id
                WHERE stt.showtime_id = $1 AND stt.ticket_type_id = $2 AND tt.is_active
            )
            "#,
        )
        .bind(showtime_id)
        .bind(ticket_type_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(assignable)
    }

    async fn get_snack(&self, snack_id: Uuid) -> CoreResult<Option<Snack>> {
        let row: Option<SnackRow> = sqlx::query_as("SELECT id, name, price, is_active FROM snacks WHERE id = $1")
            .bind(snack_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.map(|r| Snack { id: r.id, name: r.name, price: r.price, is_active: r.is_active }))
    }
}
