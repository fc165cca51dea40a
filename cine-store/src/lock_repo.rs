use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cine_core::{CoreError, CoreResult, LockOwner, OwnerKind, SeatLock, SeatLockLine, SeatLockRepository, SeatStatus};
use sqlx::{Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::pg_store::{db_err, PgStore};

#[derive(sqlx::FromRow)]
pub(crate) struct LockRow {
    id: Uuid,
    owner_id: String,
    owner_kind: String,
    showtime_id: Uuid,
    lock_token: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl LockRow {
    pub(crate) fn into_lock(self) -> CoreResult<SeatLock> {
        Ok(SeatLock {
            id: self.id,
            owner: LockOwner { id: self.owner_id, kind: self.owner_kind.parse::<OwnerKind>()? },
            showtime_id: self.showtime_id,
            lock_token: self.lock_token,
            created_at: self.created_at,
            expires_at: self.expires_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LockLineRow {
    lock_id: Uuid,
    showtime_seat_id: Uuid,
    ticket_type_id: Uuid,
    price: f64,
}

impl From<LockLineRow> for SeatLockLine {
    fn from(r: LockLineRow) -> Self {
        SeatLockLine {
            lock_id: r.lock_id,
            showtime_seat_id: r.showtime_seat_id,
            ticket_type_id: r.ticket_type_id,
            price: r.price,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct SeatStateRow {
    pub(crate) id: Uuid,
    pub(crate) status: String,
}

pub(crate) const LOCK_COLUMNS: &str = "id, owner_id, owner_kind, showtime_id, lock_token, created_at, expires_at";

pub(crate) async fn lock_for_update(
    tx: &mut Transaction<'_, Postgres>,
    lock_id: Uuid,
) -> CoreResult<Option<SeatLock>> {
    let row: Option<LockRow> = sqlx::query_as(&format!(
        "SELECT {} FROM seat_locks WHERE id = $1 FOR UPDATE",
        LOCK_COLUMNS
    ))
    .bind(lock_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_err)?;

    row.map(LockRow::into_lock).transpose()
}

pub(crate) async fn lock_lines(tx: &mut Transaction<'_, Postgres>, lock_id: Uuid) -> CoreResult<Vec<SeatLockLine>> {
    let rows: Vec<LockLineRow> = sqlx::query_as(
        "SELECT lock_id, showtime_seat_id, ticket_type_id, price FROM seat_lock_lines WHERE lock_id = $1",
    )
    .bind(lock_id)
    .fetch_all(&mut **tx)
    .await
    .map_err(db_err)?;

    Ok(rows.into_iter().map(SeatLockLine::from).collect())
}

/// Read seat rows under a row lock, in id order to keep lock acquisition ordered.
pub(crate) async fn seats_for_update(
    tx: &mut Transaction<'_, Postgres>,
    seat_ids: &[Uuid],
) -> CoreResult<Vec<(Uuid, SeatStatus)>> {
    let rows: Vec<SeatStateRow> =
        sqlx::query_as("SELECT id, status FROM showtime_seats WHERE id = ANY($1) ORDER BY id FOR UPDATE")
            .bind(seat_ids)
            .fetch_all(&mut **tx)
            .await
            .map_err(db_err)?;

    rows.into_iter()
        .map(|r| -> CoreResult<(Uuid, SeatStatus)> { Ok((r.id, r.status.parse::<SeatStatus>()?)) })
        .collect()
}

/// Move seats between states; only rows currently in `from` are touched.
pub(crate) async fn set_seat_status(
    tx: &mut Transaction<'_, Postgres>,
    seat_ids: &[Uuid],
    from: SeatStatus,
    to: SeatStatus,
) -> CoreResult<u64> {
    let result = sqlx::query("UPDATE showtime_seats SET status = $1 WHERE id = ANY($2) AND status = $3")
        .bind(to.as_str())
        .bind(seat_ids)
        .bind(from.as_str())
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    Ok(result.rows_affected())
}

#[async_trait]
impl SeatLockRepository for PgStore {
    async fn insert_lock(&self, lock: &SeatLock, lines: &[SeatLockLine]) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // An expired, not yet swept lock for the same owner and showtime is replaced
        let existing: Option<LockRow> = sqlx::query_as(&format!(
            "SELECT {} FROM seat_locks WHERE owner_id = $1 AND owner_kind = $2 AND showtime_id = $3 FOR UPDATE",
            LOCK_COLUMNS
        ))
        .bind(&lock.owner.id)
        .bind(lock.owner.kind.as_str())
        .bind(lock.showtime_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        if let Some(row) = existing {
            let previous = row.into_lock()?;
            if !previous.is_expired(lock.created_at) {
                return Err(CoreError::DomainConflict(format!(
                    "owner already holds active lock {} for this showtime",
                    previous.id
                )));
            }
            let stale: Vec<Uuid> = lock_lines(&mut tx, previous.id)
                .await?
                .into_iter()
                .map(|l| l.showtime_seat_id)
                .collect();
            set_seat_status(&mut tx, &stale, SeatStatus::Locked, SeatStatus::Available).await?;
            sqlx::query("DELETE FROM seat_locks WHERE id = $1")
                .bind(previous.id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        let seat_ids: Vec<Uuid> = lines.iter().map(|l| l.showtime_seat_id).collect();
        let states = seats_for_update(&mut tx, &seat_ids).await?;
        if states.len() != seat_ids.len() {
            return Err(CoreError::ResourceNotFound("one or more showtime seats".into()));
        }
        let taken: Vec<Uuid> = states
            .iter()
            .filter(|(_, status)| *status != SeatStatus::Available)
            .map(|(id, _)| *id)
            .collect();
        if !taken.is_empty() {
            return Err(CoreError::SeatLocked { seat_ids: taken });
        }

        sqlx::query(
            r#"
            INSERT INTO seat_locks (id, owner_id, owner_kind, showtime_id, lock_token, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(lock.id)
        .bind(&lock.owner.id)
        .bind(lock.owner.kind.as_str())
        .bind(lock.showtime_id)
        .bind(&lock.lock_token)
        .bind(lock.created_at)
        .bind(lock.expires_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for line in lines {
            sqlx::query(
                r#"
                INSERT INTO seat_lock_lines (lock_id, showtime_seat_id, ticket_type_id, price)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(lock.id)
            .bind(line.showtime_seat_id)
            .bind(line.ticket_type_id)
            .bind(line.price)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        set_seat_status(&mut tx, &seat_ids, SeatStatus::Available, SeatStatus::Locked).await?;

        tx.commit().await.map_err(db_err)?;
        debug!("Persisted seat lock {} with {} seats", lock.id, lines.len());
        Ok(())
    }

    async fn get_lock(&self, lock_id: Uuid) -> CoreResult<Option<(SeatLock, Vec<SeatLockLine>)>> {
        let row: Option<LockRow> = sqlx::query_as(&format!("SELECT {} FROM seat_locks WHERE id = $1", LOCK_COLUMNS))
            .bind(lock_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        let lock = match row {
            Some(r) => r.into_lock()?,
            None => return Ok(None),
        };

        let lines: Vec<LockLineRow> = sqlx::query_as(
            "SELECT lock_id, showtime_seat_id, ticket_type_id, price FROM seat_lock_lines WHERE lock_id = $1",
        )
        .bind(lock_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(Some((lock, lines.into_iter().map(SeatLockLine::from).collect())))
    }

    async fn find_locks_by_owner(&self, owner: &LockOwner) -> CoreResult<Vec<SeatLock>> {
        let rows: Vec<LockRow> = sqlx::query_as(&format!(
            "SELECT {} FROM seat_locks WHERE owner_id = $1 AND owner_kind = $2 ORDER BY created_at",
            LOCK_COLUMNS
        ))
        .bind(&owner.id)
        .bind(owner.kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(LockRow::into_lock).collect()
    }

    async fn delete_lock(
        &self,
        lock_id: Uuid,
        expired_before: Option<DateTime<Utc>>,
    ) -> CoreResult<Option<Vec<SeatLockLine>>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let lock = match lock_for_update(&mut tx, lock_id).await? {
            Some(lock) => lock,
            None => return Ok(None),
        };
        if let Some(cutoff) = expired_before {
            if !lock.is_expired(cutoff) {
                return Ok(None);
            }
        }

        let lines = lock_lines(&mut tx, lock_id).await?;
        let seat_ids: Vec<Uuid> = lines.iter().map(|l| l.showtime_seat_id).collect();
        set_seat_status(&mut tx, &seat_ids, SeatStatus::Locked, SeatStatus::Available).await?;

        sqlx::query("DELETE FROM seat_locks WHERE id = $1")
            .bind(lock_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(Some(lines))
    }

    async fn list_expired_locks(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<SeatLock>> {
        let rows: Vec<LockRow> = sqlx::query_as(&format!(
            "SELECT {} FROM seat_locks WHERE expires_at <= $1 ORDER BY expires_at LIMIT $2",
            LOCK_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(LockRow::into_lock).collect()
    }
}
