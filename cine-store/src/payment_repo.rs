use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cine_core::{
    CoreError, CoreResult, Payment, PaymentMethod, PaymentRepository, PaymentStatus, Refund, RefundStatus,
};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::pg_store::{db_err, PgStore};

#[derive(sqlx::FromRow)]
pub(crate) struct PaymentRow {
    id: Uuid,
    booking_id: Uuid,
    method: String,
    amount: f64,
    currency: String,
    gateway_amount: f64,
    gateway_currency: String,
    exchange_rate: f64,
    gateway_order_id: Option<String>,
    gateway_txn_id: Option<String>,
    approval_url: Option<String>,
    status: String,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl PaymentRow {
    fn into_payment(self) -> CoreResult<Payment> {
        Ok(Payment {
            id: self.id,
            booking_id: self.booking_id,
            method: self.method.parse::<PaymentMethod>()?,
            amount: self.amount,
            currency: self.currency,
            gateway_amount: self.gateway_amount,
            gateway_currency: self.gateway_currency,
            exchange_rate: self.exchange_rate,
            gateway_order_id: self.gateway_order_id,
            gateway_txn_id: self.gateway_txn_id,
            approval_url: self.approval_url,
            status: self.status.parse::<PaymentStatus>()?,
            error_message: self.error_message,
            created_at: self.created_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RefundRow {
    id: Uuid,
    payment_id: Uuid,
    booking_id: Uuid,
    amount: f64,
    reason: String,
    gateway_refund_txn_id: Option<String>,
    status: String,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

const PAYMENT_COLUMNS: &str = "id, booking_id, method, amount, currency, gateway_amount, gateway_currency, \
    exchange_rate, gateway_order_id, gateway_txn_id, approval_url, status, error_message, created_at, \
    completed_at, updated_at";

pub(crate) async fn insert_payment_row(conn: &mut PgConnection, p: &Payment) -> CoreResult<()> {
    sqlx::query(&format!(
        "INSERT INTO payments ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        PAYMENT_COLUMNS
    ))
    .bind(p.id)
    .bind(p.booking_id)
    .bind(p.method.as_str())
    .bind(p.amount)
    .bind(&p.currency)
    .bind(p.gateway_amount)
    .bind(&p.gateway_currency)
    .bind(p.exchange_rate)
    .bind(&p.gateway_order_id)
    .bind(&p.gateway_txn_id)
    .bind(&p.approval_url)
    .bind(p.status.as_str())
    .bind(&p.error_message)
    .bind(p.created_at)
    .bind(p.completed_at)
    .bind(p.updated_at)
    .execute(conn)
    .await
    .map_err(|e| {
        let duplicate = e.as_database_error().is_some_and(|db| db.is_unique_violation());
        if duplicate {
            CoreError::DomainConflict(format!("booking {} already has an open payment", p.booking_id))
        } else {
            db_err(e)
        }
    })?;
    Ok(())
}

/// Writes every mutable column; callers guard on the previous status themselves.
pub(crate) async fn update_payment_row(conn: &mut PgConnection, p: &Payment) -> CoreResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE payments
        SET status = $2, gateway_order_id = $3, gateway_txn_id = $4, approval_url = $5,
            error_message = $6, completed_at = $7, updated_at = $8
        WHERE id = $1
        "#,
    )
    .bind(p.id)
    .bind(p.status.as_str())
    .bind(&p.gateway_order_id)
    .bind(&p.gateway_txn_id)
    .bind(&p.approval_url)
    .bind(&p.error_message)
    .bind(p.completed_at)
    .bind(p.updated_at)
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(result.rows_affected())
}

pub(crate) async fn upsert_refund_row(conn: &mut PgConnection, r: &Refund) -> CoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO refunds (id, payment_id, booking_id, amount, reason, gateway_refund_txn_id, status,
                             error_message, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (id) DO UPDATE
        SET gateway_refund_txn_id = EXCLUDED.gateway_refund_txn_id,
            status = EXCLUDED.status,
            error_message = EXCLUDED.error_message,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(r.id)
    .bind(r.payment_id)
    .bind(r.booking_id)
    .bind(r.amount)
    .bind(&r.reason)
    .bind(&r.gateway_refund_txn_id)
    .bind(r.status.as_str())
    .bind(&r.error_message)
    .bind(r.created_at)
    .bind(r.updated_at)
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub(crate) async fn payment_status_for_update(
    conn: &mut PgConnection,
    payment_id: Uuid,
) -> CoreResult<Option<PaymentStatus>> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM payments WHERE id = $1 FOR UPDATE")
        .bind(payment_id)
        .fetch_optional(conn)
        .await
        .map_err(db_err)?;
    status.map(|s| s.parse::<PaymentStatus>()).transpose()
}

#[async_trait]
impl PaymentRepository for PgStore {
    async fn insert_payment(&self, payment: &Payment) -> CoreResult<()> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        insert_payment_row(&mut conn, payment).await
    }

    async fn get_payment(&self, payment_id: Uuid) -> CoreResult<Option<Payment>> {
        let row: Option<PaymentRow> =
            sqlx::query_as(&format!("SELECT {} FROM payments WHERE id = $1", PAYMENT_COLUMNS))
                .bind(payment_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        row.map(PaymentRow::into_payment).transpose()
    }

    async fn find_payment_by_gateway_order(
        &self,
        method: PaymentMethod,
        gateway_order_id: &str,
    ) -> CoreResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE method = $1 AND gateway_order_id = $2",
            PAYMENT_COLUMNS
        ))
        .bind(method.as_str())
        .bind(gateway_order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(PaymentRow::into_payment).transpose()
    }

    async fn find_open_payment(&self, booking_id: Uuid) -> CoreResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE booking_id = $1 AND status = 'PENDING'",
            PAYMENT_COLUMNS
        ))
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(PaymentRow::into_payment).transpose()
    }

    async fn update_payment(&self, payment: &Payment, expected: PaymentStatus) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        match payment_status_for_update(&mut tx, payment.id).await? {
            Some(current) if current == expected => {}
            Some(_) => return Ok(false),
            None => return Err(CoreError::not_found("payment", payment.id)),
        }
        update_payment_row(&mut tx, payment).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn list_refunds(&self, payment_id: Uuid) -> CoreResult<Vec<Refund>> {
        let rows: Vec<RefundRow> = sqlx::query_as(
            r#"
            SELECT id, payment_id, booking_id, amount, reason, gateway_refund_txn_id, status,
                   error_message, created_at, updated_at
            FROM refunds WHERE payment_id = $1 ORDER BY created_at
            "#,
        )
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|r| -> CoreResult<Refund> {
                Ok(Refund {
                    id: r.id,
                    payment_id: r.payment_id,
                    booking_id: r.booking_id,
                    amount: r.amount,
                    reason: r.reason,
                    gateway_refund_txn_id: r.gateway_refund_txn_id,
                    status: r.status.parse::<RefundStatus>()?,
                    error_message: r.error_message,
                    created_at: r.created_at,
                    updated_at: r.updated_at,
                })
            })
            .collect()
    }
}
