use async_trait::async_trait;
use cine_core::{CoreError, CoreResult, PartyResolver};
use tracing::info;
use uuid::Uuid;

use crate::pg_store::{db_err, PgStore};

#[async_trait]
impl PartyResolver for PgStore {
    async fn resolve_or_create_guest(&self, email: &str, full_name: &str, phone: Option<&str>) -> CoreResult<Uuid> {
        let email = email.trim().to_lowercase();

        // No-op update so RETURNING yields the existing row on conflict
        let (id, created): (Uuid, bool) = sqlx::query_as(
            r#"
            INSERT INTO users (id, email, full_name, phone, is_guest)
            VALUES ($1, $2, $3, $4, TRUE)
            ON CONFLICT (email) DO UPDATE SET email = EXCLUDED.email
            RETURNING id, (xmax = 0) AS created
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&email)
        .bind(full_name)
        .bind(phone)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        if created {
            info!("Created guest party {}", id);
        }
        Ok(id)
    }

    async fn loyalty_balance(&self, user_id: Uuid) -> CoreResult<i64> {
        let points: Option<i64> = sqlx::query_scalar("SELECT loyalty_points FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        points.ok_or_else(|| CoreError::not_found("user", user_id))
    }
}
