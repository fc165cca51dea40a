use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cine_core::{CoreResult, PricingRepository};
use cine_pricing::{
    Adjustment, BasePrice, MembershipTier, ModifierCondition, ModifierKind, PriceModifier, PricingSnapshot, Promotion,
};
use uuid::Uuid;

use crate::pg_store::{db_err, PgStore};

#[derive(sqlx::FromRow)]
struct BasePriceRow {
    id: Uuid,
    price: f64,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ModifierRow {
    id: Uuid,
    name: String,
    condition_type: String,
    condition_value: String,
    modifier_type: String,
    modifier_value: f64,
    priority: i32,
    is_active: bool,
}

#[derive(sqlx::FromRow)]
struct TierRow {
    id: Uuid,
    name: String,
    discount_type: String,
    discount_value: f64,
}

#[derive(sqlx::FromRow)]
struct PromotionRow {
    id: Uuid,
    code: String,
    discount_type: String,
    discount_value: f64,
    min_order_amount: Option<f64>,
    starts_at: Option<DateTime<Utc>>,
    ends_at: Option<DateTime<Utc>>,
    is_active: bool,
}

fn adjustment(kind: &str, value: f64) -> CoreResult<Adjustment> {
    Ok(Adjustment { kind: kind.parse::<ModifierKind>()?, value })
}

#[async_trait]
impl PricingRepository for PgStore {
    async fn load_snapshot(&self) -> CoreResult<PricingSnapshot> {
        // One snapshot for version, base price and modifiers
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let version: i64 = sqlx::query_scalar("SELECT version FROM pricing_config WHERE id = 1")
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .unwrap_or(0);

        let base: Option<BasePriceRow> = sqlx::query_as(
            "SELECT id, price, created_at FROM base_prices WHERE is_active ORDER BY created_at DESC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let rows: Vec<ModifierRow> = sqlx::query_as(
            r#"
            SELECT id, name, condition_type, condition_value, modifier_type, modifier_value, priority, is_active
            FROM price_modifiers
            WHERE is_active
            ORDER BY priority ASC, created_at ASC, id ASC
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        let modifiers = rows
            .into_iter()
            .map(|r| -> CoreResult<PriceModifier> {
                Ok(PriceModifier {
                    id: r.id,
                    name: r.name,
                    condition: ModifierCondition::from_parts(&r.condition_type, &r.condition_value)?,
                    adjustment: adjustment(&r.modifier_type, r.modifier_value)?,
                    priority: r.priority,
                    is_active: r.is_active,
                })
            })
            .collect::<CoreResult<Vec<_>>>()?;

        Ok(PricingSnapshot {
            version,
            base_price: base.map(|b| BasePrice { id: b.id, price: b.price, created_at: b.created_at }),
            modifiers,
        })
    }

    async fn membership_tier_for(&self, user_id: Uuid) -> CoreResult<Option<MembershipTier>> {
        let row: Option<TierRow> = sqlx::query_as(
            r#"
            SELECT mt.id, mt.name, mt.discount_type, mt.discount_value
            FROM users u
            JOIN membership_tiers mt ON mt.id = u.membership_tier_id
            WHERE u.id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(r) => Ok(Some(MembershipTier {
                id: r.id,
                name: r.name,
                discount: adjustment(&r.discount_type, r.discount_value)?,
            })),
            None => Ok(None),
        }
    }

    async fn find_promotion(&self, code: &str) -> CoreResult<Option<Promotion>> {
        let row: Option<PromotionRow> = sqlx::query_as(
            r#"
            SELECT id, code, discount_type, discount_value, min_order_amount, starts_at, ends_at, is_active
            FROM promotions WHERE UPPER(code) = UPPER($1)
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(r) => Ok(Some(Promotion {
                id: r.id,
                code: r.code,
                discount: adjustment(&r.discount_type, r.discount_value)?,
                min_order_amount: r.min_order_amount,
                starts_at: r.starts_at,
                ends_at: r.ends_at,
                is_active: r.is_active,
            })),
            None => Ok(None),
        }
    }
}
