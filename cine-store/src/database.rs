use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

use crate::app_config::BusinessRules;

#[derive(Clone)]
pub struct DbClient {
    pub pool: Pool<Postgres>,
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    rule_key: String,
    rule_value: Value,
}

impl DbClient {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await?;
        info!("Migrations completed successfully.");
        Ok(())
    }

    /// Overlay rows of the `business_rules` table on top of the file config.
    pub async fn fetch_business_rules(&self, defaults: BusinessRules) -> Result<BusinessRules, sqlx::Error> {
        let rows: Vec<RuleRow> = sqlx::query_as("SELECT rule_key, rule_value FROM business_rules")
            .fetch_all(&self.pool)
            .await?;

        let mut rules = defaults;
        for row in rows {
            // Expected format: {"value": <number/string>}
            match row.rule_value.get("value") {
                Some(v) => apply_rule(&mut rules, &row.rule_key, v),
                None => warn!("Business rule {} has no value field", row.rule_key),
            }
        }

        Ok(rules)
    }
}

fn apply_rule(rules: &mut BusinessRules, key: &str, v: &Value) {
    match key {
        "max_seats_per_booking" => {
            if let Some(u) = v.as_u64() {
                rules.max_seats_per_booking = u as usize;
            }
        }
        "seat_lock_ttl_seconds" => {
            if let Some(u) = v.as_u64() {
                rules.seat_lock_ttl_seconds = u;
            }
        }
        "payment_timeout_minutes" => {
            if let Some(i) = v.as_i64() {
                rules.payment_timeout_minutes = i;
            }
        }
        "currency" => {
            if let Some(s) = v.as_str() {
                rules.currency = s.to_string();
            }
        }
        "loyalty_unit_amount" => {
            if let Some(f) = v.as_f64() {
                rules.loyalty_unit_amount = f;
            }
        }
        "loyalty_points_per_unit" => {
            if let Some(i) = v.as_i64() {
                rules.loyalty_points_per_unit = i;
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_overlay_ignores_unknown_and_mistyped() {
        let mut rules = BusinessRules::default();
        apply_rule(&mut rules, "max_seats_per_booking", &json!(4));
        apply_rule(&mut rules, "payment_timeout_minutes", &json!("soon"));
        apply_rule(&mut rules, "tax_rate", &json!(0.1));
        assert_eq!(rules.max_seats_per_booking, 4);
        assert_eq!(rules.payment_timeout_minutes, 15);
    }
}
