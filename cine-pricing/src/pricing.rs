use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ModifierKind, PricingContext, PricingSnapshot, TicketType};
use crate::{round_to, PricingError};

/// Rounding policy for the two pricing stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Decimal places kept on a seat's base price after modifiers
    pub base_price_decimals: u32,

    /// Decimal places kept after the ticket-type modifier (whole currency units)
    pub ticket_price_decimals: u32,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            base_price_decimals: 2,
            ticket_price_decimals: 0,
        }
    }
}

/// One modifier's contribution to a seat price
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppliedModifier {
    pub modifier_id: Uuid,
    pub name: String,
    pub condition_type: String,
    pub condition_value: String,
    pub kind: ModifierKind,
    pub value: f64,
    pub delta: f64,
}

/// Audit trail of a base-price calculation.
///
/// `base_price + Σ modifiers[i].delta == unrounded_price`; `final_price` is that
/// sum rounded to the configured precision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceBreakdown {
    pub snapshot_version: i64,
    pub base_price: f64,
    pub modifiers: Vec<AppliedModifier>,
    pub unrounded_price: f64,
    pub final_price: f64,
}

/// Seat pricing engine.
///
/// Pure over a [`PricingSnapshot`]: callers read one snapshot per request and
/// price every seat against it.
#[derive(Debug, Clone)]
pub struct PricingEngine {
    config: PricingConfig,
}

impl PricingEngine {
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }

    /// Price a seat from the active base price and every matching modifier.
    ///
    /// Modifiers are applied in snapshot order; percentages compound on the
    /// running price so the order matters.
    pub fn calculate_base_price(
        &self,
        snapshot: &PricingSnapshot,
        ctx: &PricingContext,
    ) -> Result<PriceBreakdown, PricingError> {
        let base = snapshot
            .base_price
            .as_ref()
            .ok_or(PricingError::NoActiveBasePrice)?;

        let mut price = base.price;
        let mut applied = Vec::new();

        for modifier in snapshot.modifiers.iter().filter(|m| m.is_active) {
            if !modifier.condition.matches(ctx) {
                continue;
            }

            let delta = modifier.adjustment.delta(price);
            price += delta;

            let (condition_type, condition_value) = modifier.condition.parts();
            applied.push(AppliedModifier {
                modifier_id: modifier.id,
                name: modifier.name.clone(),
                condition_type: condition_type.to_string(),
                condition_value,
                kind: modifier.adjustment.kind,
                value: modifier.adjustment.value,
                delta,
            });
        }

        Ok(PriceBreakdown {
            snapshot_version: snapshot.version,
            base_price: base.price,
            modifiers: applied,
            unrounded_price: price,
            final_price: round_to(price, self.config.base_price_decimals),
        })
    }

    /// Apply a ticket type (adult, student, ...) on top of a seat's base price.
    /// Never goes below zero.
    pub fn apply_ticket_type_modifier(&self, base_price: f64, ticket_type: &TicketType) -> f64 {
        let price = ticket_type.adjustment.apply(base_price).max(0.0);
        round_to(price, self.config.ticket_price_decimals)
    }

    /// Base price, then ticket type, in one call.
    pub fn price_seat(
        &self,
        snapshot: &PricingSnapshot,
        ctx: &PricingContext,
        ticket_type: &TicketType,
    ) -> Result<(f64, PriceBreakdown), PricingError> {
        let breakdown = self.calculate_base_price(snapshot, ctx)?;
        let price = self.apply_ticket_type_modifier(breakdown.final_price, ticket_type);
        Ok((price, breakdown))
    }
}

impl Default for PricingEngine {
    fn default() -> Self {
        Self::new(PricingConfig::default())
    }
}
