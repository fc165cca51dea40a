pub mod discount;
pub mod model;
pub mod pricing;

pub use discount::{calculate_discounts, DiscountResult};
pub use model::{
    Adjustment, BasePrice, DayType, MembershipTier, ModifierCondition, ModifierKind,
    PriceModifier, PricingContext, PricingSnapshot, Promotion, TicketType, TimeSlot,
};
pub use pricing::{AppliedModifier, PriceBreakdown, PricingConfig, PricingEngine};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PricingError {
    #[error("No active base price is configured")]
    NoActiveBasePrice,

    #[error("Unknown modifier condition: {0}")]
    UnknownCondition(String),

    #[error("Unknown modifier kind: {0}")]
    UnknownModifierKind(String),

    #[error("Promotion {code} cannot be redeemed: {reason}")]
    PromotionNotRedeemable { code: String, reason: String },
}

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}
