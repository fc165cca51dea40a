use serde::{Deserialize, Serialize};

use crate::model::{Adjustment, MembershipTier, ModifierKind, Promotion};
use crate::round_to;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DiscountResult {
    pub membership_discount: f64,
    pub promotion_discount: f64,
    pub total_discount: f64,
    /// Receipt line, e.g. "Gold member -10% + Promotion SUMMER -20000"
    pub reason: Option<String>,
    pub promotion_code: Option<String>,
}

fn discount_amount(adjustment: &Adjustment, subtotal: f64) -> f64 {
    let amount = match adjustment.kind {
        ModifierKind::Percentage => subtotal * adjustment.value.clamp(0.0, 100.0) / 100.0,
        ModifierKind::FixedAmount => adjustment.value.max(0.0),
    };
    amount.min(subtotal)
}

fn describe(adjustment: &Adjustment) -> String {
    match adjustment.kind {
        ModifierKind::Percentage => format!("-{}%", adjustment.value),
        ModifierKind::FixedAmount => format!("-{}", adjustment.value),
    }
}

/// At most one membership discount plus at most one promotion, both taken
/// against the same subtotal. The combined discount never exceeds the subtotal.
///
/// Promotion eligibility (guest, window, minimum) is the caller's job; pass
/// `None` when it does not apply.
pub fn calculate_discounts(
    subtotal: f64,
    tier: Option<&MembershipTier>,
    promotion: Option<&Promotion>,
) -> DiscountResult {
    let mut reasons = Vec::new();

    let membership_discount = tier
        .map(|t| {
            let amount = discount_amount(&t.discount, subtotal);
            if amount > 0.0 {
                reasons.push(format!("{} member {}", t.name, describe(&t.discount)));
            }
            amount
        })
        .unwrap_or(0.0);

    let promotion_discount = promotion
        .map(|p| {
            let amount = discount_amount(&p.discount, subtotal);
            if amount > 0.0 {
                reasons.push(format!("Promotion {} {}", p.code, describe(&p.discount)));
            }
            amount
        })
        .unwrap_or(0.0);

    let total = (membership_discount + promotion_discount).min(subtotal);

    DiscountResult {
        membership_discount: round_to(membership_discount, 2),
        promotion_discount: round_to(promotion_discount, 2),
        total_discount: round_to(total, 2),
        reason: if reasons.is_empty() { None } else { Some(reasons.join(" + ")) },
        promotion_code: promotion.map(|p| p.code.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn tier(discount: Adjustment) -> MembershipTier {
        MembershipTier { id: Uuid::new_v4(), name: "Gold".into(), discount }
    }

    fn promo(code: &str, discount: Adjustment) -> Promotion {
        Promotion {
            id: Uuid::new_v4(),
            code: code.into(),
            discount,
            min_order_amount: None,
            starts_at: None,
            ends_at: None,
            is_active: true,
        }
    }

    #[test]
    fn test_no_discounts() {
        let result = calculate_discounts(200_000.0, None, None);
        assert_eq!(result.total_discount, 0.0);
        assert!(result.reason.is_none());
    }

    #[test]
    fn test_membership_and_promotion_stack() {
        let t = tier(Adjustment::percentage(10.0));
        let p = promo("SUMMER", Adjustment::fixed(20_000.0));
        let result = calculate_discounts(200_000.0, Some(&t), Some(&p));

        assert_eq!(result.membership_discount, 20_000.0);
        assert_eq!(result.promotion_discount, 20_000.0);
        assert_eq!(result.total_discount, 40_000.0);
        assert_eq!(result.promotion_code.as_deref(), Some("SUMMER"));
        let reason = result.reason.unwrap();
        assert!(reason.contains("Gold member -10%"));
        assert!(reason.contains("Promotion SUMMER -20000"));
    }

    #[test]
    fn test_fixed_amounts_capped_at_subtotal() {
        let t = tier(Adjustment::fixed(500_000.0));
        let p = promo("BIG", Adjustment::percentage(50.0));
        let result = calculate_discounts(100_000.0, Some(&t), Some(&p));

        assert_eq!(result.membership_discount, 100_000.0);
        assert_eq!(result.total_discount, 100_000.0);
    }
}
