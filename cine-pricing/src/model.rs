use chrono::{DateTime, Datelike, NaiveDateTime, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::PricingError;

/// How a modifier, ticket type or discount changes a price
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModifierKind {
    Percentage,
    FixedAmount,
}

impl ModifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModifierKind::Percentage => "PERCENTAGE",
            ModifierKind::FixedAmount => "FIXED_AMOUNT",
        }
    }
}

impl FromStr for ModifierKind {
    type Err = PricingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PERCENTAGE" => Ok(ModifierKind::Percentage),
            "FIXED_AMOUNT" => Ok(ModifierKind::FixedAmount),
            other => Err(PricingError::UnknownModifierKind(other.to_string())),
        }
    }
}

/// A kind/value pair. `Percentage` multiplies by `1 + value/100`, `FixedAmount` adds `value`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Adjustment {
    pub kind: ModifierKind,
    pub value: f64,
}

impl Adjustment {
    pub fn percentage(value: f64) -> Self {
        Self { kind: ModifierKind::Percentage, value }
    }

    pub fn fixed(value: f64) -> Self {
        Self { kind: ModifierKind::FixedAmount, value }
    }

    /// Signed change this adjustment makes to `price`.
    pub fn delta(&self, price: f64) -> f64 {
        match self.kind {
            ModifierKind::Percentage => price * self.value / 100.0,
            ModifierKind::FixedAmount => self.value,
        }
    }

    pub fn apply(&self, price: f64) -> f64 {
        price + self.delta(price)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DayType {
    Weekday,
    Weekend,
}

impl DayType {
    /// Saturday and Sunday (ISO weekdays 6 and 7) are the weekend.
    pub fn of(start: &NaiveDateTime) -> Self {
        match start.weekday() {
            Weekday::Sat | Weekday::Sun => DayType::Weekend,
            _ => DayType::Weekday,
        }
    }
}

/// Local clock-time buckets. Night wraps past midnight.
///
/// | slot      | from  | until |
/// |-----------|-------|-------|
/// | MORNING   | 06:00 | 12:00 |
/// | AFTERNOON | 12:00 | 17:00 |
/// | EVENING   | 17:00 | 22:00 |
/// | NIGHT     | 22:00 | 06:00 |
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeSlot {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeSlot {
    pub fn of(time: NaiveTime) -> Self {
        match time.hour() {
            6..=11 => TimeSlot::Morning,
            12..=16 => TimeSlot::Afternoon,
            17..=21 => TimeSlot::Evening,
            _ => TimeSlot::Night,
        }
    }
}

/// The condition a price modifier is gated on
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "condition_type", content = "condition_value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModifierCondition {
    DayType(DayType),
    TimeRange(TimeSlot),
    /// Case-insensitive substring of the showtime format ("IMAX" matches "IMAX 3D")
    Format(String),
    RoomType(String),
    SeatType(String),
}

impl ModifierCondition {
    pub fn matches(&self, ctx: &PricingContext) -> bool {
        match self {
            ModifierCondition::DayType(day) => DayType::of(&ctx.start_time) == *day,
            ModifierCondition::TimeRange(slot) => TimeSlot::of(ctx.start_time.time()) == *slot,
            ModifierCondition::Format(fragment) => ctx
                .format
                .to_lowercase()
                .contains(&fragment.to_lowercase()),
            ModifierCondition::RoomType(room_type) => ctx.room_type == *room_type,
            ModifierCondition::SeatType(seat_type) => ctx.seat_type == *seat_type,
        }
    }

    /// Storage form: (`condition_type`, `condition_value`).
    pub fn parts(&self) -> (&'static str, String) {
        match self {
            ModifierCondition::DayType(DayType::Weekday) => ("DAY_TYPE", "WEEKDAY".into()),
            ModifierCondition::DayType(DayType::Weekend) => ("DAY_TYPE", "WEEKEND".into()),
            ModifierCondition::TimeRange(slot) => ("TIME_RANGE", slot.to_string()),
            ModifierCondition::Format(v) => ("FORMAT", v.clone()),
            ModifierCondition::RoomType(v) => ("ROOM_TYPE", v.clone()),
            ModifierCondition::SeatType(v) => ("SEAT_TYPE", v.clone()),
        }
    }

    pub fn from_parts(condition_type: &str, condition_value: &str) -> Result<Self, PricingError> {
        let unknown = || PricingError::UnknownCondition(format!("{}={}", condition_type, condition_value));
        match condition_type {
            "DAY_TYPE" => match condition_value {
                "WEEKDAY" => Ok(ModifierCondition::DayType(DayType::Weekday)),
                "WEEKEND" => Ok(ModifierCondition::DayType(DayType::Weekend)),
                _ => Err(unknown()),
            },
            "TIME_RANGE" => match condition_value {
                "MORNING" => Ok(ModifierCondition::TimeRange(TimeSlot::Morning)),
                "AFTERNOON" => Ok(ModifierCondition::TimeRange(TimeSlot::Afternoon)),
                "EVENING" => Ok(ModifierCondition::TimeRange(TimeSlot::Evening)),
                "NIGHT" => Ok(ModifierCondition::TimeRange(TimeSlot::Night)),
                _ => Err(unknown()),
            },
            "FORMAT" => Ok(ModifierCondition::Format(condition_value.to_string())),
            "ROOM_TYPE" => Ok(ModifierCondition::RoomType(condition_value.to_string())),
            "SEAT_TYPE" => Ok(ModifierCondition::SeatType(condition_value.to_string())),
            _ => Err(unknown()),
        }
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeSlot::Morning => "MORNING",
            TimeSlot::Afternoon => "AFTERNOON",
            TimeSlot::Evening => "EVENING",
            TimeSlot::Night => "NIGHT",
        };
        f.write_str(s)
    }
}

/// Everything about a showtime seat that modifiers can be conditioned on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingContext {
    /// Local wall-clock start of the showtime
    pub start_time: NaiveDateTime,
    pub format: String,
    pub room_type: String,
    pub seat_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BasePrice {
    pub id: Uuid,
    pub price: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceModifier {
    pub id: Uuid,
    pub name: String,
    pub condition: ModifierCondition,
    pub adjustment: Adjustment,
    /// Lower runs first
    pub priority: i32,
    pub is_active: bool,
}

/// One consistent read of the pricing configuration.
///
/// `modifiers` holds the active modifiers in application order
/// (priority ascending, then creation order).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PricingSnapshot {
    pub version: i64,
    pub base_price: Option<BasePrice>,
    pub modifiers: Vec<PriceModifier>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TicketType {
    pub id: Uuid,
    pub name: String,
    pub adjustment: Adjustment,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MembershipTier {
    pub id: Uuid,
    pub name: String,
    pub discount: Adjustment,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Promotion {
    pub id: Uuid,
    pub code: String,
    pub discount: Adjustment,
    pub min_order_amount: Option<f64>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl Promotion {
    pub fn check_redeemable(&self, subtotal: f64, now: DateTime<Utc>) -> Result<(), PricingError> {
        let reject = |reason: &str| PricingError::PromotionNotRedeemable {
            code: self.code.clone(),
            reason: reason.to_string(),
        };

        if !self.is_active {
            return Err(reject("inactive"));
        }
        if self.starts_at.map_or(false, |start| now < start) {
            return Err(reject("not started"));
        }
        if self.ends_at.map_or(false, |end| now > end) {
            return Err(reject("expired"));
        }
        if let Some(min) = self.min_order_amount {
            if subtotal < min {
                return Err(reject(&format!("order below minimum of {}", min)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, min, 0).unwrap()
    }

    #[test]
    fn test_day_type_uses_iso_weekday() {
        // 2024-06-15 is a Saturday
        assert_eq!(DayType::of(&at(2024, 6, 15, 10, 0)), DayType::Weekend);
        assert_eq!(DayType::of(&at(2024, 6, 16, 10, 0)), DayType::Weekend);
        assert_eq!(DayType::of(&at(2024, 6, 17, 10, 0)), DayType::Weekday);
    }

    #[test]
    fn test_time_slot_boundaries() {
        assert_eq!(TimeSlot::of(NaiveTime::from_hms_opt(5, 59, 0).unwrap()), TimeSlot::Night);
        assert_eq!(TimeSlot::of(NaiveTime::from_hms_opt(6, 0, 0).unwrap()), TimeSlot::Morning);
        assert_eq!(TimeSlot::of(NaiveTime::from_hms_opt(12, 0, 0).unwrap()), TimeSlot::Afternoon);
        assert_eq!(TimeSlot::of(NaiveTime::from_hms_opt(17, 0, 0).unwrap()), TimeSlot::Evening);
        assert_eq!(TimeSlot::of(NaiveTime::from_hms_opt(22, 0, 0).unwrap()), TimeSlot::Night);
        assert_eq!(TimeSlot::of(NaiveTime::from_hms_opt(0, 30, 0).unwrap()), TimeSlot::Night);
    }

    #[test]
    fn test_condition_parts_round_trip() {
        let cond = ModifierCondition::TimeRange(TimeSlot::Evening);
        let (kind, value) = cond.parts();
        assert_eq!(ModifierCondition::from_parts(kind, &value).unwrap(), cond);
        assert!(ModifierCondition::from_parts("MOON_PHASE", "FULL").is_err());
    }

    #[test]
    fn test_format_condition_is_substring_match() {
        let ctx = PricingContext {
            start_time: at(2024, 6, 17, 10, 0),
            format: "IMAX 3D".into(),
            room_type: "IMAX".into(),
            seat_type: "VIP".into(),
        };
        assert!(ModifierCondition::Format("3d".into()).matches(&ctx));
        assert!(!ModifierCondition::Format("4DX".into()).matches(&ctx));
        assert!(ModifierCondition::SeatType("VIP".into()).matches(&ctx));
        assert!(!ModifierCondition::RoomType("STANDARD".into()).matches(&ctx));
    }

    #[test]
    fn test_promotion_window() {
        let now = Utc::now();
        let promo = Promotion {
            id: Uuid::new_v4(),
            code: "SUMMER".into(),
            discount: Adjustment::percentage(10.0),
            min_order_amount: Some(100_000.0),
            starts_at: Some(now - chrono::Duration::days(1)),
            ends_at: Some(now + chrono::Duration::days(1)),
            is_active: true,
        };
        assert!(promo.check_redeemable(150_000.0, now).is_ok());
        assert!(promo.check_redeemable(50_000.0, now).is_err());
        assert!(promo.check_redeemable(150_000.0, now + chrono::Duration::days(2)).is_err());
    }
}
