use chrono::NaiveDateTime;
use cine_pricing::PricingContext;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::CoreError;

/// Availability of one seat within one showtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatStatus {
    Available,
    Locked,
    Booked,
}

impl SeatStatus {
    /// `BOOKED -> LOCKED` is never allowed. `AVAILABLE -> BOOKED` only
    /// happens when a late payment re-claims seats that are still free.
    pub fn can_transition_to(&self, next: SeatStatus) -> bool {
        use SeatStatus::*;
        matches!(
            (self, next),
            (Available, Locked) | (Locked, Available) | (Locked, Booked) | (Booked, Available) | (Available, Booked)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SeatStatus::Available => "AVAILABLE",
            SeatStatus::Locked => "LOCKED",
            SeatStatus::Booked => "BOOKED",
        }
    }
}

impl fmt::Display for SeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeatStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(SeatStatus::Available),
            "LOCKED" => Ok(SeatStatus::Locked),
            "BOOKED" => Ok(SeatStatus::Booked),
            other => Err(CoreError::Storage(format!("unknown seat status {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Showtime {
    pub id: Uuid,
    pub movie_id: Uuid,
    pub room_id: Uuid,
    /// Local wall-clock start, used for day-type and time-range pricing
    pub start_time: NaiveDateTime,
    pub format: String,
    pub room_type: String,
}

impl Showtime {
    pub fn pricing_context(&self, seat: &ShowtimeSeat) -> PricingContext {
        PricingContext {
            start_time: self.start_time,
            format: self.format.clone(),
            room_type: self.room_type.clone(),
            seat_type: seat.seat_type.clone(),
        }
    }
}

/// A physical seat scoped to one showtime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShowtimeSeat {
    pub id: Uuid,
    pub showtime_id: Uuid,
    pub seat_id: Uuid,
    pub row_label: String,
    pub seat_number: i32,
    pub seat_type: String,
    pub status: SeatStatus,
}

impl ShowtimeSeat {
    pub fn label(&self) -> String {
        format!("{}{}", self.row_label, self.seat_number)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snack {
    pub id: Uuid,
    pub name: String,
    pub price: f64,
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seat_never_goes_booked_to_locked() {
        assert!(!SeatStatus::Booked.can_transition_to(SeatStatus::Locked));
        assert!(SeatStatus::Available.can_transition_to(SeatStatus::Locked));
        assert!(SeatStatus::Locked.can_transition_to(SeatStatus::Booked));
        assert!(SeatStatus::Booked.can_transition_to(SeatStatus::Available));
    }

    #[test]
    fn test_seat_status_parse() {
        assert_eq!("LOCKED".parse::<SeatStatus>().unwrap(), SeatStatus::Locked);
        assert!("HELD".parse::<SeatStatus>().is_err());
    }
}
