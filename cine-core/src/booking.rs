use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{CoreError, CoreResult};

/// Booking status in the lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    PendingPayment,
    Confirmed,
    Cancelled,
    Expired,
}

impl BookingStatus {
    /// `EXPIRED -> CONFIRMED` is the late-payment reinstatement path.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (PendingPayment, Confirmed)
                | (PendingPayment, Cancelled)
                | (PendingPayment, Expired)
                | (Confirmed, Cancelled)
                | (Expired, Confirmed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::PendingPayment => "PENDING_PAYMENT",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_PAYMENT" => Ok(BookingStatus::PendingPayment),
            "CONFIRMED" => Ok(BookingStatus::Confirmed),
            "CANCELLED" => Ok(BookingStatus::Cancelled),
            "EXPIRED" => Ok(BookingStatus::Expired),
            other => Err(CoreError::Storage(format!("unknown booking status {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookingSeatLine {
    pub showtime_seat_id: Uuid,
    pub ticket_type_id: Uuid,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookingSnackLine {
    pub snack_id: Uuid,
    pub name: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefundMetadata {
    pub refund_id: Uuid,
    pub amount: f64,
    pub reason: String,
    pub refunded_at: DateTime<Utc>,
}

/// The durable record of a reservation that has been priced and handed to payment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Booking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub showtime_id: Uuid,
    pub seats: Vec<BookingSeatLine>,
    pub snacks: Vec<BookingSnackLine>,
    pub promotion_code: Option<String>,
    pub subtotal: f64,
    pub discount_amount: f64,
    pub discount_reason: Option<String>,
    pub final_price: f64,
    pub status: BookingStatus,
    pub booked_at: DateTime<Utc>,
    pub payment_expires_at: DateTime<Utc>,
    pub qr_payload: Option<String>,
    /// Points this booking earns once confirmed
    pub loyalty_points: i64,
    pub loyalty_points_awarded: bool,
    pub refund: Option<RefundMetadata>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn seat_ids(&self) -> Vec<Uuid> {
        self.seats.iter().map(|s| s.showtime_seat_id).collect()
    }

    pub fn is_payment_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == BookingStatus::PendingPayment && now > self.payment_expires_at
    }

    /// Checked status change.
    pub fn transition(&mut self, next: BookingStatus, now: DateTime<Utc>) -> CoreResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                entity: "booking",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Move to `CONFIRMED` and issue the QR payload if this booking has none yet.
    pub fn confirm(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        self.transition(BookingStatus::Confirmed, now)?;
        self.issue_qr();
        Ok(())
    }

    /// Returns false when a payload already exists; it is never regenerated.
    pub fn issue_qr(&mut self) -> bool {
        if self.qr_payload.is_some() {
            return false;
        }
        let seats = self
            .seats
            .iter()
            .map(|s| s.showtime_seat_id.simple().to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.qr_payload = Some(format!(
            "CINE:{}:{}:{}",
            self.id.simple(),
            self.showtime_id.simple(),
            seats
        ));
        true
    }

    /// Points to credit now, or 0 if they were already credited.
    pub fn take_loyalty_award(&mut self) -> i64 {
        if self.loyalty_points_awarded {
            return 0;
        }
        self.loyalty_points_awarded = true;
        self.loyalty_points
    }

    /// Points to debit now, or 0 if nothing was credited.
    pub fn take_loyalty_revocation(&mut self) -> i64 {
        if !self.loyalty_points_awarded {
            return 0;
        }
        self.loyalty_points_awarded = false;
        self.loyalty_points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn booking() -> Booking {
        let now = Utc::now();
        Booking {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            showtime_id: Uuid::new_v4(),
            seats: vec![BookingSeatLine {
                showtime_seat_id: Uuid::new_v4(),
                ticket_type_id: Uuid::new_v4(),
                price: 120_000.0,
            }],
            snacks: vec![],
            promotion_code: None,
            subtotal: 120_000.0,
            discount_amount: 0.0,
            discount_reason: None,
            final_price: 120_000.0,
            status: BookingStatus::PendingPayment,
            booked_at: now,
            payment_expires_at: now + Duration::minutes(15),
            qr_payload: None,
            loyalty_points: 12,
            loyalty_points_awarded: false,
            refund: None,
            updated_at: now,
        }
    }

    #[test]
    fn test_confirm_issues_qr_once() {
        let mut b = booking();
        b.confirm(Utc::now()).unwrap();
        let qr = b.qr_payload.clone().unwrap();
        assert!(qr.starts_with("CINE:"));
        assert!(!b.issue_qr());
        assert_eq!(b.qr_payload.unwrap(), qr);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut b = booking();
        b.transition(BookingStatus::Cancelled, Utc::now()).unwrap();
        let err = b.transition(BookingStatus::Confirmed, Utc::now()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { entity: "booking", .. }));
    }

    #[test]
    fn test_expired_booking_can_be_reinstated() {
        let mut b = booking();
        b.transition(BookingStatus::Expired, Utc::now()).unwrap();
        assert!(b.confirm(Utc::now()).is_ok());
    }

    #[test]
    fn test_loyalty_award_is_one_shot() {
        let mut b = booking();
        assert_eq!(b.take_loyalty_award(), 12);
        assert_eq!(b.take_loyalty_award(), 0);
        assert_eq!(b.take_loyalty_revocation(), 12);
        assert_eq!(b.take_loyalty_revocation(), 0);
    }

    #[test]
    fn test_overdue_only_while_pending() {
        let mut b = booking();
        let later = b.payment_expires_at + Duration::seconds(1);
        assert!(b.is_payment_overdue(later));
        b.transition(BookingStatus::Confirmed, later).unwrap();
        assert!(!b.is_payment_overdue(later));
    }
}
