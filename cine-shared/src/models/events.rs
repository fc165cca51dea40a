use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Seat-map changes pushed to clients watching a showtime.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BookingEvent {
    SeatsLocked {
        showtime_id: Uuid,
        seat_ids: Vec<Uuid>,
        expires_at: DateTime<Utc>,
    },
    SeatsReleased {
        showtime_id: Uuid,
        seat_ids: Vec<Uuid>,
    },
    SeatsBooked {
        showtime_id: Uuid,
        booking_id: Uuid,
        seat_ids: Vec<Uuid>,
    },
    BookingConfirmed {
        showtime_id: Uuid,
        booking_id: Uuid,
        final_price: f64,
        timestamp: i64,
    },
    RefundIssued {
        booking_id: Uuid,
        payment_id: Uuid,
        amount: f64,
        timestamp: i64,
    },
}

impl BookingEvent {
    /// The showtime whose seat map this event touches, if any.
    pub fn showtime_id(&self) -> Option<Uuid> {
        match self {
            BookingEvent::SeatsLocked { showtime_id, .. }
            | BookingEvent::SeatsReleased { showtime_id, .. }
            | BookingEvent::SeatsBooked { showtime_id, .. }
            | BookingEvent::BookingConfirmed { showtime_id, .. } => Some(*showtime_id),
            BookingEvent::RefundIssued { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BookingEvent::SeatsLocked { .. } => "seats_locked",
            BookingEvent::SeatsReleased { .. } => "seats_released",
            BookingEvent::SeatsBooked { .. } => "seats_booked",
            BookingEvent::BookingConfirmed { .. } => "booking_confirmed",
            BookingEvent::RefundIssued { .. } => "refund_issued",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let event = BookingEvent::SeatsReleased {
            showtime_id: Uuid::nil(),
            seat_ids: vec![],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "seats_released");
        assert_eq!(event.showtime_id(), Some(Uuid::nil()));
        assert_eq!(event.name(), "seats_released");
    }
}
