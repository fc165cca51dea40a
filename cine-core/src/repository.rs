use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cine_pricing::{MembershipTier, PricingSnapshot, Promotion, TicketType};
use uuid::Uuid;

use crate::booking::{Booking, BookingStatus};
use crate::catalog::{Showtime, ShowtimeSeat, Snack};
use crate::lock::{LockOwner, SeatLock, SeatLockLine};
use crate::payment::{Payment, PaymentMethod, PaymentStatus, Refund};
use crate::CoreResult;

/// Read access to the catalog owned by other services
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn get_showtime(&self, showtime_id: Uuid) -> CoreResult<Option<Showtime>>;

    async fn list_showtime_seats(&self, showtime_id: Uuid) -> CoreResult<Vec<ShowtimeSeat>>;

    /// Only the ids that resolve are returned.
    async fn get_showtime_seats(&self, showtime_id: Uuid, seat_ids: &[Uuid]) -> CoreResult<Vec<ShowtimeSeat>>;

    async fn get_ticket_type(&self, ticket_type_id: Uuid) -> CoreResult<Option<TicketType>>;

    async fn is_ticket_type_assignable(&self, showtime_id: Uuid, ticket_type_id: Uuid) -> CoreResult<bool>;

    async fn get_snack(&self, snack_id: Uuid) -> CoreResult<Option<Snack>>;
}

#[async_trait]
pub trait PricingRepository: Send + Sync {
    /// One consistent view of the active base price and modifiers.
    async fn load_snapshot(&self) -> CoreResult<PricingSnapshot>;

    async fn membership_tier_for(&self, user_id: Uuid) -> CoreResult<Option<MembershipTier>>;

    async fn find_promotion(&self, code: &str) -> CoreResult<Option<Promotion>>;
}

/// Durable side of seat locking. Every method is one atomic unit of work.
#[async_trait]
pub trait SeatLockRepository: Send + Sync {
    /// Write the lock and its lines and flip each seat `AVAILABLE -> LOCKED`.
    ///
    /// Seats are re-read under a row lock; any seat no longer available fails
    /// the whole write with `SeatLocked`.
    async fn insert_lock(&self, lock: &SeatLock, lines: &[SeatLockLine]) -> CoreResult<()>;

    async fn get_lock(&self, lock_id: Uuid) -> CoreResult<Option<(SeatLock, Vec<SeatLockLine>)>>;

    async fn find_locks_by_owner(&self, owner: &LockOwner) -> CoreResult<Vec<SeatLock>>;

    /// Delete the lock and return its seats to `AVAILABLE`.
    ///
    /// With `expired_before` set, the lock is only removed if it expired by
    /// then. `None` means nothing was deleted.
    async fn delete_lock(
        &self,
        lock_id: Uuid,
        expired_before: Option<DateTime<Utc>>,
    ) -> CoreResult<Option<Vec<SeatLockLine>>>;

    async fn list_expired_locks(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<SeatLock>>;
}

/// What happens to a booking's seats inside a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatEffect {
    Keep,
    /// `BOOKED -> AVAILABLE`
    Release,
    /// `AVAILABLE -> BOOKED` for every seat, or `SeatLocked` listing the taken ones
    Reclaim,
}

/// One atomic lifecycle step for a booking and (optionally) its payment.
///
/// The write only happens when the stored statuses still equal the expected
/// ones; otherwise `commit_transition` returns `false`.
#[derive(Debug, Clone)]
pub struct BookingTransition {
    pub booking: Booking,
    pub expected_booking_status: BookingStatus,
    pub payment: Option<Payment>,
    pub expected_payment_status: Option<PaymentStatus>,
    pub seat_effect: SeatEffect,
    pub loyalty_points_delta: i64,
    /// Inserted or updated by id
    pub refund: Option<Refund>,
}

impl BookingTransition {
    pub fn new(booking: Booking, expected_booking_status: BookingStatus) -> Self {
        Self {
            booking,
            expected_booking_status,
            payment: None,
            expected_payment_status: None,
            seat_effect: SeatEffect::Keep,
            loyalty_points_delta: 0,
            refund: None,
        }
    }

    pub fn with_payment(mut self, payment: Payment, expected: PaymentStatus) -> Self {
        self.payment = Some(payment);
        self.expected_payment_status = Some(expected);
        self
    }

    pub fn seats(mut self, effect: SeatEffect) -> Self {
        self.seat_effect = effect;
        self
    }

    pub fn loyalty(mut self, delta: i64) -> Self {
        self.loyalty_points_delta = delta;
        self
    }

    pub fn with_refund(mut self, refund: Refund) -> Self {
        self.refund = Some(refund);
        self
    }
}

#[async_trait]
pub trait BookingRepository: Send + Sync {
    /// Convert a lock into a booking: seats `LOCKED -> BOOKED`, lock deleted,
    /// booking, lines and the optional first payment inserted. Fails with
    /// `LockExpired` when the lock is gone or past its expiry at `now`.
    async fn insert_booking_from_lock(
        &self,
        lock_id: Uuid,
        now: DateTime<Utc>,
        booking: &Booking,
        payment: Option<&Payment>,
    ) -> CoreResult<()>;

    async fn get_booking(&self, booking_id: Uuid) -> CoreResult<Option<Booking>>;

    /// `PENDING_PAYMENT` bookings whose payment deadline has passed.
    async fn list_overdue_bookings(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>>;

    async fn commit_transition(&self, transition: &BookingTransition) -> CoreResult<bool>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Fails with `DomainConflict` if the booking already has an open payment.
    async fn insert_payment(&self, payment: &Payment) -> CoreResult<()>;

    async fn get_payment(&self, payment_id: Uuid) -> CoreResult<Option<Payment>>;

    async fn find_payment_by_gateway_order(
        &self,
        method: PaymentMethod,
        gateway_order_id: &str,
    ) -> CoreResult<Option<Payment>>;

    async fn find_open_payment(&self, booking_id: Uuid) -> CoreResult<Option<Payment>>;

    /// Guarded update; `false` if the stored status moved on.
    async fn update_payment(&self, payment: &Payment, expected: PaymentStatus) -> CoreResult<bool>;

    async fn list_refunds(&self, payment_id: Uuid) -> CoreResult<Vec<Refund>>;
}

/// Resolves the paying party for a booking
#[async_trait]
pub trait PartyResolver: Send + Sync {
    /// Idempotent by email.
    async fn resolve_or_create_guest(&self, email: &str, full_name: &str, phone: Option<&str>) -> CoreResult<Uuid>;

    async fn loyalty_balance(&self, user_id: Uuid) -> CoreResult<i64>;
}

/// Everything the booking services need from persistence
pub trait Store:
    CatalogRepository + PricingRepository + SeatLockRepository + BookingRepository + PaymentRepository + PartyResolver
{
}

impl<T> Store for T where
    T: CatalogRepository + PricingRepository + SeatLockRepository + BookingRepository + PaymentRepository + PartyResolver
{
}
