pub mod booking;
pub mod catalog;
pub mod clock;
pub mod lock;
pub mod payment;
pub mod repository;

use uuid::Uuid;

pub use booking::{Booking, BookingSeatLine, BookingSnackLine, BookingStatus, RefundMetadata};
pub use catalog::{SeatStatus, Showtime, ShowtimeSeat, Snack};
pub use clock::{Clock, SystemClock};
pub use lock::{seat_key, LockOwner, LockStore, OwnerKind, SeatLock, SeatLockLine};
pub use payment::{
    CaptureResult, GatewayOrder, GatewayOutcome, GatewayQuote, OrderRequest, Payment, PaymentGateway, PaymentMethod,
    PaymentStatus, Refund, RefundStatus, VerifiedEvent, WebhookPayload, WebhookResult,
};
pub use repository::{
    BookingRepository, BookingTransition, CatalogRepository, PartyResolver, PaymentRepository, PricingRepository,
    SeatEffect, SeatLockRepository, Store,
};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Seats are not available: {seat_ids:?}")]
    SeatLocked { seat_ids: Vec<Uuid> },

    #[error("Seat lock {0} has expired")]
    LockExpired(Uuid),

    #[error("Requested {requested} seats but at most {max} are allowed per booking")]
    MaxSeatsExceeded { requested: usize, max: usize },

    #[error("Gateway reported {actual} but {expected} was expected")]
    GatewayAmountMismatch { expected: f64, actual: f64 },

    #[error("Invalid webhook signature: {0}")]
    InvalidWebhookSignature(String),

    #[error("Conflict: {0}")]
    DomainConflict(String),

    #[error("Validation failed: {0}")]
    ValidationError(String),

    #[error("Invalid {entity} transition {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error(transparent)]
    Pricing(#[from] cine_pricing::PricingError),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Lock store error: {0}")]
    LockStore(String),

    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl CoreError {
    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        CoreError::ResourceNotFound(format!("{} {}", what, id))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
