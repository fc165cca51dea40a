pub mod context;
pub mod gateways;
pub mod locking;
pub mod mutex;
pub mod orchestrator;
pub mod settlement;

pub use context::BookingContext;
pub use gateways::{GatewayRegistry, MockGateway, MomoGateway, VnpayGateway};
pub use locking::{Availability, LockResult, LockedSeat, OwnedLock, SeatLockManager, SeatSelection};
pub use mutex::KeyedMutex;
pub use orchestrator::{
    BookingOrchestrator, ConfirmRequest, Payer, PricePreview, PricedSeat, SettlementOutcome, SnackSelection,
};
pub use settlement::{CaptureSummary, CheckoutResult, PaymentOrder, RefundSummary, SettlementService};
