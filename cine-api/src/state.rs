use std::sync::Arc;
use cine_booking::{BookingContext, BookingOrchestrator, SeatLockManager, SettlementService};
use cine_store::app_config::RateLimitConfig;
use cine_store::RedisClient;

use crate::metrics::Metrics;
use crate::middleware::resiliency::ResiliencyState;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub expiration: u64,
}

#[derive(Clone)]
pub struct AppState {
    pub ctx: BookingContext,
    pub seat_locks: Arc<SeatLockManager>,
    pub orchestrator: Arc<BookingOrchestrator>,
    pub settlement: Arc<SettlementService>,
    /// `None` disables rate limiting (tests, local runs without Redis)
    pub redis: Option<Arc<RedisClient>>,
    pub rate_limit: RateLimitConfig,
    pub auth: AuthConfig,
    pub resiliency: Arc<ResiliencyState>,
    pub metrics: Arc<Metrics>,
}
