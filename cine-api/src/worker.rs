use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use cine_booking::{BookingOrchestrator, SeatLockManager};
use crate::metrics::Metrics;

/// Reclaims seats from locks whose TTL passed without a booking.
pub async fn start_lock_sweeper(seat_locks: Arc<SeatLockManager>, metrics: Arc<Metrics>, every: Duration) {
    info!("Lock expiry sweeper started, every {:?}", every);
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match seat_locks.sweep_expired_locks().await {
            Ok(0) => {}
            Ok(n) => {
                info!("Released {} expired seat locks", n);
                metrics.sweeps.with_label_values(&["locks"]).inc_by(n as u64);
            }
            Err(e) => error!("Lock expiry sweep failed: {}", e),
        }
    }
}

/// Expires bookings whose payment window closed.
pub async fn start_payment_sweeper(orchestrator: Arc<BookingOrchestrator>, metrics: Arc<Metrics>, every: Duration) {
    info!("Payment timeout sweeper started, every {:?}", every);
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match orchestrator.sweep_overdue_bookings().await {
            Ok(0) => {}
            Ok(n) => {
                info!("Expired {} unpaid bookings", n);
                metrics.sweeps.with_label_values(&["payments"]).inc_by(n as u64);
            }
            Err(e) => error!("Payment timeout sweep failed: {}", e),
        }
    }
}
