use axum::{extract::State, http::header, response::IntoResponse};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::AppError;
use crate::state::AppState;

/// Booking-flow counters exported at `/v1/metrics`.
pub struct Metrics {
    registry: Registry,
    pub seat_locks: IntCounterVec,
    pub bookings: IntCounterVec,
    pub webhooks: IntCounterVec,
    pub sweeps: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let seat_locks = IntCounterVec::new(
            Opts::new("cine_seat_lock_requests_total", "Seat lock attempts by outcome"),
            &["outcome"],
        )?;
        let bookings = IntCounterVec::new(
            Opts::new("cine_booking_requests_total", "Booking confirmations by outcome"),
            &["outcome"],
        )?;
        let webhooks = IntCounterVec::new(
            Opts::new("cine_payment_webhooks_total", "Gateway notifications received"),
            &["gateway"],
        )?;
        let sweeps = IntCounterVec::new(
            Opts::new("cine_sweep_items_total", "Rows reclaimed by the scheduled sweeps"),
            &["sweep"],
        )?;

        registry.register(Box::new(seat_locks.clone()))?;
        registry.register(Box::new(bookings.clone()))?;
        registry.register(Box::new(webhooks.clone()))?;
        registry.register(Box::new(sweeps.clone()))?;

        Ok(Self { registry, seat_locks, bookings, webhooks, sweeps })
    }

    pub fn outcome<T, E>(counter: &IntCounterVec, result: &Result<T, E>) {
        let label = if result.is_ok() { "ok" } else { "error" };
        counter.with_label_values(&[label]).inc();
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub async fn metrics_handler(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let body = state
        .metrics
        .render()
        .map_err(|e| AppError::InternalServerError(format!("metrics encoding failed: {}", e)))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
