use axum::{
    extract::{Path, State},
    http::{Extensions, StatusCode},
    middleware::from_fn_with_state,
    routing::{get, post},
    Extension, Json, Router,
};
use cine_booking::{CheckoutResult, ConfirmRequest, Payer, PricePreview, SnackSelection};
use cine_core::{Booking, PaymentMethod};
use serde::Deserialize;
use uuid::Uuid;

use crate::client_ip;
use crate::error::AppError;
use crate::metrics::Metrics;
use crate::middleware::auth::{customer_auth_middleware, ensure_booking_access, Caller};
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct GuestDetails {
    pub email: String,
    pub full_name: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BookingRequest {
    pub lock_id: Uuid,
    #[serde(default)]
    pub promotion_code: Option<String>,
    #[serde(default)]
    pub snacks: Vec<SnackSelection>,
    /// Required when the caller is a guest session
    #[serde(default)]
    pub guest: Option<GuestDetails>,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    #[serde(flatten)]
    pub booking: BookingRequest,
    pub payment_method: String,
}

impl BookingRequest {
    /// `strict` demands guest contact details; a preview can do without.
    fn into_confirm(self, caller: &Caller, strict: bool) -> Result<ConfirmRequest, AppError> {
        let payer = match (caller.user_id(), self.guest) {
            (Some(user_id), _) => Payer::User(user_id),
            (None, Some(guest)) => Payer::Guest {
                email: guest.email,
                full_name: guest.full_name,
                phone: guest.phone,
            },
            (None, None) if !strict => Payer::Guest {
                email: String::new(),
                full_name: String::new(),
                phone: None,
            },
            (None, None) => {
                return Err(AppError::ValidationError("Guest checkout requires contact details".to_string()))
            }
        };

        Ok(ConfirmRequest {
            lock_id: self.lock_id,
            owner: caller.owner(),
            payer,
            promotion_code: self.promotion_code,
            snacks: self.snacks,
        })
    }
}

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/bookings/price-preview", post(price_preview))
        .route("/bookings/confirm", post(confirm_booking))
        .route("/bookings/{booking_id}", get(get_booking))
        .route("/checkout", post(checkout))
        .route_layer(from_fn_with_state(state, customer_auth_middleware))
}

async fn price_preview(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<BookingRequest>,
) -> Result<Json<PricePreview>, AppError> {
    let request = req.into_confirm(&caller, false)?;
    Ok(Json(state.orchestrator.price_preview(&request).await?))
}

async fn confirm_booking(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<BookingRequest>,
) -> Result<(StatusCode, Json<Booking>), AppError> {
    let request = req.into_confirm(&caller, true)?;
    let result = state.orchestrator.confirm_booking(&request).await;
    Metrics::outcome(&state.metrics.bookings, &result);
    Ok((StatusCode::CREATED, Json(result?)))
}

async fn get_booking(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<Booking>, AppError> {
    let booking = state.orchestrator.get_booking(booking_id).await?;
    ensure_booking_access(&caller, booking.user_id)?;
    Ok(Json(booking))
}

/// Confirm and open a gateway order in one call.
async fn checkout(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    extensions: Extensions,
    Json(req): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutResult>), AppError> {
    let method: PaymentMethod = req.payment_method.parse()?;
    let request = req.booking.into_confirm(&caller, true)?;
    let result = state.settlement.checkout(&request, method, client_ip(&extensions)).await;
    Metrics::outcome(&state.metrics.bookings, &result);
    Ok((StatusCode::CREATED, Json(result?)))
}
