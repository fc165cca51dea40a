use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    middleware::from_fn_with_state,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use cine_booking::{Availability, LockResult, SeatSelection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::metrics::Metrics;
use crate::middleware::auth::{customer_auth_middleware, optional_caller, Caller};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LockSeatsRequest {
    pub showtime_id: Uuid,
    pub seats: Vec<SeatSelection>,
}

#[derive(Debug, Serialize)]
struct ReleaseResponse {
    showtime_id: Uuid,
    released: bool,
}

pub fn routes(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .route("/seat-locks", post(lock_seats))
        .route("/seat-locks/{showtime_id}", delete(release_seats))
        .route_layer(from_fn_with_state(state, customer_auth_middleware));

    Router::new()
        .route("/seat-locks/availability/{showtime_id}", get(check_availability))
        .merge(protected)
}

async fn lock_seats(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<LockSeatsRequest>,
) -> Result<(StatusCode, Json<LockResult>), AppError> {
    let result = state.seat_locks.lock_seats(req.showtime_id, &req.seats, &caller.owner()).await;
    Metrics::outcome(&state.metrics.seat_locks, &result);
    Ok((StatusCode::CREATED, Json(result?)))
}

async fn release_seats(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(showtime_id): Path<Uuid>,
) -> Result<Json<ReleaseResponse>, AppError> {
    let released = state.seat_locks.release_seats(&caller.owner(), showtime_id).await?;
    Ok(Json(ReleaseResponse { showtime_id, released }))
}

/// Public seat map; a valid token additionally reports the caller's own lock.
async fn check_availability(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(showtime_id): Path<Uuid>,
) -> Result<Json<Availability>, AppError> {
    let owner = optional_caller(&state, &headers).map(|caller| caller.owner());
    let view = state.seat_locks.check_availability(showtime_id, owner.as_ref()).await?;
    Ok(Json(view))
}
