use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cine_core::CoreError;
use cine_pricing::PricingError;
use serde_json::json;

#[derive(Debug)]
pub enum AppError {
    AuthenticationError(String),
    AuthorizationError(String),
    ValidationError(String),
    Core(CoreError),
    InternalServerError(String),
    Anyhow(anyhow::Error),
}

impl AppError {
    fn internal(message: String) -> (StatusCode, serde_json::Value) {
        tracing::error!("Internal Server Error: {}", message);
        (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "Internal Server Error" }))
    }

    fn core(err: CoreError) -> (StatusCode, serde_json::Value) {
        let message = err.to_string();
        match err {
            CoreError::ResourceNotFound(_) => (StatusCode::NOT_FOUND, json!({ "error": message })),
            CoreError::SeatLocked { seat_ids } => (
                StatusCode::CONFLICT,
                json!({ "error": message, "code": "SEAT_LOCKED", "seat_ids": seat_ids }),
            ),
            CoreError::LockExpired(lock_id) => (
                StatusCode::GONE,
                json!({ "error": message, "code": "LOCK_EXPIRED", "lock_id": lock_id }),
            ),
            CoreError::MaxSeatsExceeded { requested, max } => (
                StatusCode::BAD_REQUEST,
                json!({ "error": message, "code": "MAX_SEATS_EXCEEDED", "requested": requested, "max": max }),
            ),
            CoreError::GatewayAmountMismatch { .. } => (StatusCode::PAYMENT_REQUIRED, json!({ "error": message })),
            CoreError::InvalidWebhookSignature(_) => (StatusCode::UNAUTHORIZED, json!({ "error": message })),
            CoreError::DomainConflict(_) | CoreError::InvalidTransition { .. } => {
                (StatusCode::CONFLICT, json!({ "error": message }))
            }
            CoreError::ValidationError(_) | CoreError::Pricing(PricingError::PromotionNotRedeemable { .. }) => {
                (StatusCode::BAD_REQUEST, json!({ "error": message }))
            }
            CoreError::Gateway(_) => {
                tracing::error!("Gateway failure: {}", message);
                (StatusCode::BAD_GATEWAY, json!({ "error": message }))
            }
            CoreError::Pricing(_)
            | CoreError::Storage(_)
            | CoreError::LockStore(_)
            | CoreError::InternalError(_) => Self::internal(message),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::AuthenticationError(msg) => (StatusCode::UNAUTHORIZED, json!({ "error": msg })),
            AppError::AuthorizationError(msg) => (StatusCode::FORBIDDEN, json!({ "error": msg })),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            AppError::Core(err) => Self::core(err),
            AppError::InternalServerError(msg) => Self::internal(msg),
            AppError::Anyhow(err) => Self::internal(err.to_string()),
        };

        (status, Json(body)).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        AppError::Core(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Anyhow(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn status_of(err: CoreError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn test_core_error_status_mapping() {
        assert_eq!(status_of(CoreError::not_found("showtime", Uuid::nil())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(CoreError::SeatLocked { seat_ids: vec![Uuid::nil()] }), StatusCode::CONFLICT);
        assert_eq!(status_of(CoreError::LockExpired(Uuid::nil())), StatusCode::GONE);
        assert_eq!(status_of(CoreError::MaxSeatsExceeded { requested: 9, max: 8 }), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(CoreError::GatewayAmountMismatch { expected: 1.0, actual: 2.0 }),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(status_of(CoreError::DomainConflict("owner".into())), StatusCode::CONFLICT);
        assert_eq!(status_of(CoreError::Gateway("down".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(status_of(CoreError::Storage("pool".into())), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_of(CoreError::Pricing(PricingError::NoActiveBasePrice)), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
