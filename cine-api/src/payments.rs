use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{Extensions, StatusCode},
    middleware::from_fn_with_state,
    routing::{get, post},
    Extension, Json, Router,
};
use cine_booking::{CaptureSummary, PaymentOrder, RefundSummary};
use cine_core::{PaymentMethod, WebhookPayload};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client_ip;
use crate::error::AppError;
use crate::middleware::auth::{admin_auth_middleware, customer_auth_middleware, Caller};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub booking_id: Uuid,
    pub payment_method: String,
}

#[derive(Debug, Deserialize)]
pub struct CaptureRequest {
    pub payment_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub fn routes(state: AppState) -> Router<AppState> {
    let customer = Router::new()
        .route("/payments/order", post(create_order))
        .route("/payments/order/capture", post(capture_order))
        .route_layer(from_fn_with_state(state.clone(), customer_auth_middleware));

    let admin = Router::new()
        .route("/payments/{id}/refund", post(refund_payment))
        .route_layer(from_fn_with_state(state, admin_auth_middleware));

    // Gateways authenticate by signature, not by token
    Router::new()
        .route("/payments/{id}/ipn", get(ipn_query).post(ipn_body))
        .merge(customer)
        .merge(admin)
}

async fn create_order(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    extensions: Extensions,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<PaymentOrder>), AppError> {
    let method: PaymentMethod = req.payment_method.parse()?;
    let order = state
        .settlement
        .create_order(req.booking_id, method, caller.user_id(), client_ip(&extensions))
        .await?;

    let status = if order.reused { StatusCode::OK } else { StatusCode::CREATED };
    Ok((status, Json(order)))
}

async fn capture_order(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<CaptureRequest>,
) -> Result<Json<CaptureSummary>, AppError> {
    Ok(Json(state.settlement.capture(req.payment_id, caller.user_id()).await?))
}

async fn refund_payment(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(payment_id): Path<Uuid>,
    Json(req): Json<RefundRequest>,
) -> Result<Json<RefundSummary>, AppError> {
    let reason = req
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "Refund requested by administrator".to_string());

    info!("Refund of payment {} requested by {:?}", payment_id, caller);
    Ok(Json(state.settlement.request_refund(payment_id, &reason).await?))
}

/// VNPay-style notifications arrive as query parameters.
async fn ipn_query(
    State(state): State<AppState>,
    Path(gateway): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<Value>, AppError> {
    handle_ipn(&state, &gateway, WebhookPayload { params }).await
}

/// MoMo-style notifications arrive as a JSON body. The body is read raw so
/// a form-encoded or broken one still gets the gateway's acknowledgement.
async fn ipn_body(
    State(state): State<AppState>,
    Path(gateway): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    handle_ipn(&state, &gateway, parse_payload(&body)).await
}

async fn handle_ipn(state: &AppState, gateway: &str, payload: WebhookPayload) -> Result<Json<Value>, AppError> {
    let method: PaymentMethod = gateway.parse()?;
    state.metrics.webhooks.with_label_values(&[method.as_str()]).inc();

    // Always 200: the acknowledgement body carries the result code
    let ack = state.settlement.handle_webhook(method, &payload).await?;
    Ok(Json(ack))
}

/// JSON first, then form encoding. An unreadable body becomes an empty
/// payload, which fails signature verification.
fn parse_payload(body: &[u8]) -> WebhookPayload {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        return flatten_payload(&value);
    }
    match serde_urlencoded::from_bytes::<BTreeMap<String, String>>(body) {
        Ok(params) => WebhookPayload { params },
        Err(e) => {
            warn!("Unreadable webhook body: {}", e);
            WebhookPayload::default()
        }
    }
}

/// Scalars keep their textual form so signatures recompute byte for byte.
fn flatten_payload(body: &Value) -> WebhookPayload {
    let mut params = BTreeMap::new();
    match body.as_object() {
        Some(fields) => {
            for (key, value) in fields {
                let text = match value {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                params.insert(key.clone(), text);
            }
        }
        None => warn!("Webhook body is not a JSON object"),
    }
    WebhookPayload { params }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flatten_payload_keeps_number_text() {
        let payload = flatten_payload(&json!({
            "orderId": "abc",
            "amount": 240000,
            "resultCode": 0,
            "extraData": null,
        }));
        assert_eq!(payload.get("orderId"), Some("abc"));
        assert_eq!(payload.get("amount"), Some("240000"));
        assert_eq!(payload.get("resultCode"), Some("0"));
        assert_eq!(payload.get("extraData"), Some(""));
    }

    #[test]
    fn test_parse_payload_accepts_form_and_garbage() {
        let form = parse_payload(b"vnp_TxnRef=abc&vnp_OrderInfo=Booking+tickets&vnp_Amount=24000000");
        assert_eq!(form.get("vnp_TxnRef"), Some("abc"));
        assert_eq!(form.get("vnp_OrderInfo"), Some("Booking tickets"));

        let json = parse_payload(br#"{"orderId":"abc","resultCode":0}"#);
        assert_eq!(json.get("resultCode"), Some("0"));

        assert!(parse_payload(b"[1,2,3]").params.is_empty());
        assert!(parse_payload(&[0xff, 0xfe, 0x00]).get("signature").is_none());
    }
}
