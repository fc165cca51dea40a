use async_trait::async_trait;
use cine_core::{
    CaptureResult, CoreError, CoreResult, GatewayOrder, GatewayOutcome, GatewayQuote, OrderRequest, Payment,
    PaymentGateway, PaymentMethod, VerifiedEvent, WebhookPayload, WebhookResult,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::signing::{hmac_sha256_hex, verify_sha256_hex};

const MOCK_SECRET: &str = "mock-gateway-secret";

#[derive(Default)]
struct MockState {
    fail_create: bool,
    refund_error: Option<String>,
    capture: Option<CaptureResult>,
    orders_created: usize,
    refunds: Vec<(Uuid, f64, String)>,
}

/// Scriptable in-process gateway for local runs and tests.
///
/// Webhooks are signed with HMAC-SHA256 over
/// `amount=..&orderId=..&resultCode=..&transId=..`.
pub struct MockGateway {
    method: PaymentMethod,
    state: Mutex<MockState>,
}

impl MockGateway {
    pub fn new(method: PaymentMethod) -> Self {
        Self { method, state: Mutex::new(MockState::default()) }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_order_creation(&self, fail: bool) {
        self.state().fail_create = fail;
    }

    pub fn fail_refunds(&self, error: Option<&str>) {
        self.state().refund_error = error.map(str::to_string);
    }

    pub fn script_capture(&self, result: CaptureResult) {
        self.state().capture = Some(result);
    }

    pub fn orders_created(&self) -> usize {
        self.state().orders_created
    }

    /// `(payment id, amount, reason)` for every refund issued.
    pub fn refunds(&self) -> Vec<(Uuid, f64, String)> {
        self.state().refunds.clone()
    }

    fn canonical(amount: &str, order_id: &str, result_code: &str, trans_id: &str) -> String {
        format!("amount={}&orderId={}&resultCode={}&transId={}", amount, order_id, result_code, trans_id)
    }

    /// Build a correctly signed webhook, as the gateway would send it.
    pub fn signed_webhook(order_id: &str, amount: f64, success: bool, trans_id: &str) -> WebhookPayload {
        let amount = format!("{}", amount as i64);
        let result_code = if success { "0" } else { "1006" };
        let signature = hmac_sha256_hex(MOCK_SECRET, &Self::canonical(&amount, order_id, result_code, trans_id));

        let mut params = BTreeMap::new();
        params.insert("orderId".to_string(), order_id.to_string());
        params.insert("amount".to_string(), amount);
        params.insert("resultCode".to_string(), result_code.to_string());
        params.insert("transId".to_string(), trans_id.to_string());
        params.insert("signature".to_string(), signature);
        WebhookPayload { params }
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn method(&self) -> PaymentMethod {
        self.method
    }

    fn quote(&self, amount: f64) -> GatewayQuote {
        super::quote(amount, 1.0)
    }

    fn currency(&self) -> &str {
        "VND"
    }

    async fn create_order(&self, request: &OrderRequest) -> CoreResult<GatewayOrder> {
        let mut state = self.state();
        if state.fail_create {
            return Err(CoreError::Gateway("mock gateway rejected the order".into()));
        }
        state.orders_created += 1;
        let gateway_order_id = format!("MOCK-{}", request.payment_id.simple());
        Ok(GatewayOrder {
            approval_url: format!("https://pay.mock.local/checkout/{}", gateway_order_id),
            gateway_order_id,
        })
    }

    fn verify_webhook(&self, payload: &WebhookPayload) -> CoreResult<VerifiedEvent> {
        let field = |k: &str| {
            payload
                .get(k)
                .ok_or_else(|| CoreError::InvalidWebhookSignature(format!("missing {}", k)))
        };
        let (order_id, amount, result_code, trans_id) =
            (field("orderId")?, field("amount")?, field("resultCode")?, field("transId")?);

        let canonical = Self::canonical(amount, order_id, result_code, trans_id);
        if !verify_sha256_hex(MOCK_SECRET, &canonical, field("signature")?) {
            return Err(CoreError::InvalidWebhookSignature("signature mismatch".into()));
        }

        Ok(VerifiedEvent {
            gateway_order_id: order_id.to_string(),
            gateway_txn_id: Some(trans_id.to_string()),
            gateway_amount: amount
                .parse::<f64>()
                .map_err(|_| CoreError::InvalidWebhookSignature("amount is not numeric".into()))?,
            outcome: if result_code == "0" {
                GatewayOutcome::Succeeded
            } else {
                GatewayOutcome::Failed(format!("result code {}", result_code))
            },
        })
    }

    async fn capture(&self, payment: &Payment) -> CoreResult<CaptureResult> {
        Ok(self.state().capture.clone().unwrap_or(CaptureResult {
            gateway_txn_id: None,
            gateway_amount: payment.gateway_amount,
            outcome: GatewayOutcome::Pending,
        }))
    }

    async fn refund(&self, payment: &Payment, amount: f64, reason: &str) -> CoreResult<String> {
        let mut state = self.state();
        if let Some(error) = &state.refund_error {
            return Err(CoreError::Gateway(error.clone()));
        }
        state.refunds.push((payment.id, amount, reason.to_string()));
        Ok(format!("MOCK-RF-{}", state.refunds.len()))
    }

    fn acknowledge(&self, result: WebhookResult) -> serde_json::Value {
        json!({ "status": result })
    }
}
