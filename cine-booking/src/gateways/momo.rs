use async_trait::async_trait;
use chrono::Utc;
use cine_core::{
    CaptureResult, CoreError, CoreResult, GatewayOrder, GatewayOutcome, GatewayQuote, OrderRequest, Payment,
    PaymentGateway, PaymentMethod, VerifiedEvent, WebhookPayload, WebhookResult,
};
use cine_store::app_config::MomoConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::signing::{hmac_sha256_hex, verify_sha256_hex};

const REQUEST_TYPE: &str = "captureWallet";

/// Fields covered by the IPN signature, in signing order
const IPN_FIELDS: [&str; 12] = [
    "amount",
    "extraData",
    "message",
    "orderId",
    "orderInfo",
    "orderType",
    "partnerCode",
    "payType",
    "requestId",
    "responseTime",
    "resultCode",
    "transId",
];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequest<'a> {
    partner_code: &'a str,
    request_id: String,
    amount: i64,
    order_id: String,
    order_info: &'a str,
    redirect_url: &'a str,
    ipn_url: &'a str,
    request_type: &'a str,
    extra_data: String,
    lang: &'a str,
    signature: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateResponse {
    result_code: i64,
    #[serde(default)]
    message: String,
    pay_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    result_code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    trans_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefundResponse {
    result_code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    trans_id: Option<i64>,
}

/// MoMo wallet gateway (`/v2/gateway/api/*`, HMAC-SHA256 signatures)
pub struct MomoGateway {
    config: MomoConfig,
    client: reqwest::Client,
}

impl MomoGateway {
    pub fn new(config: MomoConfig) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| CoreError::Gateway(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    fn sign(&self, raw: &str) -> String {
        hmac_sha256_hex(&self.config.secret_key, raw)
    }

    fn ipn_canonical(&self, payload: &WebhookPayload) -> String {
        let mut raw = format!("accessKey={}", self.config.access_key);
        for field in IPN_FIELDS {
            raw.push('&');
            raw.push_str(field);
            raw.push('=');
            raw.push_str(payload.get(field).unwrap_or(""));
        }
        raw
    }

    async fn post<T: for<'de> Deserialize<'de>>(&self, path: &str, body: &Value) -> CoreResult<T> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| CoreError::Gateway(format!("MoMo request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::Gateway(format!("MoMo returned {}: {}", status, text)));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| CoreError::Gateway(format!("unreadable MoMo response: {}", e)))
    }
}

#[async_trait]
impl PaymentGateway for MomoGateway {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Momo
    }

    fn quote(&self, amount: f64) -> GatewayQuote {
        super::quote(amount, self.config.exchange_rate)
    }

    fn currency(&self) -> &str {
        &self.config.currency
    }

    async fn create_order(&self, request: &OrderRequest) -> CoreResult<GatewayOrder> {
        let order_id = request.payment_id.simple().to_string();
        let request_id = Uuid::new_v4().simple().to_string();
        let amount = request.gateway_amount as i64;
        let extra_data = String::new();

        let raw = format!(
            "accessKey={}&amount={}&extraData={}&ipnUrl={}&orderId={}&orderInfo={}&partnerCode={}&redirectUrl={}&requestId={}&requestType={}",
            self.config.access_key,
            amount,
            extra_data,
            self.config.ipn_url,
            order_id,
            request.description,
            self.config.partner_code,
            self.config.redirect_url,
            request_id,
            REQUEST_TYPE,
        );

        let body = CreateRequest {
            partner_code: &self.config.partner_code,
            request_id,
            amount,
            order_id: order_id.clone(),
            order_info: &request.description,
            redirect_url: &self.config.redirect_url,
            ipn_url: &self.config.ipn_url,
            request_type: REQUEST_TYPE,
            extra_data,
            lang: "vi",
            signature: self.sign(&raw),
        };
        let body = serde_json::to_value(&body).map_err(|e| CoreError::InternalError(e.to_string()))?;

        let response: CreateResponse = self.post("/v2/gateway/api/create", &body).await?;
        match (response.result_code, response.pay_url) {
            (0, Some(pay_url)) => Ok(GatewayOrder { gateway_order_id: order_id, approval_url: pay_url }),
            (code, _) => Err(CoreError::Gateway(format!("MoMo create failed ({}): {}", code, response.message))),
        }
    }

    fn verify_webhook(&self, payload: &WebhookPayload) -> CoreResult<VerifiedEvent> {
        let signature = payload
            .get("signature")
            .ok_or_else(|| CoreError::InvalidWebhookSignature("missing signature".into()))?;
        if payload.get("partnerCode") != Some(self.config.partner_code.as_str()) {
            return Err(CoreError::InvalidWebhookSignature("unexpected partner code".into()));
        }
        if !verify_sha256_hex(&self.config.secret_key, &self.ipn_canonical(payload), signature) {
            return Err(CoreError::InvalidWebhookSignature("signature mismatch".into()));
        }

        let order_id = payload
            .get("orderId")
            .ok_or_else(|| CoreError::InvalidWebhookSignature("missing orderId".into()))?;
        let amount = payload
            .get("amount")
            .and_then(|a| a.parse::<f64>().ok())
            .ok_or_else(|| CoreError::InvalidWebhookSignature("missing amount".into()))?;
        let result_code = payload.get("resultCode").unwrap_or("");

        let outcome = match result_code {
            "0" | "9000" => GatewayOutcome::Succeeded,
            // 1000: initiated, waiting for the user
            "1000" | "7000" => GatewayOutcome::Pending,
            code => GatewayOutcome::Failed(format!(
                "MoMo result {}: {}",
                code,
                payload.get("message").unwrap_or("")
            )),
        };

        debug!("Verified MoMo IPN for order {}", order_id);
        Ok(VerifiedEvent {
            gateway_order_id: order_id.to_string(),
            gateway_txn_id: payload.get("transId").filter(|t| !t.is_empty()).map(str::to_string),
            gateway_amount: amount,
            outcome,
        })
    }

    async fn capture(&self, payment: &Payment) -> CoreResult<CaptureResult> {
        let order_id = payment
            .gateway_order_id
            .as_deref()
            .ok_or_else(|| CoreError::DomainConflict("payment has no gateway order".into()))?;
        let request_id = Uuid::new_v4().simple().to_string();
        let raw = format!(
            "accessKey={}&orderId={}&partnerCode={}&requestId={}",
            self.config.access_key, order_id, self.config.partner_code, request_id
        );
        let body = json!({
            "partnerCode": self.config.partner_code,
            "requestId": request_id,
            "orderId": order_id,
            "lang": "vi",
            "signature": self.sign(&raw),
        });

        let response: QueryResponse = self.post("/v2/gateway/api/query", &body).await?;
        let outcome = match response.result_code {
            0 => GatewayOutcome::Succeeded,
            1000 | 7000 => GatewayOutcome::Pending,
            code => GatewayOutcome::Failed(format!("MoMo result {}: {}", code, response.message)),
        };
        let gateway_amount = match (&outcome, response.amount) {
            (_, Some(amount)) => amount as f64,
            (GatewayOutcome::Succeeded, None) => {
                warn!("MoMo reported order {} paid without an amount", order_id);
                return Err(CoreError::Gateway("MoMo query response has no amount".into()));
            }
            (_, None) => 0.0,
        };
        Ok(CaptureResult {
            gateway_txn_id: response.trans_id.map(|t| t.to_string()),
            gateway_amount,
            outcome,
        })
    }

    async fn refund(&self, payment: &Payment, amount: f64, reason: &str) -> CoreResult<String> {
        let trans_id = payment
            .gateway_txn_id
            .as_deref()
            .ok_or_else(|| CoreError::DomainConflict("payment has no gateway transaction to refund".into()))?;
        let refund_amount = super::quote(amount, payment.exchange_rate).amount as i64;
        let order_id = format!("RF{}", Uuid::new_v4().simple());
        let request_id = Uuid::new_v4().simple().to_string();

        let raw = format!(
            "accessKey={}&amount={}&description={}&orderId={}&partnerCode={}&requestId={}&transId={}",
            self.config.access_key, refund_amount, reason, order_id, self.config.partner_code, request_id, trans_id
        );
        let body = json!({
            "partnerCode": self.config.partner_code,
            "orderId": order_id,
            "requestId": request_id,
            "amount": refund_amount,
            "transId": trans_id.parse::<i64>().unwrap_or_default(),
            "lang": "vi",
            "description": reason,
            "signature": self.sign(&raw),
        });

        let response: RefundResponse = self.post("/v2/gateway/api/refund", &body).await?;
        if response.result_code != 0 {
            warn!("MoMo refund for payment {} rejected: {}", payment.id, response.message);
            return Err(CoreError::Gateway(format!(
                "MoMo refund failed ({}): {}",
                response.result_code, response.message
            )));
        }
        Ok(response.trans_id.map(|t| t.to_string()).unwrap_or(order_id))
    }

    fn acknowledge(&self, result: WebhookResult) -> Value {
        let (code, message) = match result {
            WebhookResult::Processed | WebhookResult::AlreadyProcessed => (0, "Success"),
            WebhookResult::AmountMismatch => (0, "Amount mismatch recorded"),
            WebhookResult::UnknownOrder => (1, "Order not found"),
            WebhookResult::InvalidSignature => (97, "Invalid signature"),
            WebhookResult::RetryLater => (99, "Temporarily unavailable"),
        };
        json!({
            "partnerCode": self.config.partner_code,
            "resultCode": code,
            "message": message,
            "responseTime": Utc::now().timestamp_millis(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(endpoint: &str) -> MomoConfig {
        MomoConfig {
            partner_code: "MOMOTEST".into(),
            access_key: "access".into(),
            secret_key: "secret".into(),
            endpoint: endpoint.into(),
            redirect_url: "https://cine.local/return".into(),
            ipn_url: "https://cine.local/v1/payments/momo/ipn".into(),
            currency: "VND".into(),
            exchange_rate: 1.0,
            timeout_seconds: 5,
        }
    }

    fn ipn(gateway: &MomoGateway, result_code: &str, amount: &str) -> WebhookPayload {
        let mut params = BTreeMap::new();
        for (k, v) in [
            ("partnerCode", "MOMOTEST"),
            ("orderId", "abc123"),
            ("requestId", "req-1"),
            ("amount", amount),
            ("orderInfo", "Booking tickets"),
            ("orderType", "momo_wallet"),
            ("transId", "4088878653"),
            ("resultCode", result_code),
            ("message", "Successful."),
            ("payType", "qr"),
            ("responseTime", "1721720663942"),
            ("extraData", ""),
        ] {
            params.insert(k.to_string(), v.to_string());
        }
        let mut payload = WebhookPayload { params };
        let signature = gateway.sign(&gateway.ipn_canonical(&payload));
        payload.params.insert("signature".into(), signature);
        payload
    }

    #[test]
    fn test_ipn_signature_verified() {
        let gateway = MomoGateway::new(config("http://unused")).unwrap();
        let event = gateway.verify_webhook(&ipn(&gateway, "0", "240000")).unwrap();
        assert_eq!(event.gateway_order_id, "abc123");
        assert_eq!(event.gateway_amount, 240_000.0);
        assert_eq!(event.gateway_txn_id.as_deref(), Some("4088878653"));
        assert_eq!(event.outcome, GatewayOutcome::Succeeded);
    }

    #[test]
    fn test_tampered_ipn_rejected() {
        let gateway = MomoGateway::new(config("http://unused")).unwrap();
        let mut payload = ipn(&gateway, "0", "240000");
        payload.params.insert("amount".into(), "1000".into());
        assert!(matches!(
            gateway.verify_webhook(&payload),
            Err(CoreError::InvalidWebhookSignature(_))
        ));
    }

    #[test]
    fn test_failed_result_code_maps_to_failure() {
        let gateway = MomoGateway::new(config("http://unused")).unwrap();
        let event = gateway.verify_webhook(&ipn(&gateway, "1006", "240000")).unwrap();
        assert!(matches!(event.outcome, GatewayOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_create_order_returns_pay_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/gateway/api/create"))
            .and(body_partial_json(json!({ "partnerCode": "MOMOTEST", "amount": 240000 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "partnerCode": "MOMOTEST",
                "resultCode": 0,
                "message": "Thành công.",
                "payUrl": "https://test-payment.momo.vn/pay/abc"
            })))
            .mount(&server)
            .await;

        let gateway = MomoGateway::new(config(&server.uri())).unwrap();
        let payment_id = Uuid::new_v4();
        let order = gateway
            .create_order(&OrderRequest {
                payment_id,
                booking_id: Uuid::new_v4(),
                gateway_amount: 240_000.0,
                description: "Booking tickets".into(),
                client_ip: None,
            })
            .await
            .unwrap();

        assert_eq!(order.gateway_order_id, payment_id.simple().to_string());
        assert_eq!(order.approval_url, "https://test-payment.momo.vn/pay/abc");
    }

    fn pending_payment() -> Payment {
        let now = chrono::Utc::now();
        Payment {
            id: Uuid::new_v4(),
            booking_id: Uuid::new_v4(),
            method: PaymentMethod::Momo,
            amount: 240_000.0,
            currency: "VND".into(),
            gateway_amount: 240_000.0,
            gateway_currency: "VND".into(),
            exchange_rate: 1.0,
            gateway_order_id: Some("abc123".into()),
            gateway_txn_id: None,
            approval_url: None,
            status: cine_core::PaymentStatus::Pending,
            error_message: None,
            created_at: now,
            completed_at: None,
            updated_at: now,
        }
    }

    async fn query_server(response: Value) -> (MockServer, MomoGateway) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/gateway/api/query"))
            .and(body_partial_json(json!({ "orderId": "abc123" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(response))
            .mount(&server)
            .await;
        let gateway = MomoGateway::new(config(&server.uri())).unwrap();
        (server, gateway)
    }

    #[tokio::test]
    async fn test_query_reports_paid_amount() {
        let (_server, gateway) = query_server(json!({
            "orderId": "abc123",
            "resultCode": 0,
            "message": "Thành công.",
            "amount": 240000,
            "transId": 4088878653i64
        }))
        .await;
        let result = gateway.capture(&pending_payment()).await.unwrap();
        assert_eq!(result.outcome, GatewayOutcome::Succeeded);
        assert_eq!(result.gateway_amount, 240_000.0);
        assert_eq!(result.gateway_txn_id.as_deref(), Some("4088878653"));
    }

    #[tokio::test]
    async fn test_query_success_without_amount_is_rejected() {
        let (_server, gateway) = query_server(json!({
            "orderId": "abc123",
            "resultCode": 0,
            "message": "Thành công."
        }))
        .await;
        let err = gateway.capture(&pending_payment()).await.unwrap_err();
        assert!(matches!(err, CoreError::Gateway(_)));

        let (_server, gateway) = query_server(json!({ "resultCode": 1000, "message": "Pending" })).await;
        let result = gateway.capture(&pending_payment()).await.unwrap();
        assert_eq!(result.outcome, GatewayOutcome::Pending);
    }

    #[tokio::test]
    async fn test_create_order_error_code_is_gateway_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/gateway/api/create"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resultCode": 13,
                "message": "Merchant authentication failed"
            })))
            .mount(&server)
            .await;

        let gateway = MomoGateway::new(config(&server.uri())).unwrap();
        let err = gateway
            .create_order(&OrderRequest {
                payment_id: Uuid::new_v4(),
                booking_id: Uuid::new_v4(),
                gateway_amount: 1000.0,
                description: "x".into(),
                client_ip: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Gateway(_)));
    }
}
