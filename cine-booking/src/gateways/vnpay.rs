use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use cine_core::{
    CaptureResult, CoreError, CoreResult, GatewayOrder, GatewayOutcome, GatewayQuote, OrderRequest, Payment,
    PaymentGateway, PaymentMethod, VerifiedEvent, WebhookPayload, WebhookResult,
};
use cine_store::app_config::VnpayConfig;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::signing::{hmac_sha512_hex, verify_sha512_hex};

const VERSION: &str = "2.1.0";
const SUCCESS: &str = "00";
/// vnp_Amount carries the minor unit
const AMOUNT_SCALE: f64 = 100.0;
const DEFAULT_IP: &str = "127.0.0.1";
/// Fields of a `querydr` answer, in the order VNPay signs them
const QUERY_RESPONSE_FIELDS: [&str; 15] = [
    "vnp_ResponseId",
    "vnp_Command",
    "vnp_ResponseCode",
    "vnp_Message",
    "vnp_TmnCode",
    "vnp_TxnRef",
    "vnp_Amount",
    "vnp_BankCode",
    "vnp_PayDate",
    "vnp_TransactionNo",
    "vnp_TransactionType",
    "vnp_TransactionStatus",
    "vnp_OrderInfo",
    "vnp_PromotionCode",
    "vnp_PromotionAmount",
];

/// `yyyyMMddHHmmss` in Vietnam time, the format every VNPay timestamp uses.
fn vnp_time(at: DateTime<Utc>) -> String {
    const FORMAT: &str = "%Y%m%d%H%M%S";
    match FixedOffset::east_opt(7 * 3600) {
        Some(tz) => at.with_timezone(&tz).format(FORMAT).to_string(),
        None => at.format(FORMAT).to_string(),
    }
}

/// Query-string encoding VNPay signs over: sorted keys, form-style spaces.
fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v).replace("%20", "+")))
        .collect::<Vec<_>>()
        .join("&")
}

fn text_field(body: &Value, key: &str) -> Option<String> {
    match body.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn query_response_data(response: &Value) -> String {
    QUERY_RESPONSE_FIELDS
        .iter()
        .map(|key| text_field(response, key).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("|")
}

/// VNPay redirect gateway (HMAC-SHA512 over sorted `vnp_*` parameters)
pub struct VnpayGateway {
    config: VnpayConfig,
    client: reqwest::Client,
}

impl VnpayGateway {
    pub fn new(config: VnpayConfig) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| CoreError::Gateway(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn sign(&self, data: &str) -> String {
        hmac_sha512_hex(&self.config.hash_secret, data)
    }

    fn outcome(response_code: &str, transaction_status: &str) -> GatewayOutcome {
        match (response_code, transaction_status) {
            (SUCCESS, SUCCESS) => GatewayOutcome::Succeeded,
            // 01: not completed yet, 05: being processed
            (SUCCESS, "01") | (SUCCESS, "05") => GatewayOutcome::Pending,
            (code, status) => GatewayOutcome::Failed(format!("VNPay response {} status {}", code, status)),
        }
    }

    /// A query answer is only trusted when it is signed for our terminal
    /// and order.
    fn verify_query_response(&self, response: &Value, txn_ref: &str) -> CoreResult<()> {
        let signature = text_field(response, "vnp_SecureHash")
            .ok_or_else(|| CoreError::Gateway("VNPay query response is not signed".into()))?;
        if !verify_sha512_hex(&self.config.hash_secret, &query_response_data(response), &signature) {
            return Err(CoreError::Gateway("VNPay query response signature mismatch".into()));
        }
        if text_field(response, "vnp_TmnCode").as_deref() != Some(self.config.tmn_code.as_str())
            || text_field(response, "vnp_TxnRef").as_deref() != Some(txn_ref)
        {
            return Err(CoreError::Gateway("VNPay query response is for another order".into()));
        }
        Ok(())
    }

    async fn call_api(&self, body: &Value) -> CoreResult<Value> {
        let response = self
            .client
            .post(&self.config.api_url)
            .json(body)
            .send()
            .await
            .map_err(|e| CoreError::Gateway(format!("VNPay request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::Gateway(format!("VNPay returned {}: {}", status, text)));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| CoreError::Gateway(format!("unreadable VNPay response: {}", e)))
    }
}

#[async_trait]
impl PaymentGateway for VnpayGateway {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Vnpay
    }

    fn quote(&self, amount: f64) -> GatewayQuote {
        super::quote(amount, self.config.exchange_rate)
    }

    fn currency(&self) -> &str {
        &self.config.currency
    }

    async fn create_order(&self, request: &OrderRequest) -> CoreResult<GatewayOrder> {
        let txn_ref = request.payment_id.simple().to_string();
        let now = Utc::now();
        let amount = (request.gateway_amount * AMOUNT_SCALE).round() as i64;

        let mut params = BTreeMap::new();
        for (k, v) in [
            ("vnp_Version", VERSION.to_string()),
            ("vnp_Command", "pay".to_string()),
            ("vnp_TmnCode", self.config.tmn_code.clone()),
            ("vnp_Amount", amount.to_string()),
            ("vnp_CurrCode", self.config.currency.clone()),
            ("vnp_TxnRef", txn_ref.clone()),
            ("vnp_OrderInfo", request.description.clone()),
            ("vnp_OrderType", "other".to_string()),
            ("vnp_Locale", "vn".to_string()),
            ("vnp_ReturnUrl", self.config.return_url.clone()),
            ("vnp_IpAddr", request.client_ip.clone().unwrap_or_else(|| DEFAULT_IP.to_string())),
            ("vnp_CreateDate", vnp_time(now)),
            ("vnp_ExpireDate", vnp_time(now + chrono::Duration::minutes(15))),
        ] {
            params.insert(k.to_string(), v);
        }

        let query = canonical_query(&params);
        let signature = self.sign(&query);
        let approval_url = format!("{}?{}&vnp_SecureHash={}", self.config.payment_url, query, signature);

        debug!("Built VNPay payment URL for txn {}", txn_ref);
        Ok(GatewayOrder { gateway_order_id: txn_ref, approval_url })
    }

    fn verify_webhook(&self, payload: &WebhookPayload) -> CoreResult<VerifiedEvent> {
        let signature = payload
            .get("vnp_SecureHash")
            .ok_or_else(|| CoreError::InvalidWebhookSignature("missing vnp_SecureHash".into()))?;

        let signed: BTreeMap<String, String> = payload
            .params
            .iter()
            .filter(|(k, _)| k.starts_with("vnp_") && *k != "vnp_SecureHash" && *k != "vnp_SecureHashType")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !verify_sha512_hex(&self.config.hash_secret, &canonical_query(&signed), signature) {
            return Err(CoreError::InvalidWebhookSignature("signature mismatch".into()));
        }
        if payload.get("vnp_TmnCode") != Some(self.config.tmn_code.as_str()) {
            return Err(CoreError::InvalidWebhookSignature("unexpected terminal code".into()));
        }

        let txn_ref = payload
            .get("vnp_TxnRef")
            .ok_or_else(|| CoreError::InvalidWebhookSignature("missing vnp_TxnRef".into()))?;
        let amount = payload
            .get("vnp_Amount")
            .and_then(|a| a.parse::<f64>().ok())
            .map(|a| a / AMOUNT_SCALE)
            .ok_or_else(|| CoreError::InvalidWebhookSignature("missing vnp_Amount".into()))?;

        let outcome = Self::outcome(
            payload.get("vnp_ResponseCode").unwrap_or(""),
            payload.get("vnp_TransactionStatus").unwrap_or(""),
        );

        Ok(VerifiedEvent {
            gateway_order_id: txn_ref.to_string(),
            gateway_txn_id: payload
                .get("vnp_TransactionNo")
                .filter(|t| !t.is_empty() && *t != "0")
                .map(str::to_string),
            gateway_amount: amount,
            outcome,
        })
    }

    async fn capture(&self, payment: &Payment) -> CoreResult<CaptureResult> {
        let txn_ref = payment
            .gateway_order_id
            .as_deref()
            .ok_or_else(|| CoreError::DomainConflict("payment has no gateway order".into()))?;
        let request_id = Uuid::new_v4().simple().to_string();
        let create_date = vnp_time(Utc::now());
        let transaction_date = vnp_time(payment.created_at);
        let order_info = format!("Query payment {}", payment.id);

        let data = [
            request_id.as_str(),
            VERSION,
            "querydr",
            self.config.tmn_code.as_str(),
            txn_ref,
            transaction_date.as_str(),
            create_date.as_str(),
            DEFAULT_IP,
            order_info.as_str(),
        ]
        .join("|");
        let body = json!({
            "vnp_RequestId": request_id,
            "vnp_Version": VERSION,
            "vnp_Command": "querydr",
            "vnp_TmnCode": self.config.tmn_code,
            "vnp_TxnRef": txn_ref,
            "vnp_OrderInfo": order_info,
            "vnp_TransactionDate": transaction_date,
            "vnp_CreateDate": create_date,
            "vnp_IpAddr": DEFAULT_IP,
            "vnp_SecureHash": self.sign(&data),
        });

        let response = self.call_api(&body).await?;
        self.verify_query_response(&response, txn_ref)?;

        let response_code = text_field(&response, "vnp_ResponseCode").unwrap_or_default();
        let transaction_status = text_field(&response, "vnp_TransactionStatus").unwrap_or_default();
        let outcome = Self::outcome(&response_code, &transaction_status);
        let reported = text_field(&response, "vnp_Amount")
            .and_then(|a| a.parse::<f64>().ok())
            .map(|a| a / AMOUNT_SCALE);
        let gateway_amount = match (&outcome, reported) {
            (_, Some(amount)) => amount,
            (GatewayOutcome::Succeeded, None) => {
                warn!("VNPay reported txn {} paid without an amount", txn_ref);
                return Err(CoreError::Gateway("VNPay query response has no vnp_Amount".into()));
            }
            (_, None) => 0.0,
        };

        Ok(CaptureResult {
            gateway_txn_id: text_field(&response, "vnp_TransactionNo").filter(|t| !t.is_empty() && t != "0"),
            gateway_amount,
            outcome,
        })
    }

    async fn refund(&self, payment: &Payment, amount: f64, reason: &str) -> CoreResult<String> {
        let txn_ref = payment
            .gateway_order_id
            .as_deref()
            .ok_or_else(|| CoreError::DomainConflict("payment has no gateway order".into()))?;
        let transaction_no = payment.gateway_txn_id.clone().unwrap_or_default();
        let refund_amount = ((super::quote(amount, payment.exchange_rate).amount) * AMOUNT_SCALE).round() as i64;
        let request_id = Uuid::new_v4().simple().to_string();
        let create_date = vnp_time(Utc::now());
        let transaction_date = vnp_time(payment.created_at);
        // 02: full refund
        let transaction_type = "02";
        let create_by = "cine";
        let amount_text = refund_amount.to_string();

        let data = [
            request_id.as_str(),
            VERSION,
            "refund",
            self.config.tmn_code.as_str(),
            transaction_type,
            txn_ref,
            amount_text.as_str(),
            transaction_no.as_str(),
            transaction_date.as_str(),
            create_by,
            create_date.as_str(),
            DEFAULT_IP,
            reason,
        ]
        .join("|");
        let body = json!({
            "vnp_RequestId": request_id,
            "vnp_Version": VERSION,
            "vnp_Command": "refund",
            "vnp_TmnCode": self.config.tmn_code,
            "vnp_TransactionType": transaction_type,
            "vnp_TxnRef": txn_ref,
            "vnp_Amount": refund_amount,
            "vnp_TransactionNo": transaction_no,
            "vnp_TransactionDate": transaction_date,
            "vnp_CreateBy": create_by,
            "vnp_CreateDate": create_date,
            "vnp_IpAddr": DEFAULT_IP,
            "vnp_OrderInfo": reason,
            "vnp_SecureHash": self.sign(&data),
        });

        let response = self.call_api(&body).await?;
        let response_code = text_field(&response, "vnp_ResponseCode").unwrap_or_default();
        if response_code != SUCCESS {
            let message = text_field(&response, "vnp_Message").unwrap_or_default();
            warn!("VNPay refund for payment {} rejected: {} {}", payment.id, response_code, message);
            return Err(CoreError::Gateway(format!("VNPay refund failed ({}): {}", response_code, message)));
        }
        Ok(text_field(&response, "vnp_TransactionNo").unwrap_or(request_id))
    }

    fn acknowledge(&self, result: WebhookResult) -> Value {
        let (code, message) = match result {
            WebhookResult::Processed => ("00", "Confirm Success"),
            WebhookResult::AlreadyProcessed => ("02", "Order already confirmed"),
            WebhookResult::UnknownOrder => ("01", "Order not found"),
            WebhookResult::AmountMismatch => ("04", "Invalid amount"),
            WebhookResult::InvalidSignature => ("97", "Invalid signature"),
            WebhookResult::RetryLater => ("99", "Unknown error"),
        };
        json!({ "RspCode": code, "Message": message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cine_core::PaymentStatus;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(api_url: &str) -> VnpayConfig {
        VnpayConfig {
            tmn_code: "CINETEST".into(),
            hash_secret: "vnpay-secret".into(),
            payment_url: "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html".into(),
            api_url: api_url.into(),
            return_url: "https://cine.local/return".into(),
            currency: "VND".into(),
            exchange_rate: 1.0,
            timeout_seconds: 5,
        }
    }

    fn signed_return(gateway: &VnpayGateway, response_code: &str, amount: &str) -> WebhookPayload {
        let mut params = BTreeMap::new();
        for (k, v) in [
            ("vnp_TmnCode", "CINETEST"),
            ("vnp_TxnRef", "abc123"),
            ("vnp_Amount", amount),
            ("vnp_OrderInfo", "Booking tickets"),
            ("vnp_ResponseCode", response_code),
            ("vnp_TransactionStatus", response_code),
            ("vnp_TransactionNo", "14123456"),
            ("vnp_BankCode", "NCB"),
            ("vnp_PayDate", "20261017103000"),
        ] {
            params.insert(k.to_string(), v.to_string());
        }
        let signature = gateway.sign(&canonical_query(&params));
        params.insert("vnp_SecureHash".into(), signature);
        params.insert("vnp_SecureHashType".into(), "HmacSHA512".into());
        WebhookPayload { params }
    }

    fn payment() -> Payment {
        let now = Utc::now();
        Payment {
            id: Uuid::new_v4(),
            booking_id: Uuid::new_v4(),
            method: PaymentMethod::Vnpay,
            amount: 240_000.0,
            currency: "VND".into(),
            gateway_amount: 240_000.0,
            gateway_currency: "VND".into(),
            exchange_rate: 1.0,
            gateway_order_id: Some("abc123".into()),
            gateway_txn_id: Some("14123456".into()),
            approval_url: None,
            status: PaymentStatus::Completed,
            error_message: None,
            created_at: now,
            completed_at: Some(now),
            updated_at: now,
        }
    }

    /// A querydr answer signed the way VNPay signs it.
    fn signed_query_response(gateway: &VnpayGateway, fields: Value) -> Value {
        let mut response = fields;
        let signature = gateway.sign(&query_response_data(&response));
        response["vnp_SecureHash"] = Value::String(signature);
        response
    }

    async fn query_server(response: Value) -> (MockServer, VnpayGateway) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/merchant_webapi/api/transaction"))
            .and(body_partial_json(json!({ "vnp_Command": "querydr", "vnp_TxnRef": "abc123" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(response))
            .mount(&server)
            .await;
        let gateway =
            VnpayGateway::new(config(&format!("{}/merchant_webapi/api/transaction", server.uri()))).unwrap();
        (server, gateway)
    }

    #[test]
    fn test_canonical_query_sorts_and_encodes() {
        let mut params = BTreeMap::new();
        params.insert("vnp_OrderInfo".to_string(), "Booking tickets".to_string());
        params.insert("vnp_Amount".to_string(), "100".to_string());
        params.insert("vnp_BankCode".to_string(), String::new());
        assert_eq!(canonical_query(&params), "vnp_Amount=100&vnp_OrderInfo=Booking+tickets");
    }

    #[tokio::test]
    async fn test_payment_url_is_signed_in_minor_units() {
        let gateway = VnpayGateway::new(config("http://unused")).unwrap();
        let order = gateway
            .create_order(&OrderRequest {
                payment_id: Uuid::new_v4(),
                booking_id: Uuid::new_v4(),
                gateway_amount: 240_000.0,
                description: "Booking tickets".into(),
                client_ip: Some("10.0.0.1".into()),
            })
            .await
            .unwrap();

        assert!(order.approval_url.contains("vnp_Amount=24000000"));
        assert!(order.approval_url.contains("vnp_IpAddr=10.0.0.1"));
        assert!(order.approval_url.contains("&vnp_SecureHash="));
    }

    #[test]
    fn test_return_params_verified() {
        let gateway = VnpayGateway::new(config("http://unused")).unwrap();
        let event = gateway.verify_webhook(&signed_return(&gateway, "00", "24000000")).unwrap();
        assert_eq!(event.gateway_order_id, "abc123");
        assert_eq!(event.gateway_amount, 240_000.0);
        assert_eq!(event.outcome, GatewayOutcome::Succeeded);
        assert_eq!(event.gateway_txn_id.as_deref(), Some("14123456"));
    }

    #[test]
    fn test_cancelled_payment_is_failure_and_tamper_rejected() {
        let gateway = VnpayGateway::new(config("http://unused")).unwrap();
        let event = gateway.verify_webhook(&signed_return(&gateway, "24", "24000000")).unwrap();
        assert!(matches!(event.outcome, GatewayOutcome::Failed(_)));

        let mut tampered = signed_return(&gateway, "00", "24000000");
        tampered.params.insert("vnp_Amount".into(), "100".into());
        assert!(matches!(
            gateway.verify_webhook(&tampered),
            Err(CoreError::InvalidWebhookSignature(_))
        ));
    }

    #[tokio::test]
    async fn test_querydr_reports_success() {
        let signer = VnpayGateway::new(config("http://unused")).unwrap();
        let response = signed_query_response(
            &signer,
            json!({
                "vnp_ResponseId": "r-1",
                "vnp_Command": "querydr",
                "vnp_ResponseCode": "00",
                "vnp_TmnCode": "CINETEST",
                "vnp_TxnRef": "abc123",
                "vnp_TransactionStatus": "00",
                "vnp_Amount": "24000000",
                "vnp_TransactionNo": "14123456"
            }),
        );
        let (_server, gateway) = query_server(response).await;

        let result = gateway.capture(&payment()).await.unwrap();
        assert_eq!(result.outcome, GatewayOutcome::Succeeded);
        assert_eq!(result.gateway_amount, 240_000.0);
        assert_eq!(result.gateway_txn_id.as_deref(), Some("14123456"));
    }

    #[tokio::test]
    async fn test_querydr_success_without_amount_is_rejected() {
        let signer = VnpayGateway::new(config("http://unused")).unwrap();
        let response = signed_query_response(
            &signer,
            json!({
                "vnp_ResponseCode": "00",
                "vnp_TmnCode": "CINETEST",
                "vnp_TxnRef": "abc123",
                "vnp_TransactionStatus": "00"
            }),
        );
        let (_server, gateway) = query_server(response).await;

        let err = gateway.capture(&payment()).await.unwrap_err();
        assert!(matches!(err, CoreError::Gateway(_)));
    }

    #[tokio::test]
    async fn test_querydr_unsigned_or_forged_is_rejected() {
        let (_server, gateway) = query_server(json!({
            "vnp_ResponseCode": "00",
            "vnp_TransactionStatus": "00",
            "vnp_Amount": "24000000"
        }))
        .await;
        assert!(matches!(gateway.capture(&payment()).await, Err(CoreError::Gateway(_))));

        let signer = VnpayGateway::new(config("http://unused")).unwrap();
        let mut forged = signed_query_response(
            &signer,
            json!({
                "vnp_ResponseCode": "00",
                "vnp_TmnCode": "CINETEST",
                "vnp_TxnRef": "abc123",
                "vnp_TransactionStatus": "00",
                "vnp_Amount": "100"
            }),
        );
        forged["vnp_Amount"] = json!("24000000");
        let (_server, gateway) = query_server(forged).await;
        assert!(matches!(gateway.capture(&payment()).await, Err(CoreError::Gateway(_))));
    }

    #[tokio::test]
    async fn test_refund_rejection_is_gateway_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/merchant_webapi/api/transaction"))
            .and(body_partial_json(json!({ "vnp_Command": "refund", "vnp_Amount": 24000000 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "vnp_ResponseCode": "94",
                "vnp_Message": "Duplicate request"
            })))
            .mount(&server)
            .await;

        let gateway =
            VnpayGateway::new(config(&format!("{}/merchant_webapi/api/transaction", server.uri()))).unwrap();
        let err = gateway.refund(&payment(), 240_000.0, "customer request").await.unwrap_err();
        assert!(matches!(err, CoreError::Gateway(_)));
    }
}
