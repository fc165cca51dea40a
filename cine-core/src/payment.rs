use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Momo,
    Vnpay,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Momo => "momo",
            PaymentMethod::Vnpay => "vnpay",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "momo" => Ok(PaymentMethod::Momo),
            "vnpay" => Ok(PaymentMethod::Vnpay),
            other => Err(CoreError::ValidationError(format!("unsupported payment method {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    RefundPending,
    Refunded,
    Cancelled,
}

impl PaymentStatus {
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Cancelled)
                // money arrived for a superseded order and goes back
                | (Cancelled, Failed)
                | (Completed, RefundPending)
                | (RefundPending, Refunded)
                | (RefundPending, Completed)
        )
    }

    /// Non-terminal payments block a second payment for the same booking.
    pub fn is_open(&self) -> bool {
        matches!(self, PaymentStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::RefundPending => "REFUND_PENDING",
            PaymentStatus::Refunded => "REFUNDED",
            PaymentStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PaymentStatus::Pending),
            "COMPLETED" => Ok(PaymentStatus::Completed),
            "FAILED" => Ok(PaymentStatus::Failed),
            "REFUND_PENDING" => Ok(PaymentStatus::RefundPending),
            "REFUNDED" => Ok(PaymentStatus::Refunded),
            "CANCELLED" => Ok(PaymentStatus::Cancelled),
            other => Err(CoreError::Storage(format!("unknown payment status {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    Pending,
    Completed,
    Failed,
}

impl RefundStatus {
    pub fn can_transition_to(&self, next: RefundStatus) -> bool {
        matches!(
            (self, next),
            (RefundStatus::Pending, RefundStatus::Completed) | (RefundStatus::Pending, RefundStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "PENDING",
            RefundStatus::Completed => "COMPLETED",
            RefundStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefundStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RefundStatus::Pending),
            "COMPLETED" => Ok(RefundStatus::Completed),
            "FAILED" => Ok(RefundStatus::Failed),
            other => Err(CoreError::Storage(format!("unknown refund status {}", other))),
        }
    }
}

/// One attempt to settle a booking through one gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub method: PaymentMethod,
    pub amount: f64,
    pub currency: String,
    /// What the gateway is expected to report back
    pub gateway_amount: f64,
    pub gateway_currency: String,
    pub exchange_rate: f64,
    pub gateway_order_id: Option<String>,
    pub gateway_txn_id: Option<String>,
    pub approval_url: Option<String>,
    pub status: PaymentStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn transition(&mut self, next: PaymentStatus, now: DateTime<Utc>) -> CoreResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                entity: "payment",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = now;
        if next == PaymentStatus::Completed && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> CoreResult<()> {
        self.transition(PaymentStatus::Failed, now)?;
        self.error_message = Some(reason.into());
        Ok(())
    }

    /// Gateways report whole units; anything under half a unit is rounding noise.
    pub fn matches_gateway_amount(&self, reported: f64) -> bool {
        (self.gateway_amount - reported).abs() < 0.5
    }
}

/// A compensating action against a completed payment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Refund {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub booking_id: Uuid,
    pub amount: f64,
    pub reason: String,
    pub gateway_refund_txn_id: Option<String>,
    pub status: RefundStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Refund {
    pub fn pending(payment: &Payment, amount: f64, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_id: payment.id,
            booking_id: payment.booking_id,
            amount,
            reason: reason.into(),
            gateway_refund_txn_id: None,
            status: RefundStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: RefundStatus, now: DateTime<Utc>) -> CoreResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                entity: "refund",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

// ============================================================================
// Gateway contract
// ============================================================================

/// Amount converted into what the gateway charges
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatewayQuote {
    pub amount: f64,
    pub exchange_rate: f64,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub payment_id: Uuid,
    pub booking_id: Uuid,
    pub gateway_amount: f64,
    pub description: String,
    pub client_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayOrder {
    pub gateway_order_id: String,
    pub approval_url: String,
}

/// Raw webhook parameters as delivered (query string or JSON body, flattened)
#[derive(Debug, Clone, Default)]
pub struct WebhookPayload {
    pub params: BTreeMap<String, String>,
}

impl WebhookPayload {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayOutcome {
    Succeeded,
    Failed(String),
    Pending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedEvent {
    pub gateway_order_id: String,
    pub gateway_txn_id: Option<String>,
    pub gateway_amount: f64,
    pub outcome: GatewayOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    pub gateway_txn_id: Option<String>,
    pub gateway_amount: f64,
    pub outcome: GatewayOutcome,
}

/// How a webhook delivery was handled; gateways translate this into their
/// own acknowledgement body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookResult {
    Processed,
    AlreadyProcessed,
    AmountMismatch,
    UnknownOrder,
    InvalidSignature,
    RetryLater,
}

/// Gateway-agnostic settlement contract
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn method(&self) -> PaymentMethod;

    /// Convert a booking amount into the gateway's currency.
    fn quote(&self, amount: f64) -> GatewayQuote;

    fn currency(&self) -> &str;

    async fn create_order(&self, request: &OrderRequest) -> CoreResult<GatewayOrder>;

    /// Recompute the gateway signature and parse the event. Any mismatch is
    /// `InvalidWebhookSignature`.
    fn verify_webhook(&self, payload: &WebhookPayload) -> CoreResult<VerifiedEvent>;

    /// Ask the gateway for the authoritative state of an order.
    async fn capture(&self, payment: &Payment) -> CoreResult<CaptureResult>;

    /// Returns the gateway refund transaction id.
    async fn refund(&self, payment: &Payment, amount: f64, reason: &str) -> CoreResult<String>;

    fn acknowledge(&self, result: WebhookResult) -> serde_json::Value;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment() -> Payment {
        let now = Utc::now();
        Payment {
            id: Uuid::new_v4(),
            booking_id: Uuid::new_v4(),
            method: PaymentMethod::Momo,
            amount: 240_000.0,
            currency: "VND".into(),
            gateway_amount: 240_000.0,
            gateway_currency: "VND".into(),
            exchange_rate: 1.0,
            gateway_order_id: None,
            gateway_txn_id: None,
            approval_url: None,
            status: PaymentStatus::Pending,
            error_message: None,
            created_at: now,
            completed_at: None,
            updated_at: now,
        }
    }

    #[test]
    fn test_completed_payment_cannot_fail() {
        let mut p = payment();
        p.transition(PaymentStatus::Completed, Utc::now()).unwrap();
        assert!(p.completed_at.is_some());
        assert!(p.fail("late failure", Utc::now()).is_err());
        assert_eq!(p.status, PaymentStatus::Completed);
    }

    #[test]
    fn test_refund_pending_can_roll_back() {
        let mut p = payment();
        p.transition(PaymentStatus::Completed, Utc::now()).unwrap();
        p.transition(PaymentStatus::RefundPending, Utc::now()).unwrap();
        p.transition(PaymentStatus::Completed, Utc::now()).unwrap();
        assert_eq!(p.status, PaymentStatus::Completed);
    }

    #[test]
    fn test_cancelled_payment_can_only_fail() {
        let mut p = payment();
        p.transition(PaymentStatus::Cancelled, Utc::now()).unwrap();
        assert!(p.transition(PaymentStatus::Completed, Utc::now()).is_err());
        p.fail("paid after being superseded", Utc::now()).unwrap();
        assert_eq!(p.status, PaymentStatus::Failed);
    }

    #[test]
    fn test_gateway_amount_tolerance() {
        let p = payment();
        assert!(p.matches_gateway_amount(240_000.0));
        assert!(!p.matches_gateway_amount(239_000.0));
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("MoMo".parse::<PaymentMethod>().unwrap(), PaymentMethod::Momo);
        assert!("paypal".parse::<PaymentMethod>().is_err());
    }
}
