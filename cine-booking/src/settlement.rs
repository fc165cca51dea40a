use chrono::{DateTime, Utc};
use cine_core::{
    Booking, BookingStatus, CoreError, CoreResult, GatewayOutcome, OrderRequest, Payment, PaymentGateway,
    PaymentMethod, PaymentRepository, PaymentStatus, RefundStatus, VerifiedEvent, WebhookPayload, WebhookResult,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::BookingContext;
use crate::gateways::GatewayRegistry;
use crate::mutex::KeyedMutex;
use crate::orchestrator::{BookingOrchestrator, ConfirmRequest, SettlementOutcome};

/// A gateway order the client should be sent to
#[derive(Debug, Clone, Serialize)]
pub struct PaymentOrder {
    pub payment_id: Uuid,
    pub booking_id: Uuid,
    pub method: PaymentMethod,
    pub amount: f64,
    pub currency: String,
    pub gateway_amount: f64,
    pub gateway_currency: String,
    pub gateway_order_id: Option<String>,
    pub approval_url: Option<String>,
    pub payment_expires_at: DateTime<Utc>,
    /// An existing pending order was handed back instead of a new one
    pub reused: bool,
}

impl PaymentOrder {
    fn new(payment: &Payment, booking: &Booking, reused: bool) -> Self {
        Self {
            payment_id: payment.id,
            booking_id: booking.id,
            method: payment.method,
            amount: payment.amount,
            currency: payment.currency.clone(),
            gateway_amount: payment.gateway_amount,
            gateway_currency: payment.gateway_currency.clone(),
            gateway_order_id: payment.gateway_order_id.clone(),
            approval_url: payment.approval_url.clone(),
            payment_expires_at: booking.payment_expires_at,
            reused,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResult {
    pub booking: Booking,
    pub order: PaymentOrder,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureSummary {
    pub payment_id: Uuid,
    pub booking_id: Uuid,
    pub payment_status: PaymentStatus,
    pub booking_status: BookingStatus,
    /// `None` when the payment had already left `PENDING`
    pub outcome: Option<SettlementOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundSummary {
    pub refund_id: Uuid,
    pub payment_id: Uuid,
    pub booking_id: Uuid,
    pub amount: f64,
    pub status: RefundStatus,
    pub gateway_refund_txn_id: Option<String>,
}

/// Gateway-facing side of payments: order creation, webhooks, capture and
/// refunds. Everything that touches an existing payment runs under that
/// payment's mutex.
pub struct SettlementService {
    ctx: BookingContext,
    orchestrator: Arc<BookingOrchestrator>,
    gateways: GatewayRegistry,
    mutex: KeyedMutex,
}

impl SettlementService {
    pub fn new(ctx: BookingContext, orchestrator: Arc<BookingOrchestrator>, gateways: GatewayRegistry) -> Self {
        let mutex = KeyedMutex::new(ctx.locks.clone(), Duration::from_millis(ctx.rules.webhook_lock_ttl_ms));
        Self { ctx, orchestrator, gateways, mutex }
    }

    pub fn gateways(&self) -> &GatewayRegistry {
        &self.gateways
    }

    /// Build a pending payment and register it with the gateway. Nothing is
    /// persisted here.
    async fn open_order(
        &self,
        booking: &Booking,
        gateway: &dyn PaymentGateway,
        client_ip: Option<String>,
    ) -> CoreResult<Payment> {
        let quote = gateway.quote(booking.final_price);
        let now = self.ctx.clock.now();
        let mut payment = Payment {
            id: Uuid::new_v4(),
            booking_id: booking.id,
            method: gateway.method(),
            amount: booking.final_price,
            currency: self.ctx.rules.currency.clone(),
            gateway_amount: quote.amount,
            gateway_currency: gateway.currency().to_string(),
            exchange_rate: quote.exchange_rate,
            gateway_order_id: None,
            gateway_txn_id: None,
            approval_url: None,
            status: PaymentStatus::Pending,
            error_message: None,
            created_at: now,
            completed_at: None,
            updated_at: now,
        };

        let order = gateway
            .create_order(&OrderRequest {
                payment_id: payment.id,
                booking_id: booking.id,
                gateway_amount: quote.amount,
                description: format!("Cinema booking {}", booking.id.simple()),
                client_ip,
            })
            .await?;
        payment.gateway_order_id = Some(order.gateway_order_id);
        payment.approval_url = Some(order.approval_url);
        Ok(payment)
    }

    /// Start (or resume) payment for a pending booking.
    ///
    /// `requester` is checked against the booking owner when present; guest
    /// callers pay by booking id.
    pub async fn create_order(
        &self,
        booking_id: Uuid,
        method: PaymentMethod,
        requester: Option<Uuid>,
        client_ip: Option<String>,
    ) -> CoreResult<PaymentOrder> {
        let gateway = self.gateways.get(method)?;
        let booking = self.orchestrator.get_booking(booking_id).await?;
        if requester.is_some_and(|user_id| user_id != booking.user_id) {
            return Err(CoreError::DomainConflict(format!("booking {} belongs to another customer", booking_id)));
        }

        let now = self.ctx.clock.now();
        if booking.status != BookingStatus::PendingPayment {
            return Err(CoreError::DomainConflict(format!(
                "booking {} is {} and does not accept payment",
                booking_id, booking.status
            )));
        }
        if booking.is_payment_overdue(now) {
            return Err(CoreError::DomainConflict(format!("payment window for booking {} has closed", booking_id)));
        }

        if let Some(mut open) = self.ctx.store.find_open_payment(booking_id).await? {
            if open.method == method && open.gateway_order_id.is_some() {
                info!("Reusing pending payment {} for booking {}", open.id, booking_id);
                return Ok(PaymentOrder::new(&open, &booking, true));
            }
            open.transition(PaymentStatus::Cancelled, now)?;
            open.error_message = Some(format!("superseded by a {} payment", method));
            if !self.ctx.store.update_payment(&open, PaymentStatus::Pending).await? {
                return Err(CoreError::DomainConflict(format!("payment {} changed, retry", open.id)));
            }
            info!("Cancelled pending {} payment {} for booking {}", open.method, open.id, booking_id);
        }

        let payment = self.open_order(&booking, gateway.as_ref(), client_ip).await?;
        self.ctx.store.insert_payment(&payment).await?;
        info!("Opened {} payment {} for booking {}", method, payment.id, booking_id);
        Ok(PaymentOrder::new(&payment, &booking, false))
    }

    /// Confirm and pay in one step. The gateway order is created before the
    /// booking is written, so a gateway failure leaves the lock untouched.
    pub async fn checkout(
        &self,
        request: &ConfirmRequest,
        method: PaymentMethod,
        client_ip: Option<String>,
    ) -> CoreResult<CheckoutResult> {
        let gateway = self.gateways.get(method)?;
        let (booking, lock) = self.orchestrator.prepare_booking(request).await?;

        let payment = match self.open_order(&booking, gateway.as_ref(), client_ip).await {
            Ok(payment) => payment,
            Err(e) => {
                warn!("Checkout for lock {} stopped, gateway order failed: {}", lock.id, e);
                return Err(e);
            }
        };
        self.orchestrator.commit_booking(&booking, &lock, Some(&payment)).await?;

        Ok(CheckoutResult { order: PaymentOrder::new(&payment, &booking, false), booking })
    }

    /// Verify and apply a gateway notification. Always yields the gateway's
    /// acknowledgement body; failures become a failure code in it.
    pub async fn handle_webhook(&self, method: PaymentMethod, payload: &WebhookPayload) -> CoreResult<Value> {
        let gateway = self.gateways.get(method)?;
        let result = self.process_webhook(gateway.as_ref(), payload).await;
        Ok(gateway.acknowledge(result))
    }

    async fn process_webhook(&self, gateway: &dyn PaymentGateway, payload: &WebhookPayload) -> WebhookResult {
        let method = gateway.method();
        let event = match gateway.verify_webhook(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Rejected {} webhook: {}", method, e);
                return WebhookResult::InvalidSignature;
            }
        };

        let payment = match self.ctx.store.find_payment_by_gateway_order(method, &event.gateway_order_id).await {
            Ok(Some(payment)) => payment,
            Ok(None) => {
                warn!("{} webhook for unknown order {}", method, event.gateway_order_id);
                return WebhookResult::UnknownOrder;
            }
            Err(e) => {
                error!("Could not look up {} order {}: {}", method, event.gateway_order_id, e);
                return WebhookResult::RetryLater;
            }
        };

        let key = KeyedMutex::payment_key(payment.id);
        match self.mutex.run(&key, || self.apply_event(payment.id, &event)).await {
            Ok(Some(Ok(outcome))) => {
                info!("{} webhook for payment {}: {:?}", method, payment.id, outcome);
                outcome.webhook_result()
            }
            Ok(Some(Err(e))) => {
                error!("Failed to apply {} webhook for payment {}: {}", method, payment.id, e);
                WebhookResult::RetryLater
            }
            Ok(None) => WebhookResult::RetryLater,
            Err(e) => {
                error!("Payment mutex unavailable for {}: {}", payment.id, e);
                WebhookResult::RetryLater
            }
        }
    }

    async fn apply_event(&self, payment_id: Uuid, event: &VerifiedEvent) -> CoreResult<SettlementOutcome> {
        match &event.outcome {
            GatewayOutcome::Succeeded => {
                self.orchestrator
                    .handle_successful_payment(payment_id, event.gateway_amount, event.gateway_txn_id.as_deref())
                    .await
            }
            GatewayOutcome::Failed(reason) => self.orchestrator.handle_failed_payment(payment_id, reason).await,
            GatewayOutcome::Pending => Ok(SettlementOutcome::Ignored),
        }
    }

    /// Ask the gateway where a payment stands and apply the answer, for
    /// clients returning from the gateway before the webhook lands.
    pub async fn capture(&self, payment_id: Uuid, requester: Option<Uuid>) -> CoreResult<CaptureSummary> {
        let payment = self.orchestrator.get_payment(payment_id).await?;
        if let Some(user_id) = requester {
            let booking = self.orchestrator.get_booking(payment.booking_id).await?;
            if booking.user_id != user_id {
                return Err(CoreError::DomainConflict(format!("payment {} belongs to another customer", payment_id)));
            }
        }
        let gateway = self.gateways.get(payment.method)?;

        let key = KeyedMutex::payment_key(payment_id);
        let outcome = self
            .mutex
            .run(&key, || self.capture_locked(payment_id, gateway.as_ref()))
            .await?
            .ok_or_else(|| CoreError::DomainConflict(format!("payment {} is being processed, retry", payment_id)))??;

        let payment = self.orchestrator.get_payment(payment_id).await?;
        let booking = self.orchestrator.get_booking(payment.booking_id).await?;
        Ok(CaptureSummary {
            payment_id,
            booking_id: booking.id,
            payment_status: payment.status,
            booking_status: booking.status,
            outcome,
        })
    }

    async fn capture_locked(
        &self,
        payment_id: Uuid,
        gateway: &dyn PaymentGateway,
    ) -> CoreResult<Option<SettlementOutcome>> {
        let payment = self.orchestrator.get_payment(payment_id).await?;
        if payment.status != PaymentStatus::Pending {
            return Ok(None);
        }

        let result = gateway.capture(&payment).await?;
        let outcome = match result.outcome {
            GatewayOutcome::Succeeded => {
                self.orchestrator
                    .handle_successful_payment(payment_id, result.gateway_amount, result.gateway_txn_id.as_deref())
                    .await?
            }
            GatewayOutcome::Failed(reason) => self.orchestrator.handle_failed_payment(payment_id, &reason).await?,
            GatewayOutcome::Pending => SettlementOutcome::Ignored,
        };
        Ok(Some(outcome))
    }

    /// Full refund of a completed payment. A gateway failure rolls the
    /// payment back to `COMPLETED` and is returned to the caller.
    pub async fn request_refund(&self, payment_id: Uuid, reason: &str) -> CoreResult<RefundSummary> {
        let payment = self.orchestrator.get_payment(payment_id).await?;
        let gateway = self.gateways.get(payment.method)?;

        let key = KeyedMutex::payment_key(payment_id);
        self.mutex
            .run(&key, || self.refund_locked(payment_id, reason, gateway.as_ref()))
            .await?
            .ok_or_else(|| CoreError::DomainConflict(format!("payment {} is being processed, retry", payment_id)))?
    }

    async fn refund_locked(
        &self,
        payment_id: Uuid,
        reason: &str,
        gateway: &dyn PaymentGateway,
    ) -> CoreResult<RefundSummary> {
        let (payment, refund) = self.orchestrator.begin_refund(payment_id, reason).await?;

        match gateway.refund(&payment, refund.amount, &refund.reason).await {
            Ok(gateway_refund_txn_id) => {
                let booking = self
                    .orchestrator
                    .handle_refund_success(payment_id, refund.clone(), gateway_refund_txn_id.clone())
                    .await?;
                Ok(RefundSummary {
                    refund_id: refund.id,
                    payment_id,
                    booking_id: booking.id,
                    amount: refund.amount,
                    status: RefundStatus::Completed,
                    gateway_refund_txn_id: Some(gateway_refund_txn_id),
                })
            }
            Err(e) => {
                self.orchestrator.handle_refund_failure(payment_id, refund, &e.to_string()).await?;
                Err(e)
            }
        }
    }
}
