use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cine_core::{
    Booking, BookingRepository, BookingSeatLine, BookingSnackLine, BookingStatus, BookingTransition,
    CatalogRepository, CoreError, CoreResult, LockOwner, PartyResolver, Payment, PaymentRepository, PaymentStatus,
    PricingRepository, Refund, RefundMetadata, RefundStatus, SeatEffect, SeatLock, SeatLockLine,
    SeatLockRepository, ShowtimeSeat, WebhookResult,
};
use cine_pricing::{calculate_discounts, round_to, DiscountResult, PriceBreakdown, PricingEngine, TicketType};
use cine_shared::{BookingEvent, Masked};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::BookingContext;
use crate::gateways::GatewayRegistry;
use crate::locking::release_seat_keys;

const SWEEP_BATCH: i64 = 100;
const LATE_REFUND_REASON: &str = "Seats no longer available for late payment";
const SUPERSEDED_REFUND_REASON: &str = "Payment replaced by another payment method";
const GUARD_RETRIES: usize = 3;

/// Who pays for a booking
#[derive(Debug, Clone, PartialEq)]
pub enum Payer {
    User(Uuid),
    Guest {
        email: String,
        full_name: String,
        phone: Option<String>,
    },
}

impl Payer {
    pub fn is_guest(&self) -> bool {
        matches!(self, Payer::Guest { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnackSelection {
    pub snack_id: Uuid,
    pub quantity: u32,
}

#[derive(Debug, Clone)]
pub struct ConfirmRequest {
    pub lock_id: Uuid,
    pub owner: LockOwner,
    pub payer: Payer,
    pub promotion_code: Option<String>,
    pub snacks: Vec<SnackSelection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PricedSeat {
    pub showtime_seat_id: Uuid,
    pub label: String,
    pub ticket_type_id: Uuid,
    pub ticket_type_name: String,
    pub price: f64,
    pub breakdown: PriceBreakdown,
}

/// What a booking made from this lock would cost right now
#[derive(Debug, Clone, Serialize)]
pub struct PricePreview {
    pub lock_id: Uuid,
    pub showtime_id: Uuid,
    pub seats: Vec<PricedSeat>,
    pub snacks: Vec<BookingSnackLine>,
    pub ticket_subtotal: f64,
    pub snack_subtotal: f64,
    pub subtotal: f64,
    pub discount: DiscountResult,
    pub final_price: f64,
    pub loyalty_points: i64,
    pub snapshot_version: i64,
}

/// How a payment event was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementOutcome {
    Confirmed,
    AlreadyConfirmed,
    /// An expired booking was confirmed again by a late payment
    Reinstated,
    AmountMismatch,
    /// Money that could not be honoured went back automatically
    Refunded,
    /// Same, but the automatic refund failed and needs manual follow-up
    RefundFailed,
    Failed,
    Ignored,
}

impl SettlementOutcome {
    pub fn webhook_result(&self) -> WebhookResult {
        match self {
            SettlementOutcome::AlreadyConfirmed | SettlementOutcome::Ignored => WebhookResult::AlreadyProcessed,
            SettlementOutcome::AmountMismatch => WebhookResult::AmountMismatch,
            _ => WebhookResult::Processed,
        }
    }
}

/// Booking lifecycle: lock to booking, then every payment-driven transition.
///
/// Each transition is a single `commit_transition` guarded on the statuses
/// it read, so a concurrent sweep or webhook that got there first makes the
/// later one a no-op instead of a double write.
pub struct BookingOrchestrator {
    ctx: BookingContext,
    engine: PricingEngine,
    gateways: GatewayRegistry,
}

impl BookingOrchestrator {
    pub fn new(ctx: BookingContext, engine: PricingEngine, gateways: GatewayRegistry) -> Self {
        Self { ctx, engine, gateways }
    }

    fn now(&self) -> DateTime<Utc> {
        self.ctx.clock.now()
    }

    fn loyalty_points(&self, final_price: f64) -> i64 {
        let rules = &self.ctx.rules;
        if rules.loyalty_unit_amount <= 0.0 || final_price <= 0.0 {
            return 0;
        }
        (final_price / rules.loyalty_unit_amount).floor() as i64 * rules.loyalty_points_per_unit
    }

    pub async fn get_booking(&self, booking_id: Uuid) -> CoreResult<Booking> {
        self.ctx
            .store
            .get_booking(booking_id)
            .await?
            .ok_or_else(|| CoreError::not_found("booking", booking_id))
    }

    pub async fn get_payment(&self, payment_id: Uuid) -> CoreResult<Payment> {
        self.ctx
            .store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| CoreError::not_found("payment", payment_id))
    }

    async fn validate_lock(&self, lock_id: Uuid, owner: &LockOwner) -> CoreResult<(SeatLock, Vec<SeatLockLine>)> {
        let now = self.now();
        let (lock, lines) = match self.ctx.store.get_lock(lock_id).await? {
            Some((lock, lines)) if !lock.is_expired(now) => (lock, lines),
            _ => return Err(CoreError::LockExpired(lock_id)),
        };
        if !lock.is_owned_by(owner) {
            return Err(CoreError::DomainConflict(format!("seat lock {} belongs to another session", lock_id)));
        }
        Ok((lock, lines))
    }

    /// Reprice a lock against the current snapshot. Lock-time prices are
    /// never reused.
    async fn quote(
        &self,
        lock: &SeatLock,
        lines: &[SeatLockLine],
        payer: &Payer,
        promotion_code: Option<&str>,
        snacks: &[SnackSelection],
    ) -> CoreResult<PricePreview> {
        let store = &self.ctx.store;
        let showtime = store
            .get_showtime(lock.showtime_id)
            .await?
            .ok_or_else(|| CoreError::not_found("showtime", lock.showtime_id))?;

        let seat_ids: Vec<Uuid> = lines.iter().map(|l| l.showtime_seat_id).collect();
        let seats: HashMap<Uuid, ShowtimeSeat> = store
            .get_showtime_seats(showtime.id, &seat_ids)
            .await?
            .into_iter()
            .map(|s| (s.id, s))
            .collect();

        let snapshot = store.load_snapshot().await?;
        let mut ticket_types: HashMap<Uuid, TicketType> = HashMap::new();
        let mut priced = Vec::with_capacity(lines.len());
        for line in lines {
            let seat = seats
                .get(&line.showtime_seat_id)
                .ok_or_else(|| CoreError::not_found("showtime seat", line.showtime_seat_id))?;
            if !ticket_types.contains_key(&line.ticket_type_id) {
                let ticket = store
                    .get_ticket_type(line.ticket_type_id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("ticket type", line.ticket_type_id))?;
                ticket_types.insert(ticket.id, ticket);
            }
            let ticket = &ticket_types[&line.ticket_type_id];
            let (price, breakdown) = self.engine.price_seat(&snapshot, &showtime.pricing_context(seat), ticket)?;
            priced.push(PricedSeat {
                showtime_seat_id: seat.id,
                label: seat.label(),
                ticket_type_id: ticket.id,
                ticket_type_name: ticket.name.clone(),
                price,
                breakdown,
            });
        }

        let mut snack_lines = Vec::with_capacity(snacks.len());
        for selection in snacks {
            if selection.quantity == 0 {
                return Err(CoreError::ValidationError(format!(
                    "snack {} needs a quantity of at least 1",
                    selection.snack_id
                )));
            }
            let snack = store
                .get_snack(selection.snack_id)
                .await?
                .ok_or_else(|| CoreError::not_found("snack", selection.snack_id))?;
            if !snack.is_active {
                return Err(CoreError::ValidationError(format!("snack {} is not on sale", snack.name)));
            }
            snack_lines.push(BookingSnackLine {
                snack_id: snack.id,
                name: snack.name,
                quantity: selection.quantity,
                unit_price: snack.price,
                total: round_to(snack.price * selection.quantity as f64, 2),
            });
        }

        let ticket_subtotal = round_to(priced.iter().map(|p| p.price).sum(), 2);
        let snack_subtotal = round_to(snack_lines.iter().map(|s| s.total).sum(), 2);
        let subtotal = round_to(ticket_subtotal + snack_subtotal, 2);

        let tier = match payer {
            Payer::User(user_id) => store.membership_tier_for(*user_id).await?,
            Payer::Guest { .. } => None,
        };
        let promotion = match promotion_code.map(str::trim).filter(|c| !c.is_empty()) {
            None => None,
            Some(_) if payer.is_guest() => {
                return Err(CoreError::ValidationError(
                    "promotion codes are only available to signed-in customers".into(),
                ))
            }
            Some(code) => {
                let promotion = store
                    .find_promotion(code)
                    .await?
                    .ok_or_else(|| CoreError::not_found("promotion", code))?;
                promotion.check_redeemable(subtotal, self.now())?;
                Some(promotion)
            }
        };

        let discount = calculate_discounts(subtotal, tier.as_ref(), promotion.as_ref());
        let final_price = round_to((subtotal - discount.total_discount).max(0.0), 2);

        Ok(PricePreview {
            lock_id: lock.id,
            showtime_id: showtime.id,
            seats: priced,
            snacks: snack_lines,
            ticket_subtotal,
            snack_subtotal,
            subtotal,
            discount,
            final_price,
            loyalty_points: self.loyalty_points(final_price),
            snapshot_version: snapshot.version,
        })
    }

    pub async fn price_preview(&self, request: &ConfirmRequest) -> CoreResult<PricePreview> {
        let (lock, lines) = self.validate_lock(request.lock_id, &request.owner).await?;
        self.quote(&lock, &lines, &request.payer, request.promotion_code.as_deref(), &request.snacks)
            .await
    }

    /// Build the booking a lock would turn into. Nothing is written except
    /// a guest party, which is idempotent by email.
    pub(crate) async fn prepare_booking(&self, request: &ConfirmRequest) -> CoreResult<(Booking, SeatLock)> {
        let (lock, lines) = self.validate_lock(request.lock_id, &request.owner).await?;
        let preview = self
            .quote(&lock, &lines, &request.payer, request.promotion_code.as_deref(), &request.snacks)
            .await?;

        let user_id = match &request.payer {
            Payer::User(user_id) => *user_id,
            Payer::Guest { email, full_name, phone } => {
                let email = email.trim();
                if email.is_empty() || !email.contains('@') {
                    return Err(CoreError::ValidationError("a valid guest email is required".into()));
                }
                let guest_id = self
                    .ctx
                    .store
                    .resolve_or_create_guest(email, full_name.trim(), phone.as_deref())
                    .await?;
                debug!("Guest {} resolved to user {}", Masked::new(email.to_string()).redacted(), guest_id);
                guest_id
            }
        };

        let now = self.now();
        let booking = Booking {
            id: Uuid::new_v4(),
            user_id,
            showtime_id: lock.showtime_id,
            seats: preview
                .seats
                .iter()
                .map(|s| BookingSeatLine {
                    showtime_seat_id: s.showtime_seat_id,
                    ticket_type_id: s.ticket_type_id,
                    price: s.price,
                })
                .collect(),
            snacks: preview.snacks,
            promotion_code: preview.discount.promotion_code.clone(),
            subtotal: preview.subtotal,
            discount_amount: preview.discount.total_discount,
            discount_reason: preview.discount.reason.clone(),
            final_price: preview.final_price,
            status: BookingStatus::PendingPayment,
            booked_at: now,
            payment_expires_at: now + ChronoDuration::minutes(self.ctx.rules.payment_timeout_minutes),
            qr_payload: None,
            loyalty_points: preview.loyalty_points,
            loyalty_points_awarded: false,
            refund: None,
            updated_at: now,
        };
        Ok((booking, lock))
    }

    /// The lock becomes the booking (and optionally its first payment) in one
    /// unit of work; the lock-store keys are dropped afterwards.
    pub(crate) async fn commit_booking(
        &self,
        booking: &Booking,
        lock: &SeatLock,
        payment: Option<&Payment>,
    ) -> CoreResult<()> {
        self.ctx
            .store
            .insert_booking_from_lock(lock.id, self.now(), booking, payment)
            .await?;

        let seat_ids = booking.seat_ids();
        release_seat_keys(&self.ctx, lock.showtime_id, &seat_ids, &lock.lock_token).await;

        info!(
            "Booking {} created from lock {} for {} seats, total {}",
            booking.id,
            lock.id,
            seat_ids.len(),
            booking.final_price
        );
        self.ctx.publish(BookingEvent::SeatsBooked {
            showtime_id: booking.showtime_id,
            booking_id: booking.id,
            seat_ids,
        });
        Ok(())
    }

    pub async fn confirm_booking(&self, request: &ConfirmRequest) -> CoreResult<Booking> {
        let (booking, lock) = self.prepare_booking(request).await?;
        self.commit_booking(&booking, &lock, None).await?;
        Ok(booking)
    }

    pub async fn handle_successful_payment(
        &self,
        payment_id: Uuid,
        gateway_amount: f64,
        gateway_txn_id: Option<&str>,
    ) -> CoreResult<SettlementOutcome> {
        let mut payment = self.get_payment(payment_id).await?;
        let mut booking = self.get_booking(payment.booking_id).await?;

        if payment.status == PaymentStatus::Completed && booking.status == BookingStatus::Confirmed {
            debug!("Payment {} already settled", payment.id);
            return Ok(SettlementOutcome::AlreadyConfirmed);
        }
        if payment.status == PaymentStatus::Cancelled {
            return self.handle_superseded_payment(payment, gateway_amount, gateway_txn_id).await;
        }
        if payment.status != PaymentStatus::Pending {
            warn!("Ignoring success for payment {} in status {}", payment.id, payment.status);
            return Ok(SettlementOutcome::Ignored);
        }
        if booking.status == BookingStatus::Expired {
            return self.handle_late_payment(payment, booking, gateway_amount, gateway_txn_id).await;
        }
        if booking.status != BookingStatus::PendingPayment {
            warn!("Ignoring success for payment {}: booking {} is {}", payment.id, booking.id, booking.status);
            return Ok(SettlementOutcome::Ignored);
        }
        if !payment.matches_gateway_amount(gateway_amount) {
            let expected = payment.gateway_amount;
            error!("Payment {} reported {} but {} was expected", payment.id, gateway_amount, expected);
            let reason = CoreError::GatewayAmountMismatch { expected, actual: gateway_amount }.to_string();
            self.fail_payment(payment, booking, reason).await?;
            return Ok(SettlementOutcome::AmountMismatch);
        }

        let now = self.now();
        booking.confirm(now)?;
        let points = booking.take_loyalty_award();
        if let Some(txn) = gateway_txn_id {
            payment.gateway_txn_id = Some(txn.to_string());
        }
        payment.transition(PaymentStatus::Completed, now)?;

        let transition = BookingTransition::new(booking.clone(), BookingStatus::PendingPayment)
            .with_payment(payment.clone(), PaymentStatus::Pending)
            .loyalty(points);
        if !self.ctx.store.commit_transition(&transition).await? {
            warn!("Booking {} changed while confirming payment {}", booking.id, payment.id);
            return Ok(SettlementOutcome::Ignored);
        }

        info!("Booking {} confirmed by payment {} (+{} points)", booking.id, payment.id, points);
        self.ctx.publish(BookingEvent::BookingConfirmed {
            showtime_id: booking.showtime_id,
            booking_id: booking.id,
            final_price: booking.final_price,
            timestamp: now.timestamp(),
        });
        Ok(SettlementOutcome::Confirmed)
    }

    /// A completed payment is never downgraded.
    pub async fn handle_failed_payment(&self, payment_id: Uuid, reason: &str) -> CoreResult<SettlementOutcome> {
        let payment = self.get_payment(payment_id).await?;
        if payment.status != PaymentStatus::Pending {
            warn!("Ignoring failure for payment {} in status {}", payment.id, payment.status);
            return Ok(SettlementOutcome::Ignored);
        }
        let booking = self.get_booking(payment.booking_id).await?;
        if !self.fail_payment(payment, booking, reason.to_string()).await? {
            return Ok(SettlementOutcome::Ignored);
        }
        Ok(SettlementOutcome::Failed)
    }

    /// Fail a pending payment; a still-pending booking is cancelled and its
    /// seats go back on sale.
    async fn fail_payment(&self, mut payment: Payment, mut booking: Booking, reason: String) -> CoreResult<bool> {
        let now = self.now();
        payment.fail(reason, now)?;

        if booking.status != BookingStatus::PendingPayment {
            return self.ctx.store.update_payment(&payment, PaymentStatus::Pending).await;
        }

        booking.transition(BookingStatus::Cancelled, now)?;
        let transition = BookingTransition::new(booking.clone(), BookingStatus::PendingPayment)
            .with_payment(payment.clone(), PaymentStatus::Pending)
            .seats(SeatEffect::Release);
        let committed = self.ctx.store.commit_transition(&transition).await?;
        if committed {
            info!("Booking {} cancelled after payment {} failed", booking.id, payment.id);
            self.ctx.publish(BookingEvent::SeatsReleased {
                showtime_id: booking.showtime_id,
                seat_ids: booking.seat_ids(),
            });
        }
        Ok(committed)
    }

    /// Expire an overdue booking and free its seats. The payment stays
    /// pending so a late confirmation can still be reconciled.
    pub async fn handle_payment_timeout(&self, booking_id: Uuid) -> CoreResult<bool> {
        let mut booking = self.get_booking(booking_id).await?;
        let now = self.now();
        if !booking.is_payment_overdue(now) {
            return Ok(false);
        }

        booking.transition(BookingStatus::Expired, now)?;
        let transition =
            BookingTransition::new(booking.clone(), BookingStatus::PendingPayment).seats(SeatEffect::Release);
        let committed = self.ctx.store.commit_transition(&transition).await?;
        if committed {
            info!("Booking {} expired unpaid", booking.id);
            self.ctx.publish(BookingEvent::SeatsReleased {
                showtime_id: booking.showtime_id,
                seat_ids: booking.seat_ids(),
            });
        }
        Ok(committed)
    }

    pub async fn sweep_overdue_bookings(&self) -> CoreResult<usize> {
        let mut expired = 0;
        for booking in self.ctx.store.list_overdue_bookings(self.now(), SWEEP_BATCH).await? {
            match self.handle_payment_timeout(booking.id).await {
                Ok(true) => expired += 1,
                Ok(false) => debug!("Booking {} no longer overdue", booking.id),
                Err(e) => warn!("Failed to expire booking {}: {}", booking.id, e),
            }
        }
        if expired > 0 {
            info!("Expired {} unpaid bookings", expired);
        }
        Ok(expired)
    }

    /// Reclaim every seat or none of them. If any seat was taken meanwhile
    /// the payment fails and is refunded automatically.
    async fn handle_late_payment(
        &self,
        mut payment: Payment,
        booking: Booking,
        gateway_amount: f64,
        gateway_txn_id: Option<&str>,
    ) -> CoreResult<SettlementOutcome> {
        let now = self.now();
        if let Some(txn) = gateway_txn_id {
            payment.gateway_txn_id = Some(txn.to_string());
        }

        if !payment.matches_gateway_amount(gateway_amount) {
            let expected = payment.gateway_amount;
            error!("Late payment {} reported {} but {} was expected", payment.id, gateway_amount, expected);
            payment.fail(CoreError::GatewayAmountMismatch { expected, actual: gateway_amount }.to_string(), now)?;
            self.ctx.store.update_payment(&payment, PaymentStatus::Pending).await?;
            return Ok(SettlementOutcome::AmountMismatch);
        }

        let mut reinstated = booking.clone();
        reinstated.confirm(now)?;
        let points = reinstated.take_loyalty_award();
        let mut completed = payment.clone();
        completed.transition(PaymentStatus::Completed, now)?;

        let transition = BookingTransition::new(reinstated.clone(), BookingStatus::Expired)
            .with_payment(completed, PaymentStatus::Pending)
            .seats(SeatEffect::Reclaim)
            .loyalty(points);
        match self.ctx.store.commit_transition(&transition).await {
            Ok(true) => {
                info!("Expired booking {} reinstated by late payment {}", booking.id, payment.id);
                self.ctx.publish(BookingEvent::SeatsBooked {
                    showtime_id: booking.showtime_id,
                    booking_id: booking.id,
                    seat_ids: booking.seat_ids(),
                });
                self.ctx.publish(BookingEvent::BookingConfirmed {
                    showtime_id: booking.showtime_id,
                    booking_id: booking.id,
                    final_price: booking.final_price,
                    timestamp: now.timestamp(),
                });
                Ok(SettlementOutcome::Reinstated)
            }
            Ok(false) => Ok(SettlementOutcome::Ignored),
            Err(CoreError::SeatLocked { seat_ids }) => {
                warn!(
                    "Late payment {} for booking {} cannot be honoured, {} seats were taken",
                    payment.id,
                    booking.id,
                    seat_ids.len()
                );
                self.refund_unhonoured_payment(
                    payment,
                    "Payment arrived after the booking expired and its seats were resold; refund issued",
                    LATE_REFUND_REASON,
                )
                .await
            }
            Err(e) => Err(e),
        }
    }

    /// The customer switched gateways but the first order still got paid.
    /// That money never settles a booking and is refunded.
    async fn handle_superseded_payment(
        &self,
        mut payment: Payment,
        gateway_amount: f64,
        gateway_txn_id: Option<&str>,
    ) -> CoreResult<SettlementOutcome> {
        if let Some(txn) = gateway_txn_id {
            payment.gateway_txn_id = Some(txn.to_string());
        }
        if !payment.matches_gateway_amount(gateway_amount) {
            let expected = payment.gateway_amount;
            error!("Superseded payment {} reported {} but {} was expected", payment.id, gateway_amount, expected);
            payment.fail(CoreError::GatewayAmountMismatch { expected, actual: gateway_amount }.to_string(), self.now())?;
            self.ctx.store.update_payment(&payment, PaymentStatus::Cancelled).await?;
            return Ok(SettlementOutcome::AmountMismatch);
        }

        warn!("Payment {} completed after being superseded, refunding", payment.id);
        self.refund_unhonoured_payment(
            payment,
            "Payment completed after it was replaced by another payment; refund issued",
            SUPERSEDED_REFUND_REASON,
        )
        .await
    }

    /// Write a payment and its refund while leaving the booking untouched.
    /// The booking only guards the write, so a concurrent booking change is
    /// re-read rather than losing the record.
    async fn commit_payment_refund(&self, payment: &Payment, expected: PaymentStatus, refund: &Refund) -> CoreResult<bool> {
        for _ in 0..GUARD_RETRIES {
            let booking = self.get_booking(payment.booking_id).await?;
            let status = booking.status;
            let transition = BookingTransition::new(booking, status)
                .with_payment(payment.clone(), expected)
                .with_refund(refund.clone());
            if self.ctx.store.commit_transition(&transition).await? {
                return Ok(true);
            }
            if self.get_payment(payment.id).await?.status != expected {
                return Ok(false);
            }
        }
        Ok(false)
    }

    /// Fail a payment the gateway collected but no booking can take, then
    /// refund it. The pending refund is on record before the gateway call.
    async fn refund_unhonoured_payment(
        &self,
        mut payment: Payment,
        failure: &str,
        refund_reason: &str,
    ) -> CoreResult<SettlementOutcome> {
        let now = self.now();
        let prior = payment.status;
        payment.fail(failure, now)?;
        let mut refund = Refund::pending(&payment, payment.amount, refund_reason, now);

        if !self.commit_payment_refund(&payment, prior, &refund).await? {
            return Ok(SettlementOutcome::Ignored);
        }

        let result = match self.gateways.get(payment.method) {
            Ok(gateway) => gateway.refund(&payment, refund.amount, &refund.reason).await,
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(gateway_refund_txn_id) => {
                refund.gateway_refund_txn_id = Some(gateway_refund_txn_id);
                refund.transition(RefundStatus::Completed, self.now())?;
                SettlementOutcome::Refunded
            }
            Err(e) => {
                error!("Automatic refund for payment {} failed, manual follow-up needed: {}", payment.id, e);
                let message = format!("automatic refund failed: {}", e);
                refund.error_message = Some(message.clone());
                refund.transition(RefundStatus::Failed, self.now())?;
                payment.error_message = Some(match payment.error_message.take() {
                    Some(existing) => format!("{}; {}", existing, message),
                    None => message,
                });
                SettlementOutcome::RefundFailed
            }
        };

        if !self.commit_payment_refund(&payment, PaymentStatus::Failed, &refund).await? {
            error!("Could not record refund {} for payment {}", refund.id, payment.id);
        }

        if outcome == SettlementOutcome::Refunded {
            info!("Refunded unhonoured payment {} ({})", payment.id, refund.amount);
            self.ctx.publish(BookingEvent::RefundIssued {
                booking_id: payment.booking_id,
                payment_id: payment.id,
                amount: refund.amount,
                timestamp: now.timestamp(),
            });
        }
        Ok(outcome)
    }

    /// Move a completed payment to `REFUND_PENDING` and record the pending
    /// refund, before the gateway is called.
    pub async fn begin_refund(&self, payment_id: Uuid, reason: &str) -> CoreResult<(Payment, Refund)> {
        let mut payment = self.get_payment(payment_id).await?;
        if payment.status != PaymentStatus::Completed {
            return Err(CoreError::DomainConflict(format!(
                "payment {} is {} and cannot be refunded",
                payment.id, payment.status
            )));
        }
        let booking = self.get_booking(payment.booking_id).await?;
        if booking.status != BookingStatus::Confirmed {
            return Err(CoreError::DomainConflict(format!(
                "booking {} is {} and cannot be refunded",
                booking.id, booking.status
            )));
        }

        let now = self.now();
        let refund = Refund::pending(&payment, payment.amount, reason, now);
        payment.transition(PaymentStatus::RefundPending, now)?;

        let transition = BookingTransition::new(booking, BookingStatus::Confirmed)
            .with_payment(payment.clone(), PaymentStatus::Completed)
            .with_refund(refund.clone());
        if !self.ctx.store.commit_transition(&transition).await? {
            return Err(CoreError::DomainConflict(format!("payment {} changed while starting the refund", payment.id)));
        }
        Ok((payment, refund))
    }

    pub async fn handle_refund_success(
        &self,
        payment_id: Uuid,
        mut refund: Refund,
        gateway_refund_txn_id: String,
    ) -> CoreResult<Booking> {
        let mut payment = self.get_payment(payment_id).await?;
        let mut booking = self.get_booking(payment.booking_id).await?;
        let now = self.now();

        refund.gateway_refund_txn_id = Some(gateway_refund_txn_id);
        refund.transition(RefundStatus::Completed, now)?;
        booking.transition(BookingStatus::Cancelled, now)?;
        booking.refund = Some(RefundMetadata {
            refund_id: refund.id,
            amount: refund.amount,
            reason: refund.reason.clone(),
            refunded_at: now,
        });
        let points = booking.take_loyalty_revocation();
        payment.transition(PaymentStatus::Refunded, now)?;

        let transition = BookingTransition::new(booking.clone(), BookingStatus::Confirmed)
            .with_payment(payment.clone(), PaymentStatus::RefundPending)
            .with_refund(refund.clone())
            .seats(SeatEffect::Release)
            .loyalty(-points);
        if !self.ctx.store.commit_transition(&transition).await? {
            return Err(CoreError::DomainConflict(format!("payment {} changed during the refund", payment.id)));
        }

        info!("Booking {} refunded ({}), {} points revoked", booking.id, refund.amount, points);
        self.ctx.publish(BookingEvent::RefundIssued {
            booking_id: booking.id,
            payment_id: payment.id,
            amount: refund.amount,
            timestamp: now.timestamp(),
        });
        self.ctx.publish(BookingEvent::SeatsReleased {
            showtime_id: booking.showtime_id,
            seat_ids: booking.seat_ids(),
        });
        Ok(booking)
    }

    /// The payment goes back to `COMPLETED` and the booking stays confirmed.
    pub async fn handle_refund_failure(&self, payment_id: Uuid, mut refund: Refund, error: &str) -> CoreResult<()> {
        let mut payment = self.get_payment(payment_id).await?;
        let booking = self.get_booking(payment.booking_id).await?;
        let now = self.now();

        refund.error_message = Some(error.to_string());
        refund.transition(RefundStatus::Failed, now)?;
        payment.transition(PaymentStatus::Completed, now)?;
        payment.error_message = Some(format!("refund failed: {}", error));

        let transition = BookingTransition::new(booking, BookingStatus::Confirmed)
            .with_payment(payment.clone(), PaymentStatus::RefundPending)
            .with_refund(refund);
        if !self.ctx.store.commit_transition(&transition).await? {
            return Err(CoreError::DomainConflict(format!("payment {} changed during the refund", payment.id)));
        }
        warn!("Refund for payment {} failed: {}", payment.id, error);
        Ok(())
    }
}
