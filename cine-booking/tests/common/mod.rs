#![allow(dead_code)]

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use cine_booking::{
    BookingContext, BookingOrchestrator, ConfirmRequest, GatewayRegistry, LockResult, MockGateway, Payer,
    PaymentOrder, SeatLockManager, SeatSelection, SettlementService,
};
use cine_core::{
    Booking, LockOwner, PaymentMethod, SeatStatus, Showtime, ShowtimeSeat, Snack, WebhookPayload,
};
use cine_pricing::{Adjustment, DayType, ModifierCondition, PriceModifier, PricingEngine, TicketType};
use cine_store::app_config::BusinessRules;
use cine_store::{ManualClock, MemoryLockStore, MemoryStore};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

pub const SEAT_PRICE: f64 = 120_000.0;

/// A Saturday evening showtime with four standard seats, base price 100,000
/// and a +20% weekend modifier.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub locks: Arc<MemoryLockStore>,
    pub clock: Arc<ManualClock>,
    pub momo: Arc<MockGateway>,
    pub vnpay: Arc<MockGateway>,
    pub ctx: BookingContext,
    pub seat_locks: SeatLockManager,
    pub orchestrator: Arc<BookingOrchestrator>,
    pub settlement: SettlementService,
    pub showtime_id: Uuid,
    pub seat_ids: Vec<Uuid>,
    pub adult: Uuid,
    pub snack_id: Uuid,
    pub user: Uuid,
    pub other_user: Uuid,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 10, 3, 0, 0).unwrap()
}

impl Harness {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let locks = Arc::new(MemoryLockStore::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let momo = Arc::new(MockGateway::new(PaymentMethod::Momo));
        let vnpay = Arc::new(MockGateway::new(PaymentMethod::Vnpay));
        let (events, _) = broadcast::channel(64);

        let ctx = BookingContext::new(
            store.clone(),
            locks.clone(),
            clock.clone(),
            BusinessRules::default(),
            events,
        );
        let gateways = GatewayRegistry::new().with(momo.clone()).with(vnpay.clone());
        let orchestrator = Arc::new(BookingOrchestrator::new(ctx.clone(), PricingEngine::default(), gateways.clone()));
        let settlement = SettlementService::new(ctx.clone(), orchestrator.clone(), gateways);
        let seat_locks = SeatLockManager::new(ctx.clone(), PricingEngine::default());

        let showtime_id = Uuid::new_v4();
        store
            .add_showtime(Showtime {
                id: showtime_id,
                movie_id: Uuid::new_v4(),
                room_id: Uuid::new_v4(),
                // 2024-06-15 is a Saturday
                start_time: NaiveDate::from_ymd_opt(2024, 6, 15).unwrap().and_hms_opt(19, 30, 0).unwrap(),
                format: "2D".into(),
                room_type: "STANDARD".into(),
            })
            .await;

        let mut seat_ids = Vec::new();
        for number in 1..=4 {
            let id = Uuid::new_v4();
            store
                .add_seat(ShowtimeSeat {
                    id,
                    showtime_id,
                    seat_id: Uuid::new_v4(),
                    row_label: "E".into(),
                    seat_number: number,
                    seat_type: "STANDARD".into(),
                    status: SeatStatus::Available,
                })
                .await;
            seat_ids.push(id);
        }

        let adult = Uuid::new_v4();
        store
            .add_ticket_type(
                TicketType { id: adult, name: "Adult".into(), adjustment: Adjustment::percentage(0.0), is_active: true },
                &[showtime_id],
            )
            .await;

        let snack_id = Uuid::new_v4();
        store
            .add_snack(Snack { id: snack_id, name: "Popcorn".into(), price: 50_000.0, is_active: true })
            .await;

        store.set_base_price(100_000.0).await;
        store
            .add_modifier(PriceModifier {
                id: Uuid::new_v4(),
                name: "Weekend".into(),
                condition: ModifierCondition::DayType(DayType::Weekend),
                adjustment: Adjustment::percentage(20.0),
                priority: 10,
                is_active: true,
            })
            .await;

        let user = Uuid::new_v4();
        let other_user = Uuid::new_v4();
        store.add_user(user, Some("an@example.com")).await;
        store.add_user(other_user, Some("binh@example.com")).await;

        Self {
            store,
            locks,
            clock,
            momo,
            vnpay,
            ctx,
            seat_locks,
            orchestrator,
            settlement,
            showtime_id,
            seat_ids,
            adult,
            snack_id,
            user,
            other_user,
        }
    }

    pub fn select(&self, seats: &[Uuid]) -> Vec<SeatSelection> {
        seats
            .iter()
            .map(|id| SeatSelection { showtime_seat_id: *id, ticket_type_id: self.adult })
            .collect()
    }

    pub async fn lock_for(&self, user: Uuid, seats: &[Uuid]) -> LockResult {
        self.seat_locks
            .lock_seats(self.showtime_id, &self.select(seats), &LockOwner::user(user))
            .await
            .unwrap()
    }

    pub fn confirm_request(&self, user: Uuid, lock_id: Uuid) -> ConfirmRequest {
        ConfirmRequest {
            lock_id,
            owner: LockOwner::user(user),
            payer: Payer::User(user),
            promotion_code: None,
            snacks: vec![],
        }
    }

    /// Lock and confirm the given seats for `user`.
    pub async fn book(&self, user: Uuid, seats: &[Uuid]) -> Booking {
        let lock = self.lock_for(user, seats).await;
        self.orchestrator.confirm_booking(&self.confirm_request(user, lock.lock_id)).await.unwrap()
    }

    /// Book the first two seats and open a MoMo order for them.
    pub async fn booked_and_ordered(&self) -> (Booking, PaymentOrder) {
        let booking = self.book(self.user, &self.seat_ids[..2]).await;
        let order = self
            .settlement
            .create_order(booking.id, PaymentMethod::Momo, Some(self.user), None)
            .await
            .unwrap();
        (booking, order)
    }

    pub async fn seat_status(&self, seat_id: Uuid) -> SeatStatus {
        self.store.seat(seat_id).await.unwrap().status
    }

    pub async fn webhook(&self, order: &PaymentOrder, amount: f64, success: bool) -> Value {
        let payload = self.momo_payload(order, amount, success);
        self.settlement.handle_webhook(PaymentMethod::Momo, &payload).await.unwrap()
    }

    pub fn momo_payload(&self, order: &PaymentOrder, amount: f64, success: bool) -> WebhookPayload {
        MockGateway::signed_webhook(order.gateway_order_id.as_deref().unwrap(), amount, success, "TXN-1")
    }
}
