use std::sync::Arc;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{NaiveDate, Utc};
use cine_api::{
    app,
    metrics::Metrics,
    middleware::{Claims, ResiliencyState},
    state::{AppState, AuthConfig},
};
use cine_booking::{BookingContext, BookingOrchestrator, GatewayRegistry, MockGateway, SeatLockManager, SettlementService};
use cine_core::{PaymentMethod, SeatStatus, Showtime, ShowtimeSeat, SystemClock};
use cine_pricing::{Adjustment, PricingEngine, TicketType};
use cine_store::app_config::{BusinessRules, RateLimitConfig};
use cine_store::{MemoryLockStore, MemoryStore};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

const SECRET: &str = "test-secret";

struct TestApp {
    router: Router,
    store: Arc<MemoryStore>,
    showtime_id: Uuid,
    seat_ids: Vec<Uuid>,
    adult: Uuid,
    user: Uuid,
    other_user: Uuid,
}

fn token(sub: &str, role: &str) -> String {
    let claims = Claims {
        sub: sub.to_string(),
        email: None,
        role: role.to_string(),
        exp: (Utc::now().timestamp() + 3600) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

impl TestApp {
    async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let locks = Arc::new(MemoryLockStore::new());
        let (events, _) = tokio::sync::broadcast::channel(64);
        let ctx = BookingContext::new(
            store.clone(),
            locks,
            Arc::new(SystemClock),
            BusinessRules::default(),
            events,
        );
        let gateways = GatewayRegistry::new()
            .with(Arc::new(MockGateway::new(PaymentMethod::Momo)))
            .with(Arc::new(MockGateway::new(PaymentMethod::Vnpay)));
        let orchestrator = Arc::new(BookingOrchestrator::new(ctx.clone(), PricingEngine::default(), gateways.clone()));
        let settlement = Arc::new(SettlementService::new(ctx.clone(), orchestrator.clone(), gateways));
        let seat_locks = Arc::new(SeatLockManager::new(ctx.clone(), PricingEngine::default()));

        let state = AppState {
            ctx,
            seat_locks,
            orchestrator,
            settlement,
            redis: None,
            rate_limit: RateLimitConfig::default(),
            auth: AuthConfig { secret: SECRET.to_string(), expiration: 3600 },
            resiliency: Arc::new(ResiliencyState::default()),
            metrics: Arc::new(Metrics::new().unwrap()),
        };

        let showtime_id = Uuid::new_v4();
        store
            .add_showtime(Showtime {
                id: showtime_id,
                movie_id: Uuid::new_v4(),
                room_id: Uuid::new_v4(),
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
                    row_label: "F".into(),
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
        store.set_base_price(100_000.0).await;

        let user = Uuid::new_v4();
        let other_user = Uuid::new_v4();
        store.add_user(user, Some("lan@example.com")).await;
        store.add_user(other_user, Some("minh@example.com")).await;

        Self { router: app(state), store, showtime_id, seat_ids, adult, user, other_user }
    }

    async fn call(&self, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn customer(&self, user: Uuid) -> String {
        token(&user.to_string(), "CUSTOMER")
    }

    fn lock_body(&self, seats: &[Uuid]) -> Value {
        json!({
            "showtime_id": self.showtime_id,
            "seats": seats
                .iter()
                .map(|id| json!({ "showtime_seat_id": id, "ticket_type_id": self.adult }))
                .collect::<Vec<_>>(),
        })
    }

    /// Lock and confirm two seats for `user`; returns the booking JSON.
    async fn booked(&self, user: Uuid) -> Value {
        let token = self.customer(user);
        let (status, lock) = self.call("POST", "/v1/seat-locks", Some(&token), Some(self.lock_body(&self.seat_ids[..2]))).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, booking) = self
            .call("POST", "/v1/bookings/confirm", Some(&token), Some(json!({ "lock_id": lock["lock_id"] })))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        booking
    }
}

#[tokio::test]
async fn test_health() {
    let app = TestApp::new().await;
    let (status, body) = app.call("GET", "/v1/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_seat_locks_require_a_token() {
    let app = TestApp::new().await;
    let (status, _) = app.call("POST", "/v1/seat-locks", None, Some(app.lock_body(&app.seat_ids[..1]))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .call("POST", "/v1/seat-locks", Some("not-a-jwt"), Some(app.lock_body(&app.seat_ids[..1])))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_guest_session_locks_and_contention_lists_seats() {
    let app = TestApp::new().await;

    let (status, session) = app.call("POST", "/v1/auth/guest", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let guest_token = session["token"].as_str().unwrap().to_string();
    assert!(session["session_id"].as_str().unwrap().starts_with("guest-"));

    let (status, lock) = app
        .call("POST", "/v1/seat-locks", Some(&guest_token), Some(app.lock_body(&app.seat_ids[..2])))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(lock["seats"].as_array().unwrap().len(), 2);
    // Saturday showtime, no modifiers seeded
    assert_eq!(lock["total"], 200_000.0);

    let contested = app.seat_ids[1];
    let (status, body) = app
        .call(
            "POST",
            "/v1/seat-locks",
            Some(&app.customer(app.user)),
            Some(app.lock_body(&[contested, app.seat_ids[2]])),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["seat_ids"], json!([contested]));
    assert_eq!(app.store.seat(app.seat_ids[2]).await.unwrap().status, SeatStatus::Available);

    let uri = format!("/v1/seat-locks/availability/{}", app.showtime_id);
    let (status, view) = app.call("GET", &uri, Some(&guest_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["locked"].as_array().unwrap().len(), 2);
    assert_eq!(view["my_lock"]["lock_id"], lock["lock_id"]);

    let (status, anonymous) = app.call("GET", &uri, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(anonymous["my_lock"].is_null());

    let release = format!("/v1/seat-locks/{}", app.showtime_id);
    let (status, body) = app.call("DELETE", &release, Some(&guest_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["released"], true);
    let (_, body) = app.call("DELETE", &release, Some(&guest_token), None).await;
    assert_eq!(body["released"], false);
}

#[tokio::test]
async fn test_max_seats_is_a_bad_request() {
    let app = TestApp::new().await;
    let seats: Vec<Uuid> = (0..9).map(|_| Uuid::new_v4()).collect();
    let (status, body) = app
        .call("POST", "/v1/seat-locks", Some(&app.customer(app.user)), Some(app.lock_body(&seats)))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["max"], 8);
    assert_eq!(body["requested"], 9);
}

#[tokio::test]
async fn test_guest_confirm_requires_contact_details() {
    let app = TestApp::new().await;
    let guest = token("guest-session-1", "GUEST");
    let (_, lock) = app.call("POST", "/v1/seat-locks", Some(&guest), Some(app.lock_body(&app.seat_ids[..1]))).await;

    let (status, preview) = app
        .call("POST", "/v1/bookings/price-preview", Some(&guest), Some(json!({ "lock_id": lock["lock_id"] })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(preview["final_price"], 100_000.0);

    let (status, _) = app
        .call("POST", "/v1/bookings/confirm", Some(&guest), Some(json!({ "lock_id": lock["lock_id"] })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, booking) = app
        .call(
            "POST",
            "/v1/bookings/confirm",
            Some(&guest),
            Some(json!({
                "lock_id": lock["lock_id"],
                "guest": { "email": "Khach@Example.com", "full_name": "Khach Le" },
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(booking["status"], "PENDING_PAYMENT");
}

#[tokio::test]
async fn test_unknown_lock_is_gone() {
    let app = TestApp::new().await;
    let (status, body) = app
        .call(
            "POST",
            "/v1/bookings/confirm",
            Some(&app.customer(app.user)),
            Some(json!({ "lock_id": Uuid::new_v4() })),
        )
        .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["code"], "LOCK_EXPIRED");
}

#[tokio::test]
async fn test_pay_through_ipn_then_admin_refund() {
    let app = TestApp::new().await;
    let booking = app.booked(app.user).await;
    let booking_id = booking["id"].as_str().unwrap().to_string();
    let token = app.customer(app.user);

    // Someone else cannot see or pay for it
    let other = app.customer(app.other_user);
    let (status, _) = app.call("GET", &format!("/v1/bookings/{}", booking_id), Some(&other), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = app
        .call(
            "POST",
            "/v1/payments/order",
            Some(&other),
            Some(json!({ "booking_id": booking_id, "payment_method": "momo" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, order) = app
        .call(
            "POST",
            "/v1/payments/order",
            Some(&token),
            Some(json!({ "booking_id": booking_id, "payment_method": "momo" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(order["gateway_amount"], 200_000.0);

    // A forged notification is acknowledged but changes nothing
    let order_id = order["gateway_order_id"].as_str().unwrap();
    let mut forged = MockGateway::signed_webhook(order_id, 200_000.0, true, "TXN-9").params;
    forged.insert("signature".into(), "00".repeat(32));
    let (status, ack) = app.call("POST", "/v1/payments/momo/ipn", None, Some(json!(forged))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["status"], "invalid_signature");

    let payload = MockGateway::signed_webhook(order_id, 200_000.0, true, "TXN-9").params;
    let (status, ack) = app.call("POST", "/v1/payments/momo/ipn", None, Some(json!(payload))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["status"], "processed");

    let (_, ack) = app.call("POST", "/v1/payments/momo/ipn", None, Some(json!(payload))).await;
    assert_eq!(ack["status"], "already_processed");

    let (status, view) = app.call("GET", &format!("/v1/bookings/{}", booking_id), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "CONFIRMED");
    assert!(view["qr_payload"].is_string());

    let refund_uri = format!("/v1/payments/{}/refund", order["payment_id"].as_str().unwrap());
    let (status, _) = app.call("POST", &refund_uri, Some(&token), Some(json!({}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let admin = token_for_admin();
    let (status, refund) = app
        .call("POST", &refund_uri, Some(&admin), Some(json!({ "reason": "Showtime cancelled" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(refund["status"], "COMPLETED");
    assert_eq!(refund["amount"], 200_000.0);

    let (_, view) = app.call("GET", &format!("/v1/bookings/{}", booking_id), Some(&admin), None).await;
    assert_eq!(view["status"], "CANCELLED");
    for seat in &app.seat_ids[..2] {
        assert_eq!(app.store.seat(*seat).await.unwrap().status, SeatStatus::Available);
    }
}

#[tokio::test]
async fn test_checkout_and_capture() {
    let app = TestApp::new().await;
    let token = app.customer(app.user);
    let (_, lock) = app.call("POST", "/v1/seat-locks", Some(&token), Some(app.lock_body(&app.seat_ids[2..]))).await;

    let (status, _) = app
        .call(
            "POST",
            "/v1/checkout",
            Some(&token),
            Some(json!({ "lock_id": lock["lock_id"], "payment_method": "paypal" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, result) = app
        .call(
            "POST",
            "/v1/checkout",
            Some(&token),
            Some(json!({ "lock_id": lock["lock_id"], "payment_method": "vnpay" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(result["booking"]["status"], "PENDING_PAYMENT");
    assert_eq!(result["order"]["method"], "vnpay");

    let (status, summary) = app
        .call(
            "POST",
            "/v1/payments/order/capture",
            Some(&token),
            Some(json!({ "payment_id": result["order"]["payment_id"] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["payment_id"], result["order"]["payment_id"]);
}

#[tokio::test]
async fn test_unknown_gateway_ipn_is_rejected() {
    let app = TestApp::new().await;
    let (status, _) = app.call("GET", "/v1/payments/paypal/ipn?token=x", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unreadable_ipn_body_gets_acknowledged() {
    let app = TestApp::new().await;
    for (content_type, body) in [
        ("application/json", "{not json"),
        ("application/x-www-form-urlencoded", "orderId=abc&amount=1000&signature=deadbeef"),
    ] {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/payments/momo/ipn")
            .header("Content-Type", content_type)
            .body(Body::from(body))
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let ack: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(ack["status"], "invalid_signature");
    }
}

fn token_for_admin() -> String {
    token(&Uuid::new_v4().to_string(), "ADMIN")
}
