//! In-process implementations of the persistence and lock-store traits.
//!
//! One mutex guards the whole store, so every trait method is trivially one
//! atomic unit of work. Used by tests and local demos.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cine_core::{
    Booking, BookingRepository, BookingTransition, CatalogRepository, Clock, CoreError, CoreResult,
    LockOwner, LockStore, PartyResolver, Payment, PaymentMethod, PaymentRepository, PaymentStatus,
    PricingRepository, Refund, SeatEffect, SeatLock, SeatLockLine, SeatLockRepository, SeatStatus, Showtime,
    ShowtimeSeat, Snack,
};
use cine_pricing::{BasePrice, MembershipTier, PriceModifier, PricingSnapshot, Promotion, TicketType};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Party {
    email: Option<String>,
    loyalty_points: i64,
}

#[derive(Default)]
struct Inner {
    showtimes: HashMap<Uuid, Showtime>,
    seats: HashMap<Uuid, ShowtimeSeat>,
    ticket_types: HashMap<Uuid, TicketType>,
    assignable: HashSet<(Uuid, Uuid)>,
    snacks: HashMap<Uuid, Snack>,
    snapshot: PricingSnapshot,
    tiers: HashMap<Uuid, MembershipTier>,
    promotions: HashMap<String, Promotion>,
    parties: HashMap<Uuid, Party>,
    locks: HashMap<Uuid, (SeatLock, Vec<SeatLockLine>)>,
    bookings: HashMap<Uuid, Booking>,
    payments: HashMap<Uuid, Payment>,
    refunds: HashMap<Uuid, Refund>,
}

impl Inner {
    fn seat_status(&self, seat_id: Uuid) -> CoreResult<SeatStatus> {
        self.seats
            .get(&seat_id)
            .map(|s| s.status)
            .ok_or_else(|| CoreError::not_found("showtime seat", seat_id))
    }

    fn set_status(&mut self, seat_ids: &[Uuid], from: SeatStatus, to: SeatStatus) {
        for id in seat_ids {
            if let Some(seat) = self.seats.get_mut(id) {
                if seat.status == from {
                    seat.status = to;
                }
            }
        }
    }

    fn not_in(&self, seat_ids: &[Uuid], wanted: SeatStatus) -> CoreResult<Vec<Uuid>> {
        let mut out = Vec::new();
        for id in seat_ids {
            if self.seat_status(*id)? != wanted {
                out.push(*id);
            }
        }
        Ok(out)
    }

    fn has_open_payment(&self, booking_id: Uuid, except: Option<Uuid>) -> bool {
        self.payments
            .values()
            .any(|p| p.booking_id == booking_id && p.status.is_open() && Some(p.id) != except)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Seeding
    // ========================================================================

    pub async fn add_showtime(&self, showtime: Showtime) {
        self.inner.lock().await.showtimes.insert(showtime.id, showtime);
    }

    pub async fn add_seat(&self, seat: ShowtimeSeat) {
        self.inner.lock().await.seats.insert(seat.id, seat);
    }

    /// Registers the ticket type and makes it assignable to the given showtimes.
    pub async fn add_ticket_type(&self, ticket_type: TicketType, showtime_ids: &[Uuid]) {
        let mut inner = self.inner.lock().await;
        for showtime_id in showtime_ids {
            inner.assignable.insert((*showtime_id, ticket_type.id));
        }
        inner.ticket_types.insert(ticket_type.id, ticket_type);
    }

    pub async fn add_snack(&self, snack: Snack) {
        self.inner.lock().await.snacks.insert(snack.id, snack);
    }

    pub async fn set_base_price(&self, price: f64) {
        let mut inner = self.inner.lock().await;
        inner.snapshot.base_price = Some(BasePrice { id: Uuid::new_v4(), price, created_at: Utc::now() });
        inner.snapshot.version += 1;
    }

    /// Modifiers are kept in application order: priority, then insertion.
    pub async fn add_modifier(&self, modifier: PriceModifier) {
        let mut inner = self.inner.lock().await;
        inner.snapshot.modifiers.push(modifier);
        inner.snapshot.modifiers.sort_by_key(|m| m.priority);
        inner.snapshot.version += 1;
    }

    pub async fn add_user(&self, user_id: Uuid, email: Option<&str>) {
        self.inner.lock().await.parties.insert(
            user_id,
            Party { email: email.map(|e| e.trim().to_lowercase()), loyalty_points: 0 },
        );
    }

    pub async fn set_membership(&self, user_id: Uuid, tier: MembershipTier) {
        self.inner.lock().await.tiers.insert(user_id, tier);
    }

    pub async fn add_promotion(&self, promotion: Promotion) {
        self.inner
            .lock()
            .await
            .promotions
            .insert(promotion.code.to_uppercase(), promotion);
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub async fn seat(&self, seat_id: Uuid) -> Option<ShowtimeSeat> {
        self.inner.lock().await.seats.get(&seat_id).cloned()
    }

    pub async fn lock_count(&self) -> usize {
        self.inner.lock().await.locks.len()
    }

    pub async fn payments_for_booking(&self, booking_id: Uuid) -> Vec<Payment> {
        let inner = self.inner.lock().await;
        let mut payments: Vec<Payment> = inner
            .payments
            .values()
            .filter(|p| p.booking_id == booking_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        payments
    }

    pub async fn bookings(&self) -> Vec<Booking> {
        self.inner.lock().await.bookings.values().cloned().collect()
    }
}

#[async_trait]
impl CatalogRepository for MemoryStore {
    async fn get_showtime(&self, showtime_id: Uuid) -> CoreResult<Option<Showtime>> {
        Ok(self.inner.lock().await.showtimes.get(&showtime_id).cloned())
    }

    async fn list_showtime_seats(&self, showtime_id: Uuid) -> CoreResult<Vec<ShowtimeSeat>> {
        let inner = self.inner.lock().await;
        let mut seats: Vec<ShowtimeSeat> = inner
            .seats
            .values()
            .filter(|s| s.showtime_id == showtime_id)
            .cloned()
            .collect();
        seats.sort_by(|a, b| (&a.row_label, a.seat_number).cmp(&(&b.row_label, b.seat_number)));
        Ok(seats)
    }

    async fn get_showtime_seats(&self, showtime_id: Uuid, seat_ids: &[Uuid]) -> CoreResult<Vec<ShowtimeSeat>> {
        let inner = self.inner.lock().await;
        Ok(seat_ids
            .iter()
            .filter_map(|id| inner.seats.get(id))
            .filter(|s| s.showtime_id == showtime_id)
            .cloned()
            .collect())
    }

    async fn get_ticket_type(&self, ticket_type_id: Uuid) -> CoreResult<Option<TicketType>> {
        Ok(self.inner.lock().await.ticket_types.get(&ticket_type_id).cloned())
    }

    async fn is_ticket_type_assignable(&self, showtime_id: Uuid, ticket_type_id: Uuid) -> CoreResult<bool> {
        let inner = self.inner.lock().await;
        let active = inner.ticket_types.get(&ticket_type_id).is_some_and(|t| t.is_active);
        Ok(active && inner.assignable.contains(&(showtime_id, ticket_type_id)))
    }

    async fn get_snack(&self, snack_id: Uuid) -> CoreResult<Option<Snack>> {
        Ok(self.inner.lock().await.snacks.get(&snack_id).cloned())
    }
}

#[async_trait]
impl PricingRepository for MemoryStore {
    async fn load_snapshot(&self) -> CoreResult<PricingSnapshot> {
        let inner = self.inner.lock().await;
        let mut snapshot = inner.snapshot.clone();
        snapshot.modifiers.retain(|m| m.is_active);
        Ok(snapshot)
    }

    async fn membership_tier_for(&self, user_id: Uuid) -> CoreResult<Option<MembershipTier>> {
        Ok(self.inner.lock().await.tiers.get(&user_id).cloned())
    }

    async fn find_promotion(&self, code: &str) -> CoreResult<Option<Promotion>> {
        Ok(self.inner.lock().await.promotions.get(&code.to_uppercase()).cloned())
    }
}

#[async_trait]
impl SeatLockRepository for MemoryStore {
    async fn insert_lock(&self, lock: &SeatLock, lines: &[SeatLockLine]) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;

        let existing = inner
            .locks
            .values()
            .find(|(l, _)| l.owner == lock.owner && l.showtime_id == lock.showtime_id)
            .map(|(l, lines)| (l.clone(), lines.clone()));
        if let Some((previous, previous_lines)) = existing {
            if !previous.is_expired(lock.created_at) {
                return Err(CoreError::DomainConflict(format!(
                    "owner already holds active lock {} for this showtime",
                    previous.id
                )));
            }
            let stale: Vec<Uuid> = previous_lines.iter().map(|l| l.showtime_seat_id).collect();
            inner.set_status(&stale, SeatStatus::Locked, SeatStatus::Available);
            inner.locks.remove(&previous.id);
        }

        let seat_ids: Vec<Uuid> = lines.iter().map(|l| l.showtime_seat_id).collect();
        let taken = inner.not_in(&seat_ids, SeatStatus::Available)?;
        if !taken.is_empty() {
            return Err(CoreError::SeatLocked { seat_ids: taken });
        }

        inner.set_status(&seat_ids, SeatStatus::Available, SeatStatus::Locked);
        inner.locks.insert(lock.id, (lock.clone(), lines.to_vec()));
        Ok(())
    }

    async fn get_lock(&self, lock_id: Uuid) -> CoreResult<Option<(SeatLock, Vec<SeatLockLine>)>> {
        Ok(self.inner.lock().await.locks.get(&lock_id).cloned())
    }

    async fn find_locks_by_owner(&self, owner: &LockOwner) -> CoreResult<Vec<SeatLock>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .locks
            .values()
            .filter(|(l, _)| l.owner == *owner)
            .map(|(l, _)| l.clone())
            .collect())
    }

    async fn delete_lock(
        &self,
        lock_id: Uuid,
        expired_before: Option<DateTime<Utc>>,
    ) -> CoreResult<Option<Vec<SeatLockLine>>> {
        let mut inner = self.inner.lock().await;
        let still_live = match (inner.locks.get(&lock_id), expired_before) {
            (None, _) => return Ok(None),
            (Some((lock, _)), Some(cutoff)) => !lock.is_expired(cutoff),
            (Some(_), None) => false,
        };
        if still_live {
            return Ok(None);
        }

        let (_, lines) = match inner.locks.remove(&lock_id) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let seat_ids: Vec<Uuid> = lines.iter().map(|l| l.showtime_seat_id).collect();
        inner.set_status(&seat_ids, SeatStatus::Locked, SeatStatus::Available);
        Ok(Some(lines))
    }

    async fn list_expired_locks(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<SeatLock>> {
        let inner = self.inner.lock().await;
        let mut expired: Vec<SeatLock> = inner
            .locks
            .values()
            .filter(|(l, _)| l.is_expired(now))
            .map(|(l, _)| l.clone())
            .collect();
        expired.sort_by_key(|l| l.expires_at);
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }
}

#[async_trait]
impl BookingRepository for MemoryStore {
    async fn insert_booking_from_lock(
        &self,
        lock_id: Uuid,
        now: DateTime<Utc>,
        booking: &Booking,
        payment: Option<&Payment>,
    ) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;

        let seat_ids: Vec<Uuid> = match inner.locks.get(&lock_id) {
            Some((lock, lines)) if !lock.is_expired(now) => lines.iter().map(|l| l.showtime_seat_id).collect(),
            _ => return Err(CoreError::LockExpired(lock_id)),
        };
        let not_locked = inner.not_in(&seat_ids, SeatStatus::Locked)?;
        if !not_locked.is_empty() {
            return Err(CoreError::SeatLocked { seat_ids: not_locked });
        }
        if let Some(payment) = payment {
            if inner.has_open_payment(payment.booking_id, None) {
                return Err(CoreError::DomainConflict(format!(
                    "booking {} already has an open payment",
                    payment.booking_id
                )));
            }
        }

        inner.set_status(&seat_ids, SeatStatus::Locked, SeatStatus::Booked);
        inner.locks.remove(&lock_id);
        inner.bookings.insert(booking.id, booking.clone());
        if let Some(payment) = payment {
            inner.payments.insert(payment.id, payment.clone());
        }
        Ok(())
    }

    async fn get_booking(&self, booking_id: Uuid) -> CoreResult<Option<Booking>> {
        Ok(self.inner.lock().await.bookings.get(&booking_id).cloned())
    }

    async fn list_overdue_bookings(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>> {
        let inner = self.inner.lock().await;
        let mut overdue: Vec<Booking> = inner
            .bookings
            .values()
            .filter(|b| b.is_payment_overdue(now))
            .cloned()
            .collect();
        overdue.sort_by_key(|b| b.payment_expires_at);
        overdue.truncate(limit.max(0) as usize);
        Ok(overdue)
    }

    async fn commit_transition(&self, t: &BookingTransition) -> CoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let booking = &t.booking;

        match inner.bookings.get(&booking.id) {
            Some(current) if current.status == t.expected_booking_status => {}
            Some(_) => return Ok(false),
            None => return Err(CoreError::not_found("booking", booking.id)),
        }
        if let (Some(payment), Some(expected)) = (&t.payment, t.expected_payment_status) {
            match inner.payments.get(&payment.id) {
                Some(current) if current.status == expected => {}
                Some(_) => return Ok(false),
                None => return Err(CoreError::not_found("payment", payment.id)),
            }
        }

        let seat_ids = booking.seat_ids();
        match t.seat_effect {
            SeatEffect::Keep => {}
            SeatEffect::Release => inner.set_status(&seat_ids, SeatStatus::Booked, SeatStatus::Available),
            SeatEffect::Reclaim => {
                let taken = inner.not_in(&seat_ids, SeatStatus::Available)?;
                if !taken.is_empty() {
                    return Err(CoreError::SeatLocked { seat_ids: taken });
                }
                inner.set_status(&seat_ids, SeatStatus::Available, SeatStatus::Booked);
            }
        }

        inner.bookings.insert(booking.id, booking.clone());
        if let Some(payment) = &t.payment {
            inner.payments.insert(payment.id, payment.clone());
        }
        if t.loyalty_points_delta != 0 {
            let party = inner
                .parties
                .entry(booking.user_id)
                .or_insert(Party { email: None, loyalty_points: 0 });
            party.loyalty_points += t.loyalty_points_delta;
        }
        if let Some(refund) = &t.refund {
            inner.refunds.insert(refund.id, refund.clone());
        }
        Ok(true)
    }
}

#[async_trait]
impl PaymentRepository for MemoryStore {
    async fn insert_payment(&self, payment: &Payment) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        if payment.status.is_open() && inner.has_open_payment(payment.booking_id, Some(payment.id)) {
            return Err(CoreError::DomainConflict(format!(
                "booking {} already has an open payment",
                payment.booking_id
            )));
        }
        inner.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn get_payment(&self, payment_id: Uuid) -> CoreResult<Option<Payment>> {
        Ok(self.inner.lock().await.payments.get(&payment_id).cloned())
    }

    async fn find_payment_by_gateway_order(
        &self,
        method: PaymentMethod,
        gateway_order_id: &str,
    ) -> CoreResult<Option<Payment>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .payments
            .values()
            .find(|p| p.method == method && p.gateway_order_id.as_deref() == Some(gateway_order_id))
            .cloned())
    }

    async fn find_open_payment(&self, booking_id: Uuid) -> CoreResult<Option<Payment>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .payments
            .values()
            .find(|p| p.booking_id == booking_id && p.status.is_open())
            .cloned())
    }

    async fn update_payment(&self, payment: &Payment, expected: PaymentStatus) -> CoreResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.payments.get(&payment.id) {
            Some(current) if current.status == expected => {}
            Some(_) => return Ok(false),
            None => return Err(CoreError::not_found("payment", payment.id)),
        }
        inner.payments.insert(payment.id, payment.clone());
        Ok(true)
    }

    async fn list_refunds(&self, payment_id: Uuid) -> CoreResult<Vec<Refund>> {
        let inner = self.inner.lock().await;
        let mut refunds: Vec<Refund> = inner
            .refunds
            .values()
            .filter(|r| r.payment_id == payment_id)
            .cloned()
            .collect();
        refunds.sort_by_key(|r| r.created_at);
        Ok(refunds)
    }
}

#[async_trait]
impl PartyResolver for MemoryStore {
    async fn resolve_or_create_guest(&self, email: &str, _full_name: &str, _phone: Option<&str>) -> CoreResult<Uuid> {
        let email = email.trim().to_lowercase();
        let mut inner = self.inner.lock().await;
        if let Some((id, _)) = inner.parties.iter().find(|(_, p)| p.email.as_deref() == Some(email.as_str())) {
            return Ok(*id);
        }
        let id = Uuid::new_v4();
        inner.parties.insert(id, Party { email: Some(email), loyalty_points: 0 });
        Ok(id)
    }

    async fn loyalty_balance(&self, user_id: Uuid) -> CoreResult<i64> {
        self.inner
            .lock()
            .await
            .parties
            .get(&user_id)
            .map(|p| p.loyalty_points)
            .ok_or_else(|| CoreError::not_found("user", user_id))
    }
}

// ============================================================================
// Lock store
// ============================================================================

/// Set-if-absent map with per-key expiry on the tokio clock
#[derive(Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently held and not yet expired.
    pub async fn held_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, (_, expires))| *expires > now)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> CoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if let Some((_, expires)) = entries.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> CoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((held, expires)) if held == token && *expires > now => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl_remaining(&self, key: &str) -> CoreResult<Option<Duration>> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(_, expires)| *expires - now))
    }
}

// ============================================================================
// Clock
// ============================================================================

/// A clock that only moves when told to
pub struct ManualClock {
    now: StdMutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: StdMutex::new(start) }
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
