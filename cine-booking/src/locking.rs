use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cine_core::{
    seat_key, CatalogRepository, CoreError, CoreResult, LockOwner, LockStore, PricingRepository, SeatLock,
    SeatLockLine, SeatLockRepository, SeatStatus, ShowtimeSeat,
};
use cine_pricing::{PriceBreakdown, PricingEngine, TicketType};
use cine_shared::BookingEvent;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::BookingContext;

const SWEEP_BATCH: i64 = 100;

async fn release_keys(ctx: &BookingContext, keys: &[String], token: &str) {
    for key in keys {
        if let Err(e) = ctx.locks.release(key, token).await {
            // Key TTL and the sweep cover this
            warn!("Failed to release {}: {}", key, e);
        }
    }
}

/// Drop the lock-store keys of seats whose durable lock is already gone.
pub(crate) async fn release_seat_keys(ctx: &BookingContext, showtime_id: Uuid, seat_ids: &[Uuid], token: &str) {
    let keys: Vec<String> = seat_ids.iter().map(|id| seat_key(showtime_id, *id)).collect();
    release_keys(ctx, &keys, token).await;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeatSelection {
    pub showtime_seat_id: Uuid,
    pub ticket_type_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockedSeat {
    pub showtime_seat_id: Uuid,
    pub label: String,
    pub seat_type: String,
    pub ticket_type_id: Uuid,
    pub price: f64,
    pub breakdown: PriceBreakdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockResult {
    pub lock_id: Uuid,
    pub lock_token: String,
    pub showtime_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub remaining_seconds: i64,
    pub seats: Vec<LockedSeat>,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OwnedLock {
    pub lock_id: Uuid,
    pub seat_ids: Vec<Uuid>,
    pub remaining_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Availability {
    pub showtime_id: Uuid,
    pub available: Vec<Uuid>,
    pub locked: Vec<Uuid>,
    pub booked: Vec<Uuid>,
    /// Present when the caller holds a live lock on this showtime
    pub my_lock: Option<OwnedLock>,
}

/// Acquires and releases seat locks.
///
/// A lock is a saga over two systems: one lock-store key per seat, all taken
/// with a shared token, then the durable lock record. Keys are always rolled
/// back when a later step fails.
pub struct SeatLockManager {
    ctx: BookingContext,
    engine: PricingEngine,
}

impl SeatLockManager {
    pub fn new(ctx: BookingContext, engine: PricingEngine) -> Self {
        Self { ctx, engine }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.ctx.rules.seat_lock_ttl_seconds)
    }

    pub async fn lock_seats(
        &self,
        showtime_id: Uuid,
        selections: &[SeatSelection],
        owner: &LockOwner,
    ) -> CoreResult<LockResult> {
        let max = self.ctx.rules.max_seats_per_booking;
        if selections.is_empty() {
            return Err(CoreError::ValidationError("at least one seat must be selected".into()));
        }
        if selections.len() > max {
            return Err(CoreError::MaxSeatsExceeded { requested: selections.len(), max });
        }
        let mut seen = HashSet::new();
        if let Some(dup) = selections.iter().find(|s| !seen.insert(s.showtime_seat_id)) {
            return Err(CoreError::ValidationError(format!("seat {} selected twice", dup.showtime_seat_id)));
        }

        // One active lock per owner: drop whatever they held before
        self.release_all_for_owner(owner).await;

        let store = &self.ctx.store;
        let showtime = store
            .get_showtime(showtime_id)
            .await?
            .ok_or_else(|| CoreError::not_found("showtime", showtime_id))?;

        let requested: Vec<Uuid> = selections.iter().map(|s| s.showtime_seat_id).collect();
        let seats: HashMap<Uuid, ShowtimeSeat> = store
            .get_showtime_seats(showtime_id, &requested)
            .await?
            .into_iter()
            .map(|s| (s.id, s))
            .collect();
        if let Some(missing) = requested.iter().find(|id| !seats.contains_key(id)) {
            return Err(CoreError::not_found("showtime seat", missing));
        }

        let ticket_types = self.assignable_ticket_types(showtime_id, selections).await?;

        let unavailable: Vec<Uuid> = requested
            .iter()
            .copied()
            .filter(|id| seats[id].status != SeatStatus::Available)
            .collect();
        if !unavailable.is_empty() {
            return Err(CoreError::SeatLocked { seat_ids: unavailable });
        }

        let snapshot = store.load_snapshot().await?;
        let mut priced = Vec::with_capacity(selections.len());
        for selection in selections {
            let seat = &seats[&selection.showtime_seat_id];
            let ticket = &ticket_types[&selection.ticket_type_id];
            let (price, breakdown) = self.engine.price_seat(&snapshot, &showtime.pricing_context(seat), ticket)?;
            priced.push(LockedSeat {
                showtime_seat_id: seat.id,
                label: seat.label(),
                seat_type: seat.seat_type.clone(),
                ticket_type_id: ticket.id,
                price,
                breakdown,
            });
        }

        let token = Uuid::new_v4().simple().to_string();
        let keys: Vec<String> = requested.iter().map(|id| seat_key(showtime_id, *id)).collect();
        self.acquire_all(&requested, &keys, &token).await?;

        let now = self.ctx.clock.now();
        let lock = SeatLock {
            id: Uuid::new_v4(),
            owner: owner.clone(),
            showtime_id,
            lock_token: token.clone(),
            created_at: now,
            expires_at: now + ChronoDuration::seconds(self.ctx.rules.seat_lock_ttl_seconds as i64),
        };
        let lines: Vec<SeatLockLine> = priced
            .iter()
            .map(|p| SeatLockLine {
                lock_id: lock.id,
                showtime_seat_id: p.showtime_seat_id,
                ticket_type_id: p.ticket_type_id,
                price: p.price,
            })
            .collect();

        if let Err(e) = store.insert_lock(&lock, &lines).await {
            warn!("Durable lock write failed, rolling back {} keys: {}", keys.len(), e);
            self.release_keys(&keys, &token).await;
            return Err(e);
        }

        info!("Locked {} seats for {} on showtime {}", lines.len(), owner, showtime_id);
        self.ctx.publish(BookingEvent::SeatsLocked {
            showtime_id,
            seat_ids: requested,
            expires_at: lock.expires_at,
        });

        let total = priced.iter().map(|p| p.price).sum();
        Ok(LockResult {
            lock_id: lock.id,
            lock_token: token,
            showtime_id,
            expires_at: lock.expires_at,
            remaining_seconds: lock.remaining_seconds(now),
            seats: priced,
            total,
        })
    }

    async fn assignable_ticket_types(
        &self,
        showtime_id: Uuid,
        selections: &[SeatSelection],
    ) -> CoreResult<HashMap<Uuid, TicketType>> {
        let mut out = HashMap::new();
        for selection in selections {
            if out.contains_key(&selection.ticket_type_id) {
                continue;
            }
            let assignable = self
                .ctx
                .store
                .is_ticket_type_assignable(showtime_id, selection.ticket_type_id)
                .await?;
            let ticket = match self.ctx.store.get_ticket_type(selection.ticket_type_id).await? {
                Some(t) if assignable && t.is_active => t,
                _ => {
                    return Err(CoreError::ValidationError(format!(
                        "ticket type {} is not available for this showtime",
                        selection.ticket_type_id
                    )))
                }
            };
            out.insert(ticket.id, ticket);
        }
        Ok(out)
    }

    /// All-or-nothing: every key is attempted so the caller learns every
    /// contended seat, then anything taken is given back on failure.
    async fn acquire_all(&self, seat_ids: &[Uuid], keys: &[String], token: &str) -> CoreResult<()> {
        let ttl = self.ttl();
        let mut acquired = Vec::with_capacity(keys.len());
        let mut contended = Vec::new();

        for (seat_id, key) in seat_ids.iter().zip(keys) {
            match self.ctx.locks.acquire(key, token, ttl).await {
                Ok(true) => acquired.push(key.clone()),
                Ok(false) => contended.push(*seat_id),
                Err(e) => {
                    self.release_keys(&acquired, token).await;
                    return Err(e);
                }
            }
        }

        if !contended.is_empty() {
            debug!("Lost race for {} seats, releasing {} keys", contended.len(), acquired.len());
            self.release_keys(&acquired, token).await;
            return Err(CoreError::SeatLocked { seat_ids: contended });
        }
        Ok(())
    }

    async fn release_keys(&self, keys: &[String], token: &str) {
        release_keys(&self.ctx, keys, token).await;
    }

    async fn release_all_for_owner(&self, owner: &LockOwner) {
        let locks = match self.ctx.store.find_locks_by_owner(owner).await {
            Ok(locks) => locks,
            Err(e) => {
                warn!("Could not list previous locks for {}: {}", owner, e);
                return;
            }
        };
        for lock in locks {
            if let Err(e) = self.release_lock(&lock, None).await {
                warn!("Could not release previous lock {}: {}", lock.id, e);
            }
        }
    }

    /// Durable record first, then keys. Returns whether this call removed it.
    async fn release_lock(&self, lock: &SeatLock, expired_before: Option<DateTime<Utc>>) -> CoreResult<bool> {
        let lines = match self.ctx.store.delete_lock(lock.id, expired_before).await? {
            Some(lines) => lines,
            None => return Ok(false),
        };
        let seat_ids: Vec<Uuid> = lines.iter().map(|l| l.showtime_seat_id).collect();
        release_seat_keys(&self.ctx, lock.showtime_id, &seat_ids, &lock.lock_token).await;
        self.ctx.publish(BookingEvent::SeatsReleased {
            showtime_id: lock.showtime_id,
            seat_ids,
        });
        Ok(true)
    }

    /// Idempotent; `false` when the owner held nothing on this showtime.
    pub async fn release_seats(&self, owner: &LockOwner, showtime_id: Uuid) -> CoreResult<bool> {
        let mut released = false;
        for lock in self.ctx.store.find_locks_by_owner(owner).await? {
            if lock.showtime_id == showtime_id {
                released |= self.release_lock(&lock, None).await?;
            }
        }
        if released {
            info!("Released seats for {} on showtime {}", owner, showtime_id);
        }
        Ok(released)
    }

    pub async fn check_availability(&self, showtime_id: Uuid, owner: Option<&LockOwner>) -> CoreResult<Availability> {
        let store = &self.ctx.store;
        if store.get_showtime(showtime_id).await?.is_none() {
            return Err(CoreError::not_found("showtime", showtime_id));
        }

        let mut availability = Availability {
            showtime_id,
            available: Vec::new(),
            locked: Vec::new(),
            booked: Vec::new(),
            my_lock: None,
        };
        for seat in store.list_showtime_seats(showtime_id).await? {
            match seat.status {
                SeatStatus::Available => availability.available.push(seat.id),
                SeatStatus::Locked => availability.locked.push(seat.id),
                SeatStatus::Booked => availability.booked.push(seat.id),
            }
        }

        if let Some(owner) = owner {
            availability.my_lock = self.owned_lock(showtime_id, owner).await?;
        }
        Ok(availability)
    }

    async fn owned_lock(&self, showtime_id: Uuid, owner: &LockOwner) -> CoreResult<Option<OwnedLock>> {
        let now = self.ctx.clock.now();
        let lock = self
            .ctx
            .store
            .find_locks_by_owner(owner)
            .await?
            .into_iter()
            .find(|l| l.showtime_id == showtime_id && !l.is_expired(now));
        let lock = match lock {
            Some(lock) => lock,
            None => return Ok(None),
        };
        let lines = match self.ctx.store.get_lock(lock.id).await? {
            Some((_, lines)) => lines,
            None => return Ok(None),
        };

        // Prefer the lock store's clock; fall back to the durable expiry
        let durable = lock.remaining_seconds(now);
        let remaining = match lines.first() {
            Some(line) => match self.ctx.locks.ttl_remaining(&seat_key(showtime_id, line.showtime_seat_id)).await {
                Ok(Some(ttl)) => (ttl.as_secs() as i64).min(durable),
                _ => durable,
            },
            None => durable,
        };

        Ok(Some(OwnedLock {
            lock_id: lock.id,
            seat_ids: lines.iter().map(|l| l.showtime_seat_id).collect(),
            remaining_seconds: remaining,
        }))
    }

    /// Remove locks whose expiry has passed. Safe to run concurrently with
    /// booking confirmation; whichever commits first wins.
    pub async fn sweep_expired_locks(&self) -> CoreResult<usize> {
        let now = self.ctx.clock.now();
        let mut swept = 0;
        for lock in self.ctx.store.list_expired_locks(now, SWEEP_BATCH).await? {
            match self.release_lock(&lock, Some(now)).await {
                Ok(true) => swept += 1,
                Ok(false) => debug!("Lock {} already gone", lock.id),
                Err(e) => warn!("Failed to sweep lock {}: {}", lock.id, e),
            }
        }
        if swept > 0 {
            info!("Swept {} expired seat locks", swept);
        }
        Ok(swept)
    }
}
