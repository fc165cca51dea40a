mod common;

use chrono::Duration as ChronoDuration;
use cine_core::{seat_key, CoreError, LockOwner, LockStore, SeatStatus};
use common::{Harness, SEAT_PRICE};
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn test_weekend_pricing_and_booked_seat_fails_whole_request() {
    let h = Harness::new().await;
    let (a, b, c) = (h.seat_ids[0], h.seat_ids[1], h.seat_ids[2]);

    let lock = h.lock_for(h.user, &[a, b]).await;
    assert_eq!(lock.seats.len(), 2);
    for seat in &lock.seats {
        assert_eq!(seat.breakdown.base_price, 100_000.0);
        assert_eq!(seat.breakdown.final_price, SEAT_PRICE);
        assert_eq!(seat.price, SEAT_PRICE);
    }
    assert_eq!(lock.total, 2.0 * SEAT_PRICE);
    assert!(h.seat_locks.release_seats(&LockOwner::user(h.user), h.showtime_id).await.unwrap());

    // Someone else books the third seat
    h.book(h.other_user, &[c]).await;
    assert_eq!(h.seat_status(c).await, SeatStatus::Booked);

    let err = h
        .seat_locks
        .lock_seats(h.showtime_id, &h.select(&[a, b, c]), &LockOwner::user(h.user))
        .await
        .unwrap_err();
    assert_eq!(err, CoreError::SeatLocked { seat_ids: vec![c] });

    assert_eq!(h.seat_status(a).await, SeatStatus::Available);
    assert_eq!(h.seat_status(b).await, SeatStatus::Available);
    assert_eq!(h.store.lock_count().await, 0);
    assert!(h.locks.held_keys().await.is_empty());
}

#[tokio::test]
async fn test_overlapping_locks_are_mutually_exclusive() {
    let h = Harness::new().await;
    let (a, b, c) = (h.seat_ids[0], h.seat_ids[1], h.seat_ids[2]);

    let first = h.select(&[a, b]);
    let second = h.select(&[b, c]);
    let owner_one = LockOwner::user(h.user);
    let owner_two = LockOwner::guest("session-2");
    let (one, two) = tokio::join!(
        h.seat_locks.lock_seats(h.showtime_id, &first, &owner_one),
        h.seat_locks.lock_seats(h.showtime_id, &second, &owner_two),
    );

    let (winner_seats, loser_err) = match (one, two) {
        (Ok(_), Err(e)) => (vec![a, b], e),
        (Err(e), Ok(_)) => (vec![b, c], e),
        other => panic!("expected exactly one winner, got {:?}", other),
    };
    assert_eq!(loser_err, CoreError::SeatLocked { seat_ids: vec![b] });

    assert_eq!(h.store.lock_count().await, 1);
    let mut expected_keys: Vec<String> = winner_seats.iter().map(|id| seat_key(h.showtime_id, *id)).collect();
    expected_keys.sort();
    assert_eq!(h.locks.held_keys().await, expected_keys);

    let loser_only = if winner_seats.contains(&a) { c } else { a };
    assert_eq!(h.seat_status(loser_only).await, SeatStatus::Available);
}

#[tokio::test]
async fn test_partial_acquisition_rolls_back_every_key() {
    let h = Harness::new().await;
    let (a, b, c) = (h.seat_ids[0], h.seat_ids[1], h.seat_ids[2]);

    // A foreign holder on the last seat only
    let foreign = seat_key(h.showtime_id, c);
    assert!(h.locks.acquire(&foreign, "foreign", Duration::from_secs(60)).await.unwrap());

    let err = h
        .seat_locks
        .lock_seats(h.showtime_id, &h.select(&[a, b, c]), &LockOwner::user(h.user))
        .await
        .unwrap_err();
    assert_eq!(err, CoreError::SeatLocked { seat_ids: vec![c] });

    assert_eq!(h.locks.held_keys().await, vec![foreign]);
    for seat in [a, b, c] {
        assert_eq!(h.seat_status(seat).await, SeatStatus::Available);
    }
    assert_eq!(h.store.lock_count().await, 0);
}

#[tokio::test]
async fn test_selection_limits() {
    let h = Harness::new().await;
    let owner = LockOwner::user(h.user);

    let too_many: Vec<Uuid> = (0..9).map(|_| Uuid::new_v4()).collect();
    let err = h.seat_locks.lock_seats(h.showtime_id, &h.select(&too_many), &owner).await.unwrap_err();
    assert_eq!(err, CoreError::MaxSeatsExceeded { requested: 9, max: 8 });

    let a = h.seat_ids[0];
    let err = h.seat_locks.lock_seats(h.showtime_id, &h.select(&[a, a]), &owner).await.unwrap_err();
    assert!(matches!(err, CoreError::ValidationError(_)));

    let err = h.seat_locks.lock_seats(h.showtime_id, &[], &owner).await.unwrap_err();
    assert!(matches!(err, CoreError::ValidationError(_)));

    let err = h.seat_locks.lock_seats(h.showtime_id, &h.select(&[Uuid::new_v4()]), &owner).await.unwrap_err();
    assert!(matches!(err, CoreError::ResourceNotFound(_)));
}

#[tokio::test]
async fn test_relock_replaces_previous_lock() {
    let h = Harness::new().await;
    let (a, b) = (h.seat_ids[0], h.seat_ids[1]);

    h.lock_for(h.user, &[a]).await;
    h.lock_for(h.user, &[b]).await;

    assert_eq!(h.store.lock_count().await, 1);
    assert_eq!(h.seat_status(a).await, SeatStatus::Available);
    assert_eq!(h.seat_status(b).await, SeatStatus::Locked);
    assert_eq!(h.locks.held_keys().await, vec![seat_key(h.showtime_id, b)]);
}

#[tokio::test]
async fn test_availability_reports_own_lock_and_release_is_idempotent() {
    let h = Harness::new().await;
    let owner = LockOwner::user(h.user);
    let lock = h.lock_for(h.user, &h.seat_ids[..2]).await;

    let view = h.seat_locks.check_availability(h.showtime_id, Some(&owner)).await.unwrap();
    assert_eq!(view.locked.len(), 2);
    assert_eq!(view.available.len(), 2);
    assert!(view.booked.is_empty());
    let mine = view.my_lock.unwrap();
    assert_eq!(mine.lock_id, lock.lock_id);
    assert_eq!(mine.seat_ids.len(), 2);
    assert!(mine.remaining_seconds > 0 && mine.remaining_seconds <= 600);

    let anonymous = h.seat_locks.check_availability(h.showtime_id, None).await.unwrap();
    assert!(anonymous.my_lock.is_none());

    assert!(h.seat_locks.release_seats(&owner, h.showtime_id).await.unwrap());
    assert!(!h.seat_locks.release_seats(&owner, h.showtime_id).await.unwrap());
    let view = h.seat_locks.check_availability(h.showtime_id, Some(&owner)).await.unwrap();
    assert_eq!(view.available.len(), 4);
    assert!(view.my_lock.is_none());
    assert!(h.locks.held_keys().await.is_empty());
}

#[tokio::test]
async fn test_expired_lock_cannot_be_confirmed_and_is_swept() {
    let h = Harness::new().await;
    let lock = h.lock_for(h.user, &h.seat_ids[..2]).await;

    h.clock.advance(ChronoDuration::minutes(11));

    let err = h
        .orchestrator
        .confirm_booking(&h.confirm_request(h.user, lock.lock_id))
        .await
        .unwrap_err();
    assert_eq!(err, CoreError::LockExpired(lock.lock_id));

    assert_eq!(h.seat_locks.sweep_expired_locks().await.unwrap(), 1);
    assert_eq!(h.seat_locks.sweep_expired_locks().await.unwrap(), 0);
    assert_eq!(h.store.lock_count().await, 0);
    for seat in &h.seat_ids[..2] {
        assert_eq!(h.seat_status(*seat).await, SeatStatus::Available);
    }
    assert!(h.locks.held_keys().await.is_empty());
}

#[tokio::test]
async fn test_seat_events_are_broadcast() {
    let h = Harness::new().await;
    let mut events = h.ctx.subscribe();

    let lock = h.lock_for(h.user, &h.seat_ids[..1]).await;
    let event = events.recv().await.unwrap();
    assert_eq!(event.name(), "seats_locked");
    assert_eq!(event.showtime_id(), Some(h.showtime_id));

    h.orchestrator.confirm_booking(&h.confirm_request(h.user, lock.lock_id)).await.unwrap();
    assert_eq!(events.recv().await.unwrap().name(), "seats_booked");
}
