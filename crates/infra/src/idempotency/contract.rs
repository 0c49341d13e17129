//! Behaviour every [`IdempotencyStore`] backend must share.
//!
//! Each backend's tests call [`run_all`] with a factory taking
//! `(retention, reservation_lease)`. Keys are fresh per case, so the suite
//! can run against a shared database or Redis instance.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use switchyard_core::{ConsumerGroup, EventId};

use super::{
    DEFAULT_RESERVATION_LEASE, DEFAULT_RETENTION, DeliveryKey, IdempotencyError,
    IdempotencyStore, Reservation,
};

pub(crate) type StoreFactory<'a> = &'a dyn Fn(Duration, Duration) -> Arc<dyn IdempotencyStore>;

const SHORT: Duration = Duration::from_millis(100);

fn fresh_key() -> DeliveryKey {
    DeliveryKey::new(EventId::new(), ConsumerGroup::new("contract").unwrap())
}

fn outlive(window: Duration) {
    thread::sleep(window + Duration::from_millis(100));
}

pub(crate) fn run_all(factory: StoreFactory<'_>) {
    concurrent_reservations_have_one_winner(factory);
    lapsed_lease_is_taken_over(factory);
    processed_key_reports_its_record(factory);
    release_frees_only_reservations(factory);
    expired_records_are_forgotten(factory);
    mark_needs_a_live_reservation(factory);
}

fn concurrent_reservations_have_one_winner(factory: StoreFactory<'_>) {
    let store = factory(DEFAULT_RETENTION, DEFAULT_RESERVATION_LEASE);
    let key = fresh_key();
    let winners = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            let key = key.clone();
            let winners = winners.clone();
            thread::spawn(move || {
                if store.check_and_reserve(&key, "fp").unwrap() == Reservation::Reserved {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert!(matches!(
        store.check_and_reserve(&key, "fp").unwrap(),
        Reservation::InFlight { .. }
    ));
}

fn lapsed_lease_is_taken_over(factory: StoreFactory<'_>) {
    let store = factory(DEFAULT_RETENTION, SHORT);
    let key = fresh_key();

    assert_eq!(store.check_and_reserve(&key, "fp").unwrap(), Reservation::Reserved);
    outlive(SHORT);
    assert_eq!(store.check_and_reserve(&key, "fp").unwrap(), Reservation::Reserved);
    store.mark_processed(&key).unwrap();
}

fn processed_key_reports_its_record(factory: StoreFactory<'_>) {
    let store = factory(DEFAULT_RETENTION, DEFAULT_RESERVATION_LEASE);
    let key = fresh_key();

    store.check_and_reserve(&key, "fp-original").unwrap();
    let record = store.mark_processed(&key).unwrap();
    assert_eq!(record.event_id, key.event_id);
    assert_eq!(record.fingerprint, "fp-original");

    // Same payload redelivered.
    match store.check_and_reserve(&key, "fp-original").unwrap() {
        Reservation::AlreadyProcessed(r) => assert_eq!(r.fingerprint, "fp-original"),
        other => panic!("expected duplicate, got {other:?}"),
    }
    // Reused id, different payload: the stored fingerprint wins.
    match store.check_and_reserve(&key, "fp-altered").unwrap() {
        Reservation::AlreadyProcessed(r) => assert_eq!(r.fingerprint, "fp-original"),
        other => panic!("expected processed record, got {other:?}"),
    }
    // Marking twice is harmless.
    assert_eq!(store.mark_processed(&key).unwrap().fingerprint, "fp-original");
}

fn release_frees_only_reservations(factory: StoreFactory<'_>) {
    let store = factory(DEFAULT_RETENTION, DEFAULT_RESERVATION_LEASE);

    let reserved = fresh_key();
    store.check_and_reserve(&reserved, "fp").unwrap();
    store.release(&reserved).unwrap();
    assert_eq!(store.check_and_reserve(&reserved, "fp").unwrap(), Reservation::Reserved);

    let processed = fresh_key();
    store.check_and_reserve(&processed, "fp").unwrap();
    store.mark_processed(&processed).unwrap();
    store.release(&processed).unwrap();
    assert!(matches!(
        store.check_and_reserve(&processed, "fp").unwrap(),
        Reservation::AlreadyProcessed(_)
    ));

    // Unknown keys are a no-op.
    store.release(&fresh_key()).unwrap();
}

fn expired_records_are_forgotten(factory: StoreFactory<'_>) {
    let store = factory(SHORT, DEFAULT_RESERVATION_LEASE);
    let key = fresh_key();

    store.check_and_reserve(&key, "fp").unwrap();
    store.mark_processed(&key).unwrap();
    outlive(SHORT);
    store.prune_expired(Utc::now()).unwrap();

    assert_eq!(store.check_and_reserve(&key, "fp").unwrap(), Reservation::Reserved);
}

fn mark_needs_a_live_reservation(factory: StoreFactory<'_>) {
    let store = factory(DEFAULT_RETENTION, SHORT);

    assert!(matches!(
        store.mark_processed(&fresh_key()),
        Err(IdempotencyError::NotReserved(_))
    ));

    let key = fresh_key();
    store.check_and_reserve(&key, "fp").unwrap();
    outlive(SHORT);
    assert!(matches!(
        store.mark_processed(&key),
        Err(IdempotencyError::LeaseExpired(_) | IdempotencyError::NotReserved(_))
    ));
    // Nothing was recorded.
    assert_eq!(store.check_and_reserve(&key, "fp").unwrap(), Reservation::Reserved);
}
