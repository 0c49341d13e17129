use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{
    DEFAULT_RESERVATION_LEASE, DEFAULT_RETENTION, DeliveryKey, DeliveryRecord, IdempotencyError,
    IdempotencyStore, Reservation, chrono_duration,
};

#[derive(Debug, Clone)]
enum Entry {
    Reserved {
        fingerprint: String,
        lease_expires_at: DateTime<Utc>,
    },
    Processed {
        record: DeliveryRecord,
        expires_at: DateTime<Utc>,
    },
}

/// In-memory idempotency store.
///
/// Intended for tests/dev and single-process deployments. One mutex guards
/// the whole map, which makes every operation trivially atomic per key.
#[derive(Debug)]
pub struct InMemoryIdempotencyStore {
    entries: Mutex<HashMap<DeliveryKey, Entry>>,
    retention: Duration,
    reservation_lease: Duration,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::with_windows(DEFAULT_RETENTION, DEFAULT_RESERVATION_LEASE)
    }

    pub fn with_windows(retention: Duration, reservation_lease: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention,
            reservation_lease,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<DeliveryKey, Entry>>, IdempotencyError> {
        self.entries
            .lock()
            .map_err(|_| IdempotencyError::Unavailable("lock poisoned".to_string()))
    }

    /// Processed record for a key, if any.
    pub fn record(&self, key: &DeliveryKey) -> Option<DeliveryRecord> {
        match self.lock().ok()?.get(key) {
            Some(Entry::Processed { record, .. }) => Some(record.clone()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn check_and_reserve(
        &self,
        key: &DeliveryKey,
        fingerprint: &str,
    ) -> Result<Reservation, IdempotencyError> {
        let now = Utc::now();
        let mut entries = self.lock()?;

        match entries.get(key) {
            Some(Entry::Processed { record, .. }) => {
                return Ok(Reservation::AlreadyProcessed(record.clone()));
            }
            Some(Entry::Reserved {
                lease_expires_at, ..
            }) if *lease_expires_at > now => {
                return Ok(Reservation::InFlight {
                    lease_expires_at: *lease_expires_at,
                });
            }
            // Absent, or a lease left behind by a dead worker.
            _ => {}
        }

        entries.insert(
            key.clone(),
            Entry::Reserved {
                fingerprint: fingerprint.to_string(),
                lease_expires_at: now + chrono_duration(self.reservation_lease),
            },
        );
        Ok(Reservation::Reserved)
    }

    fn mark_processed(&self, key: &DeliveryKey) -> Result<DeliveryRecord, IdempotencyError> {
        let now = Utc::now();
        let mut entries = self.lock()?;

        let fingerprint = match entries.get(key) {
            Some(Entry::Reserved {
                fingerprint,
                lease_expires_at,
            }) if *lease_expires_at > now => fingerprint.clone(),
            Some(Entry::Reserved { .. }) => {
                return Err(IdempotencyError::LeaseExpired(key.clone()));
            }
            Some(Entry::Processed { record, .. }) => return Ok(record.clone()),
            None => return Err(IdempotencyError::NotReserved(key.clone())),
        };

        let record = DeliveryRecord {
            event_id: key.event_id,
            consumer_group: key.consumer_group.clone(),
            fingerprint,
            processed_at: now,
        };
        entries.insert(
            key.clone(),
            Entry::Processed {
                record: record.clone(),
                expires_at: now + chrono_duration(self.retention),
            },
        );
        Ok(record)
    }

    fn release(&self, key: &DeliveryKey) -> Result<(), IdempotencyError> {
        let mut entries = self.lock()?;
        if let Some(Entry::Reserved { .. }) = entries.get(key) {
            entries.remove(key);
        }
        Ok(())
    }

    fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, IdempotencyError> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, entry| match entry {
            Entry::Reserved {
                lease_expires_at, ..
            } => *lease_expires_at > now,
            Entry::Processed { expires_at, .. } => *expires_at > now,
        });
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use switchyard_core::{ConsumerGroup, EventId};

    fn key() -> DeliveryKey {
        DeliveryKey::new(EventId::new(), ConsumerGroup::new("billing").unwrap())
    }

    #[test]
    fn reserve_mark_then_duplicate() {
        let store = InMemoryIdempotencyStore::new();
        let k = key();

        assert_eq!(store.check_and_reserve(&k, "fp").unwrap(), Reservation::Reserved);
        assert!(matches!(
            store.check_and_reserve(&k, "fp").unwrap(),
            Reservation::InFlight { .. }
        ));

        let record = store.mark_processed(&k).unwrap();
        assert_eq!(record.fingerprint, "fp");

        match store.check_and_reserve(&k, "fp").unwrap() {
            Reservation::AlreadyProcessed(r) => assert_eq!(r, record),
            other => panic!("expected duplicate, got {other:?}"),
        }
    }

    #[test]
    fn groups_are_independent() {
        let store = InMemoryIdempotencyStore::new();
        let event_id = EventId::new();
        let billing = DeliveryKey::new(event_id, ConsumerGroup::new("billing").unwrap());
        let crm = DeliveryKey::new(event_id, ConsumerGroup::new("crm").unwrap());

        store.check_and_reserve(&billing, "fp").unwrap();
        store.mark_processed(&billing).unwrap();

        assert_eq!(store.check_and_reserve(&crm, "fp").unwrap(), Reservation::Reserved);
    }

    #[test]
    fn released_keys_can_be_reserved_again() {
        let store = InMemoryIdempotencyStore::new();
        let k = key();
        store.check_and_reserve(&k, "fp").unwrap();
        store.release(&k).unwrap();
        assert_eq!(store.check_and_reserve(&k, "fp").unwrap(), Reservation::Reserved);
    }

    #[test]
    fn expired_lease_is_taken_over() {
        let store = InMemoryIdempotencyStore::with_windows(DEFAULT_RETENTION, Duration::ZERO);
        let k = key();
        store.check_and_reserve(&k, "fp").unwrap();
        assert_eq!(store.check_and_reserve(&k, "fp").unwrap(), Reservation::Reserved);
    }

    #[test]
    fn mark_without_reservation_is_an_error() {
        let store = InMemoryIdempotencyStore::new();
        assert!(matches!(
            store.mark_processed(&key()),
            Err(IdempotencyError::NotReserved(_))
        ));
    }

    #[test]
    fn mark_after_lease_expiry_is_refused() {
        let store = InMemoryIdempotencyStore::with_windows(DEFAULT_RETENTION, Duration::ZERO);
        let k = key();
        store.check_and_reserve(&k, "fp").unwrap();

        assert!(matches!(
            store.mark_processed(&k),
            Err(IdempotencyError::LeaseExpired(expired)) if expired == k
        ));
        // Nothing was recorded; the delivery can be reserved afresh.
        assert_eq!(store.check_and_reserve(&k, "fp").unwrap(), Reservation::Reserved);
    }

    #[test]
    fn prune_drops_records_past_retention() {
        let store = InMemoryIdempotencyStore::with_windows(
            Duration::from_secs(60),
            DEFAULT_RESERVATION_LEASE,
        );
        let k = key();
        store.check_and_reserve(&k, "fp").unwrap();
        store.mark_processed(&k).unwrap();

        assert_eq!(store.prune_expired(Utc::now()).unwrap(), 0);
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(store.prune_expired(later).unwrap(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn concurrent_reservations_have_one_winner() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let k = key();
        let winners = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let k = k.clone();
                let winners = winners.clone();
                thread::spawn(move || {
                    if store.check_and_reserve(&k, "fp").unwrap() == Reservation::Reserved {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn satisfies_the_store_contract() {
        crate::idempotency::contract::run_all(&|retention, lease| {
            Arc::new(InMemoryIdempotencyStore::with_windows(retention, lease))
        });
    }
}
