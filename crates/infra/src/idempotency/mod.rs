//! Idempotency store: durable record of `(eventId, consumerGroup)` pairs
//! already processed.
//!
//! The dispatcher is the only reader and writer. Every call is atomic per
//! key, so two workers racing on the same delivery (e.g. during a partition
//! rebalance) can never both get [`Reservation::Reserved`].
//!
//! ## Entry lifecycle
//!
//! ```text
//! (absent) ──check_and_reserve──▶ Reserved(lease) ──mark_processed──▶ Processed(retention)
//!     ▲                                │                                   │
//!     └────────── release / lease expiry ┘                     prune_expired ┘
//! ```
//!
//! A reservation is a lease: if the worker holding it dies, the lease runs
//! out and the redelivered message can be reserved again. Processed records
//! are kept for the retention window, which must exceed the broker's longest
//! plausible redelivery delay.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use switchyard_core::{ConsumerGroup, EventId};

#[cfg(test)]
pub(crate) mod contract;
pub mod in_memory;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryIdempotencyStore;
pub use postgres::PostgresIdempotencyStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisIdempotencyStore;

/// Default lifetime of a processed record.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default lease on an in-flight reservation.
pub const DEFAULT_RESERVATION_LEASE: Duration = Duration::from_secs(30);

/// Store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryKey {
    pub event_id: EventId,
    pub consumer_group: ConsumerGroup,
}

impl DeliveryKey {
    pub fn new(event_id: EventId, consumer_group: ConsumerGroup) -> Self {
        Self {
            event_id,
            consumer_group,
        }
    }
}

impl core::fmt::Display for DeliveryKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.consumer_group, self.event_id)
    }
}

/// Proof that a consumer group finished an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub event_id: EventId,
    pub consumer_group: ConsumerGroup,
    /// Envelope fingerprint seen when the event was processed.
    pub fingerprint: String,
    pub processed_at: DateTime<Utc>,
}

/// Result of [`IdempotencyStore::check_and_reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// Caller now owns the key and must `mark_processed` or `release` it.
    Reserved,
    /// Already processed by this group; do not run the handler again.
    AlreadyProcessed(DeliveryRecord),
    /// Another worker holds a live reservation.
    InFlight { lease_expires_at: DateTime<Utc> },
}

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),

    #[error("no reservation held for {0}")]
    NotReserved(DeliveryKey),

    /// The reservation outlived its lease and may now belong to another
    /// worker.
    #[error("reservation lease expired for {0}")]
    LeaseExpired(DeliveryKey),

    #[error("corrupt idempotency entry for {key}: {reason}")]
    Corrupt { key: DeliveryKey, reason: String },
}

pub trait IdempotencyStore: Send + Sync {
    /// Atomically: if `key` is unknown (or its reservation lease expired),
    /// reserve it; otherwise report what holds it.
    fn check_and_reserve(
        &self,
        key: &DeliveryKey,
        fingerprint: &str,
    ) -> Result<Reservation, IdempotencyError>;

    /// Turn a live reservation into a processed record kept for the retention
    /// window. Marking an already processed key returns its record. A lease
    /// that ran out is [`IdempotencyError::LeaseExpired`] where the store
    /// still holds the stale entry, [`IdempotencyError::NotReserved`] where
    /// expiry deleted it (Redis).
    fn mark_processed(&self, key: &DeliveryKey) -> Result<DeliveryRecord, IdempotencyError>;

    /// Drop a reservation without recording success (dead-lettered deliveries
    /// stay replayable).
    fn release(&self, key: &DeliveryKey) -> Result<(), IdempotencyError>;

    /// Remove processed records older than the retention window and expired
    /// reservations. Returns how many entries were removed.
    fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, IdempotencyError>;
}

impl<S> IdempotencyStore for std::sync::Arc<S>
where
    S: IdempotencyStore + ?Sized,
{
    fn check_and_reserve(
        &self,
        key: &DeliveryKey,
        fingerprint: &str,
    ) -> Result<Reservation, IdempotencyError> {
        (**self).check_and_reserve(key, fingerprint)
    }

    fn mark_processed(&self, key: &DeliveryKey) -> Result<DeliveryRecord, IdempotencyError> {
        (**self).mark_processed(key)
    }

    fn release(&self, key: &DeliveryKey) -> Result<(), IdempotencyError> {
        (**self).release(key)
    }

    fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, IdempotencyError> {
        (**self).prune_expired(now)
    }
}

pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}
