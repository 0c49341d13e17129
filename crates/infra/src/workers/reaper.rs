//! Periodic pruning of expired idempotency entries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{WorkerHandle, sleep_or_shutdown};
use crate::idempotency::IdempotencyStore;

/// Runs [`IdempotencyStore::prune_expired`] every `interval` until shut down.
pub struct IdempotencyReaper;

impl IdempotencyReaper {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

    pub fn spawn<S>(store: Arc<S>, interval: Duration) -> std::io::Result<WorkerHandle>
    where
        S: IdempotencyStore + ?Sized + 'static,
    {
        WorkerHandle::spawn("switchyard-idempotency-reaper", move |shutdown| {
            info!(interval_ms = interval.as_millis() as u64, "idempotency reaper started");
            loop {
                match store.prune_expired(Utc::now()) {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "pruned expired idempotency entries"),
                    Err(e) => warn!(error = %e, "idempotency prune failed"),
                }
                if sleep_or_shutdown(&shutdown, interval) {
                    break;
                }
            }
            info!("idempotency reaper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::{DeliveryKey, InMemoryIdempotencyStore, Reservation};
    use switchyard_core::{ConsumerGroup, EventId};

    #[test]
    fn reaper_prunes_and_stops_on_shutdown() {
        let store = Arc::new(InMemoryIdempotencyStore::with_windows(
            Duration::ZERO,
            Duration::from_secs(30),
        ));
        let key = DeliveryKey::new(EventId::new(), ConsumerGroup::new("crm").unwrap());
        assert_eq!(store.check_and_reserve(&key, "fp").unwrap(), Reservation::Reserved);
        store.mark_processed(&key).unwrap();

        let handle = IdempotencyReaper::spawn(store.clone(), Duration::from_millis(5)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !store.is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();

        assert!(store.is_empty());
    }
}
