//! Opt-in asynchronous publishing through a bounded local buffer.
//!
//! `enqueue` assigns the `eventId` up front and returns immediately. A drain
//! thread publishes buffered events in order through the synchronous
//! [`Publisher`]; anything it cannot publish goes to the failure callback.
//! A full buffer is reported as [`PublishError::Backpressure`].

use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::time::Duration;

use tracing::{debug, info, warn};

use switchyard_core::EventId;
use switchyard_events::{Broker, DomainEvent};

use super::{PublishError, PublishOptions, Publisher};
use crate::workers::{WorkerHandle, shutdown_requested};

/// Receives every buffered publish that ultimately failed.
pub type FailureCallback = Box<dyn Fn(PublishError) + Send + Sync>;

const DRAIN_POLL: Duration = Duration::from_millis(50);

struct Queued {
    event: DomainEvent,
    options: PublishOptions,
}

pub struct BufferedPublisher {
    sender: SyncSender<Queued>,
    worker: WorkerHandle,
}

impl BufferedPublisher {
    pub fn spawn<B>(
        publisher: Publisher<B>,
        capacity: usize,
        on_failure: FailureCallback,
    ) -> std::io::Result<Self>
    where
        B: Broker + 'static,
    {
        let (sender, buffer) = mpsc::sync_channel::<Queued>(capacity);

        let worker = WorkerHandle::spawn("switchyard-publish-buffer", move |shutdown| {
            info!(capacity, "publish buffer started");
            let drain_one = |queued: Queued| {
                if let Err(e) = publisher.publish_with(queued.event, queued.options) {
                    warn!(error = %e, "buffered publish failed");
                    on_failure(e);
                }
            };

            loop {
                match buffer.recv_timeout(DRAIN_POLL) {
                    Ok(queued) => drain_one(queued),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }

                if shutdown_requested(&shutdown) {
                    let mut flushed = 0usize;
                    while let Ok(queued) = buffer.try_recv() {
                        drain_one(queued);
                        flushed += 1;
                    }
                    debug!(flushed, "publish buffer flushed on shutdown");
                    break;
                }
            }
            info!("publish buffer stopped");
        })?;

        Ok(Self { sender, worker })
    }

    /// Buffer an event for publishing with a fresh identity.
    pub fn enqueue(&self, event: DomainEvent) -> Result<EventId, PublishError> {
        self.enqueue_with(event, PublishOptions::default())
    }

    pub fn enqueue_with(
        &self,
        event: DomainEvent,
        mut options: PublishOptions,
    ) -> Result<EventId, PublishError> {
        let event_id = *options.event_id.get_or_insert_with(EventId::new);

        match self.sender.try_send(Queued { event, options }) {
            Ok(()) => Ok(event_id),
            Err(TrySendError::Full(queued)) => Err(PublishError::Backpressure {
                event: Box::new(queued.event),
            }),
            Err(TrySendError::Disconnected(queued)) => Err(PublishError::BufferClosed {
                event: Box::new(queued.event),
            }),
        }
    }

    /// Stop accepting events, publish what is buffered, and join the drain
    /// thread.
    pub fn shutdown(self) {
        let Self { sender, worker } = self;
        drop(sender);
        worker.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::PublisherConfig;
    use crate::retry::RetryPolicy;
    use std::sync::{Arc, Mutex};
    use switchyard_core::{AggregateId, ServiceId, TenantId};
    use switchyard_events::{InMemoryBroker, RoutingTable, payload};

    fn stock_adjusted(sku: &str) -> DomainEvent {
        DomainEvent::new(
            TenantId::new("t1").unwrap(),
            AggregateId::new(sku).unwrap(),
            payload::StockAdjusted {
                sku: sku.to_string(),
                delta: -2,
                reason: "cycle count".to_string(),
            },
        )
    }

    fn publisher(broker: Arc<InMemoryBroker>) -> Publisher<Arc<InMemoryBroker>> {
        Publisher::new(
            Arc::new(RoutingTable::standard(2).unwrap()),
            broker,
            PublisherConfig::new(ServiceId::new("inventory").unwrap())
                .with_retry(RetryPolicy::fixed(1, Duration::from_millis(1))),
        )
    }

    #[test]
    fn buffered_events_are_published_on_shutdown_at_the_latest() {
        let broker = Arc::new(InMemoryBroker::new());
        let buffered =
            BufferedPublisher::spawn(publisher(broker.clone()), 16, Box::new(|_| {})).unwrap();

        let ids: Vec<_> = (0..5)
            .map(|i| buffered.enqueue(stock_adjusted(&format!("sku-{i}"))).unwrap())
            .collect();
        buffered.shutdown();

        assert_eq!(ids.len(), 5);
        assert_eq!(broker.topic_records("supply.inventory.events").len(), 5);
    }

    #[test]
    fn failures_reach_the_callback() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_available(false);
        let failed = Arc::new(Mutex::new(Vec::new()));
        let sink = failed.clone();

        let buffered = BufferedPublisher::spawn(
            publisher(broker),
            4,
            Box::new(move |e| sink.lock().unwrap().push(e.event_id())),
        )
        .unwrap();
        let id = buffered.enqueue(stock_adjusted("sku-1")).unwrap();
        buffered.shutdown();

        assert_eq!(*failed.lock().unwrap(), vec![Some(id)]);
    }

    #[test]
    fn full_buffer_signals_backpressure() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_available(false);
        let slow = Publisher::new(
            Arc::new(RoutingTable::standard(2).unwrap()),
            broker,
            PublisherConfig::new(ServiceId::new("inventory").unwrap())
                .with_retry(RetryPolicy::fixed(50, Duration::from_millis(20))),
        );
        let buffered = BufferedPublisher::spawn(slow, 1, Box::new(|_| {})).unwrap();

        let mut saw_backpressure = false;
        for i in 0..10 {
            if let Err(e) = buffered.enqueue(stock_adjusted(&format!("sku-{i}"))) {
                assert!(matches!(e, PublishError::Backpressure { .. }));
                saw_backpressure = true;
                break;
            }
        }
        assert!(saw_backpressure);
    }
}
