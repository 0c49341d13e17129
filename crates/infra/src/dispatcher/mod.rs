//! Consumer dispatcher: broker deliveries in, handler invocations out.
//!
//! For one consumer group the dispatcher subscribes to a set of channels and
//! runs one worker per (channel, partition). Within a partition deliveries
//! are handled strictly one after another, which is what keeps per-aggregate
//! order end to end.
//!
//! ## One delivery
//!
//! ```text
//! decode ──fail──────────────────────────────────────────────▶ dead-letter, commit
//!   │
//! check_and_reserve(eventId, group)
//!   ├─ AlreadyProcessed, same fingerprint ────────────────────▶ commit (duplicate)
//!   ├─ AlreadyProcessed, other fingerprint ───────────────────▶ dead-letter, commit
//!   ├─ InFlight ──────────────────────────────────────────────▶ leave uncommitted, re-fetch later
//!   └─ Reserved
//!        │
//!      handler lookup ──none──────────────────────────────────▶ dead-letter, release, commit
//!        │
//!      handler (1 + max_retries tries, panics count as Retry)
//!        ├─ Ack ──────────▶ mark_processed, commit
//!        └─ gave up ──────▶ dead-letter, release reservation, commit
//! ```
//!
//! Nothing is committed unless its outcome is durable: a failed
//! idempotency write or dead-letter write leaves the delivery uncommitted so
//! the broker hands it out again.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{Span, debug, error, info, instrument, warn};

use switchyard_core::ConsumerGroup;
use switchyard_events::{
    Broker, BrokerError, ConfigurationError, Delivery, EventEnvelope, EventHandler, EventKind,
    HandlerOutcome, RoutingTable, codec,
};

use crate::dead_letter::{DeadLetter, DeadLetterError, DeadLetterReason, DeadLetterSink};
use crate::idempotency::{DeliveryKey, IdempotencyError, IdempotencyStore, Reservation};
use crate::retry::RetryPolicy;

mod worker;

pub use worker::DispatcherHandle;

/// Handlers keyed by event type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `kind`.
    pub fn register(&mut self, kind: EventKind, handler: impl EventHandler + 'static) -> &mut Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn with(mut self, kind: EventKind, handler: impl EventHandler + 'static) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn get(&self, kind: EventKind) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(&kind)
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Which partitions of each subscribed channel this instance consumes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PartitionAssignment {
    #[default]
    All,
    /// Only these partition numbers; numbers beyond a channel's count are
    /// ignored for that channel.
    Only(Vec<u32>),
}

impl PartitionAssignment {
    pub fn resolve(&self, partitions: u32) -> Vec<u32> {
        match self {
            PartitionAssignment::All => (0..partitions).collect(),
            PartitionAssignment::Only(wanted) => {
                let mut picked: Vec<u32> =
                    wanted.iter().copied().filter(|p| *p < partitions).collect();
                picked.sort_unstable();
                picked.dedup();
                picked
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub consumer_group: ConsumerGroup,
    /// Channel names, as declared in the routing table.
    pub channels: Vec<String>,
    pub partitions: PartitionAssignment,
    /// Deliveries fetched per broker call.
    pub batch_size: usize,
    /// Sleep when a partition is idle or the broker is failing.
    pub poll_interval: Duration,
    /// Handler retries; a handler runs at most `1 + max_retries` times.
    pub retry: RetryPolicy,
    /// Refuse to start if a subscribed event type has no handler.
    pub require_handlers: bool,
}

impl DispatcherConfig {
    pub fn new(consumer_group: ConsumerGroup, channels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            consumer_group,
            channels: channels.into_iter().map(Into::into).collect(),
            partitions: PartitionAssignment::All,
            batch_size: 32,
            poll_interval: Duration::from_millis(100),
            retry: RetryPolicy::exponential(3, Duration::from_millis(50), Duration::from_secs(1)),
            require_handlers: false,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_partitions(mut self, partitions: PartitionAssignment) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn require_handlers(mut self) -> Self {
        self.require_handlers = true;
        self
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handler succeeded; recorded and committed.
    Committed,
    /// Already processed by this group; committed without running the handler.
    Duplicate,
    /// Parked in the dead-letter topic and committed.
    DeadLettered,
    /// Another worker holds the reservation; left uncommitted for a later fetch.
    Deferred,
}

/// Infrastructure failure while handling a delivery. The delivery is left
/// uncommitted and will be delivered again.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),

    #[error("dead-letter write failed: {0}")]
    DeadLetter(#[from] DeadLetterError),

    #[error("commit failed: {0}")]
    Commit(#[source] BrokerError),

    #[error("fetch failed: {0}")]
    Fetch(#[source] BrokerError),
}

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("failed to spawn dispatcher worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Counters since the dispatcher was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub processed: u64,
    pub duplicates: u64,
    pub dead_lettered: u64,
    pub deferred: u64,
    /// Handler invocations that asked for a retry, panicked, or rejected.
    pub handler_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    duplicates: AtomicU64,
    dead_lettered: AtomicU64,
    deferred: AtomicU64,
    handler_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            processed: self.processed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

struct Inner<B, S> {
    routing: Arc<RoutingTable>,
    broker: B,
    store: S,
    dead_letters: Arc<dyn DeadLetterSink>,
    handlers: HandlerRegistry,
    config: DispatcherConfig,
    counters: Counters,
}

/// Validated consumer for one group. Cheap to clone; clones share state.
pub struct ConsumerDispatcher<B, S> {
    inner: Arc<Inner<B, S>>,
}

impl<B, S> Clone for ConsumerDispatcher<B, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// A partition this dispatcher consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub channel: String,
    pub topic: String,
    pub partition: u32,
}

/// Handler verdict after retries.
enum Verdict {
    Ack,
    GaveUp { attempts: u32, reason: DeadLetterReason },
}

impl<B: Broker, S: IdempotencyStore> ConsumerDispatcher<B, S> {
    /// Check the wiring and build the dispatcher.
    pub fn new(
        routing: Arc<RoutingTable>,
        broker: B,
        store: S,
        dead_letters: Arc<dyn DeadLetterSink>,
        handlers: HandlerRegistry,
        config: DispatcherConfig,
    ) -> Result<Self, ConfigurationError> {
        if let Err(e) = validate(&routing, &handlers, &config) {
            error!(consumer_group = %config.consumer_group, error = %e, "dispatcher misconfigured");
            return Err(e);
        }

        Ok(Self {
            inner: Arc::new(Inner {
                routing,
                broker,
                store,
                dead_letters,
                handlers,
                config,
                counters: Counters::default(),
            }),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> DispatcherStats {
        self.inner.counters.snapshot()
    }

    /// Every (channel, partition) this instance consumes.
    pub fn assignments(&self) -> Vec<Assignment> {
        let config = &self.inner.config;
        config
            .channels
            .iter()
            .filter_map(|name| self.inner.routing.channel(name))
            .flat_map(|channel| {
                config
                    .partitions
                    .resolve(channel.partitions())
                    .into_iter()
                    .map(|partition| Assignment {
                        channel: channel.name().to_string(),
                        topic: channel.topic().to_string(),
                        partition,
                    })
            })
            .collect()
    }

    /// One fetch per assigned partition, handling what comes back. Returns
    /// the number of deliveries that reached a final outcome.
    ///
    /// Stops early on a partition when a delivery is deferred or fails, so
    /// later deliveries never overtake it.
    pub fn poll_once(&self) -> Result<usize, DispatchError> {
        let mut handled = 0;
        for assignment in self.assignments() {
            handled += self.poll_partition(&assignment)?;
        }
        Ok(handled)
    }

    pub(crate) fn poll_partition(&self, assignment: &Assignment) -> Result<usize, DispatchError> {
        let config = &self.inner.config;
        let batch = self
            .inner
            .broker
            .fetch(
                &assignment.topic,
                assignment.partition,
                config.consumer_group.as_str(),
                config.batch_size,
            )
            .map_err(DispatchError::Fetch)?;

        let mut handled = 0;
        for delivery in &batch {
            match self.process_delivery(delivery)? {
                DeliveryOutcome::Deferred => break,
                _ => handled += 1,
            }
        }
        Ok(handled)
    }

    /// Handle one delivery end to end, committing it unless deferred.
    #[instrument(
        skip(self, delivery),
        fields(
            consumer_group = %self.inner.config.consumer_group,
            topic = %delivery.topic,
            partition = delivery.partition,
            position = %delivery.position,
            event_id,
            event_type,
        ),
        err
    )]
    pub fn process_delivery(&self, delivery: &Delivery) -> Result<DeliveryOutcome, DispatchError> {
        let inner = &*self.inner;
        let group = &inner.config.consumer_group;

        let envelope = match codec::decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "undecodable delivery");
                let reason = DeadLetterReason::Decode {
                    error: e.to_string(),
                };
                return self.dead_letter(delivery, None, 0, reason, None);
            }
        };

        let span = Span::current();
        span.record("event_id", tracing::field::display(envelope.event_id()));
        span.record("event_type", envelope.event_type().as_str());

        let key = DeliveryKey::new(envelope.event_id(), group.clone());
        let fingerprint = envelope.fingerprint();

        match inner.store.check_and_reserve(&key, &fingerprint)? {
            Reservation::Reserved => {}
            Reservation::AlreadyProcessed(record) if record.fingerprint == fingerprint => {
                debug!(processed_at = %record.processed_at, "duplicate delivery suppressed");
                self.commit(delivery)?;
                Counters::bump(&inner.counters.duplicates);
                return Ok(DeliveryOutcome::Duplicate);
            }
            Reservation::AlreadyProcessed(record) => {
                warn!("eventId already processed with a different payload");
                let reason = DeadLetterReason::PayloadConflict {
                    processed_fingerprint: record.fingerprint,
                    delivered_fingerprint: fingerprint,
                };
                return self.dead_letter(delivery, Some(envelope), 0, reason, None);
            }
            Reservation::InFlight { lease_expires_at } => {
                debug!(%lease_expires_at, "delivery in flight elsewhere, deferring");
                Counters::bump(&inner.counters.deferred);
                return Ok(DeliveryOutcome::Deferred);
            }
        }

        let Some(handler) = inner.handlers.get(envelope.event_type()) else {
            error!("no handler registered for delivered event type");
            let reason = DeadLetterReason::MissingHandler {
                event_type: envelope.event_type(),
            };
            return self.dead_letter(delivery, Some(envelope), 0, reason, Some(&key));
        };

        match self.run_handler(handler.as_ref(), &envelope) {
            Verdict::Ack => {
                if let Err(e) = inner.store.mark_processed(&key) {
                    error!(error = %e, "handler succeeded but the idempotency record was not written");
                    // An expired lease may already belong to another worker.
                    if !matches!(
                        e,
                        IdempotencyError::LeaseExpired(_) | IdempotencyError::NotReserved(_)
                    ) {
                        self.release(&key);
                    }
                    return Err(e.into());
                }
                self.commit(delivery)?;
                Counters::bump(&inner.counters.processed);
                Ok(DeliveryOutcome::Committed)
            }
            Verdict::GaveUp { attempts, reason } => {
                self.dead_letter(delivery, Some(envelope), attempts, reason, Some(&key))
            }
        }
    }

    fn run_handler(&self, handler: &dyn EventHandler, envelope: &EventEnvelope) -> Verdict {
        let inner = &*self.inner;
        let retry = &inner.config.retry;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(envelope)))
                .unwrap_or_else(|panic| HandlerOutcome::Retry(panic_message(panic.as_ref())));

            match outcome {
                HandlerOutcome::Ack => return Verdict::Ack,
                HandlerOutcome::DeadLetter(reason) => {
                    Counters::bump(&inner.counters.handler_failures);
                    warn!(attempt = attempts, %reason, "handler rejected event");
                    return Verdict::GaveUp {
                        attempts,
                        reason: DeadLetterReason::HandlerRejected { reason },
                    };
                }
                HandlerOutcome::Retry(last_error) => {
                    Counters::bump(&inner.counters.handler_failures);
                    if !retry.should_retry(attempts - 1) {
                        warn!(attempts, error = %last_error, "handler retries exhausted");
                        return Verdict::GaveUp {
                            attempts,
                            reason: DeadLetterReason::HandlerExhausted { last_error },
                        };
                    }
                    let delay = retry.delay_for_retry(attempts);
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %last_error,
                        "handler failed, retrying"
                    );
                    thread::sleep(delay);
                }
            }
        }
    }

    fn dead_letter(
        &self,
        delivery: &Delivery,
        envelope: Option<EventEnvelope>,
        attempts: u32,
        reason: DeadLetterReason,
        reservation: Option<&DeliveryKey>,
    ) -> Result<DeliveryOutcome, DispatchError> {
        let inner = &*self.inner;
        let letter = DeadLetter::from_delivery(
            delivery,
            inner.config.consumer_group.as_str(),
            envelope,
            attempts,
            reason,
        );

        if let Err(e) = inner.dead_letters.write(&letter) {
            error!(error = %e, "dead-letter write failed, leaving delivery uncommitted");
            if let Some(key) = reservation {
                self.release(key);
            }
            return Err(e.into());
        }
        warn!(reason = %letter.reason, attempts, "delivery dead-lettered");

        if let Some(key) = reservation {
            self.release(key);
        }
        self.commit(delivery)?;
        Counters::bump(&inner.counters.dead_lettered);
        Ok(DeliveryOutcome::DeadLettered)
    }

    fn release(&self, key: &DeliveryKey) {
        if let Err(e) = self.inner.store.release(key) {
            warn!(key = %key, error = %e, "failed to release reservation; it will lapse with its lease");
        }
    }

    fn commit(&self, delivery: &Delivery) -> Result<(), DispatchError> {
        self.inner
            .broker
            .commit(self.inner.config.consumer_group.as_str(), delivery)
            .map_err(|e| {
                error!(error = %e, "commit failed; delivery will be redelivered");
                DispatchError::Commit(e)
            })
    }
}

impl<B, S> ConsumerDispatcher<B, S>
where
    B: Broker + 'static,
    S: IdempotencyStore + 'static,
{
    /// Start one worker thread per assigned partition.
    pub fn spawn(&self) -> Result<DispatcherHandle, DispatcherError> {
        let assignments = self.assignments();
        info!(
            consumer_group = %self.inner.config.consumer_group,
            workers = assignments.len(),
            "starting dispatcher"
        );

        let mut handle = DispatcherHandle::default();
        for assignment in assignments {
            match worker::spawn_partition_worker(self.clone(), assignment) {
                Ok(worker) => handle.push(worker),
                Err(e) => {
                    handle.shutdown();
                    return Err(e.into());
                }
            }
        }
        Ok(handle)
    }
}

fn validate(
    routing: &RoutingTable,
    handlers: &HandlerRegistry,
    config: &DispatcherConfig,
) -> Result<(), ConfigurationError> {
    if config.channels.is_empty() {
        return Err(ConfigurationError::NoSubscriptions);
    }
    for name in &config.channels {
        if routing.channel(name).is_none() {
            return Err(ConfigurationError::UnknownChannel(name.clone()));
        }
    }

    for kind in handlers.kinds() {
        let channel = routing.channel_for(kind)?;
        if !config.channels.iter().any(|c| c == channel.name()) {
            return Err(ConfigurationError::UnreachableHandler {
                kind,
                channel: channel.name().to_string(),
            });
        }
    }

    for name in &config.channels {
        for kind in routing.kinds_for(name) {
            if handlers.get(kind).is_none() {
                if config.require_handlers {
                    return Err(ConfigurationError::MissingHandler(kind));
                }
                warn!(
                    consumer_group = %config.consumer_group,
                    channel = %name,
                    event_type = %kind,
                    "subscribed event type has no handler; deliveries will be dead-lettered"
                );
            }
        }
    }
    Ok(())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::BrokerDeadLetterSink;
    use crate::idempotency::InMemoryIdempotencyStore;
    use std::sync::atomic::AtomicUsize;
    use switchyard_events::InMemoryBroker;

    fn routing() -> Arc<RoutingTable> {
        Arc::new(RoutingTable::standard(2).unwrap())
    }

    fn ack() -> impl EventHandler {
        |_: &EventEnvelope| HandlerOutcome::Ack
    }

    fn build(
        handlers: HandlerRegistry,
        config: DispatcherConfig,
    ) -> Result<ConsumerDispatcher<Arc<InMemoryBroker>, InMemoryIdempotencyStore>, ConfigurationError>
    {
        let broker = Arc::new(InMemoryBroker::new());
        ConsumerDispatcher::new(
            routing(),
            broker.clone(),
            InMemoryIdempotencyStore::new(),
            Arc::new(BrokerDeadLetterSink::new(broker)),
            handlers,
            config,
        )
    }

    fn group() -> ConsumerGroup {
        ConsumerGroup::new("billing").unwrap()
    }

    #[test]
    fn unknown_channel_is_rejected_at_startup() {
        let err = build(
            HandlerRegistry::new(),
            DispatcherConfig::new(group(), ["crm.customers"]),
        )
        .err()
        .unwrap();
        assert_eq!(err, ConfigurationError::UnknownChannel("crm.customers".to_string()));
    }

    #[test]
    fn handler_for_unsubscribed_channel_is_rejected() {
        let handlers = HandlerRegistry::new().with(EventKind::InvoicePaid, ack());
        let err = build(handlers, DispatcherConfig::new(group(), ["crm.customer.events"]))
            .err()
            .unwrap();
        assert_eq!(
            err,
            ConfigurationError::UnreachableHandler {
                kind: EventKind::InvoicePaid,
                channel: "finance.invoice.events".to_string(),
            }
        );
    }

    #[test]
    fn strict_mode_requires_every_subscribed_handler() {
        let handlers = HandlerRegistry::new().with(EventKind::CustomerCreated, ack());
        let config = DispatcherConfig::new(group(), ["crm.customer.events"]).require_handlers();
        assert!(matches!(
            build(handlers, config).err(),
            Some(ConfigurationError::MissingHandler(_))
        ));
    }

    #[test]
    fn no_channels_is_rejected() {
        let channels: [&str; 0] = [];
        assert_eq!(
            build(HandlerRegistry::new(), DispatcherConfig::new(group(), channels)).err(),
            Some(ConfigurationError::NoSubscriptions)
        );
    }

    #[test]
    fn explicit_partitions_are_clamped_to_the_channel() {
        let assignment = PartitionAssignment::Only(vec![3, 0, 0, 7]);
        assert_eq!(assignment.resolve(4), vec![0, 3]);
        assert_eq!(PartitionAssignment::All.resolve(3), vec![0, 1, 2]);
    }

    #[test]
    fn assignments_cover_each_subscribed_partition() {
        let dispatcher = build(
            HandlerRegistry::new().with(EventKind::CustomerCreated, ack()),
            DispatcherConfig::new(group(), ["crm.customer.events"]),
        )
        .unwrap();
        let partitions: Vec<u32> = dispatcher
            .assignments()
            .into_iter()
            .map(|a| a.partition)
            .collect();
        assert_eq!(partitions, vec![0, 1]);
    }

    #[test]
    fn undecodable_delivery_is_dead_lettered_and_committed() {
        let broker = Arc::new(InMemoryBroker::new());
        let dispatcher = ConsumerDispatcher::new(
            routing(),
            broker.clone(),
            InMemoryIdempotencyStore::new(),
            Arc::new(BrokerDeadLetterSink::new(broker.clone())),
            HandlerRegistry::new().with(EventKind::CustomerCreated, ack()),
            DispatcherConfig::new(group(), ["crm.customer.events"]),
        )
        .unwrap();

        broker
            .send(&switchyard_events::OutboundRecord {
                topic: "crm.customer.events".to_string(),
                partition: 0,
                key: "cust-1".to_string(),
                payload: b"garbage".to_vec(),
            })
            .unwrap();
        let delivery = broker
            .fetch("crm.customer.events", 0, "billing", 1)
            .unwrap()
            .remove(0);

        let outcome = dispatcher.process_delivery(&delivery).unwrap();

        assert_eq!(outcome, DeliveryOutcome::DeadLettered);
        assert_eq!(broker.committed("billing", "crm.customer.events", 0), 1);
        assert_eq!(broker.records("crm.customer.events.dlq", 0).len(), 1);
    }

    #[test]
    fn panics_are_retried_like_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handler = move |_: &EventEnvelope| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("flaky");
            }
            HandlerOutcome::Ack
        };
        let dispatcher = build(
            HandlerRegistry::new().with(EventKind::CustomerCreated, handler),
            DispatcherConfig::new(group(), ["crm.customer.events"])
                .with_retry(RetryPolicy::fixed(2, Duration::from_millis(1))),
        )
        .unwrap();

        let verdict = dispatcher.run_handler(
            dispatcher.inner.handlers.get(EventKind::CustomerCreated).unwrap().as_ref(),
            &sample_envelope(),
        );

        assert!(matches!(verdict, Verdict::Ack));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.stats().handler_failures, 1);
    }

    fn sample_envelope() -> EventEnvelope {
        use switchyard_core::{AggregateId, EventId, ServiceId, TenantId};
        use switchyard_events::{DomainEvent, EnvelopeMetadata, payload};

        let event = DomainEvent::new(
            TenantId::new("t1").unwrap(),
            AggregateId::new("cust-1").unwrap(),
            payload::CustomerCreated {
                name: "Ada".to_string(),
                email: None,
            },
        );
        EventEnvelope::seal(
            &event,
            EnvelopeMetadata::new(EventId::new(), ServiceId::new("crm").unwrap()),
        )
        .unwrap()
    }

    #[test]
    fn panic_messages_are_kept() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "handler panicked: boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "handler panicked: bang");
    }
}
