//! Publisher: domain event in, durable broker write out.
//!
//! `publish` is write-through. It returns only once the broker has
//! acknowledged the record, or with an error carrying the original event so
//! the caller can compensate. Nothing is retried in the background unless the
//! caller opts into [`BufferedPublisher`].
//!
//! ## Retry / deadline
//!
//! ```text
//! seal + route + encode (once, one eventId)
//!   └─▶ send_within(time left) ──ok──▶ Ok(eventId)
//!         │
//!         ├─ Unavailable, deadline passed during the call ─────▶ PublishError::Timeout
//!         ├─ Unavailable, attempts left, backoff fits deadline ─▶ sleep, send again
//!         ├─ Unavailable, attempts used up ─────────────────────▶ PublishError::Exhausted
//!         ├─ Unavailable, backoff would cross deadline ─────────▶ PublishError::Timeout
//!         └─ Rejected / Protocol ───────────────────────────────▶ PublishError::Rejected
//! ```
//!
//! Each broker call gets only the time left before the deadline, and no
//! backoff sleep runs past it. An ack is always reported as success, even
//! one that lands after the deadline: the record is durable.
//!
//! Every retry resends the same bytes, so a record that was stored but whose
//! ack got lost shows up downstream as a duplicate of the same `eventId`,
//! which the dispatcher suppresses.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{Span, debug, info, instrument, warn};

use switchyard_core::{CorrelationId, EventId, ServiceId};
use switchyard_events::{
    Broker, BrokerError, DomainEvent, EncodeError, EnvelopeMetadata, OutboundRecord, RouteError,
    RoutingTable, codec,
};

use crate::retry::RetryPolicy;

mod buffered;

pub use buffered::{BufferedPublisher, FailureCallback};

/// Default bound on a single `publish` call.
pub const DEFAULT_PUBLISH_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Stamped on every envelope as `producedBy`.
    pub produced_by: ServiceId,
    pub retry: RetryPolicy,
    pub default_deadline: Duration,
}

impl PublisherConfig {
    /// Five attempts, 100ms doubling to a 2s ceiling, 10s deadline.
    pub fn new(produced_by: ServiceId) -> Self {
        Self {
            produced_by,
            retry: RetryPolicy::exponential(4, Duration::from_millis(100), Duration::from_secs(2)),
            default_deadline: DEFAULT_PUBLISH_DEADLINE,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = deadline;
        self
    }
}

/// Per-call knobs for [`Publisher::publish_with`].
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub deadline: Option<Duration>,
    /// Reuse an identity, e.g. when retrying after a [`TimeoutError`].
    pub event_id: Option<EventId>,
    pub correlation_id: Option<CorrelationId>,
}

impl PublishOptions {
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn event_id(mut self, event_id: EventId) -> Self {
        self.event_id = Some(event_id);
        self
    }

    pub fn correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// The deadline passed before the broker acknowledged the record.
///
/// The outcome is unknown: an attempt may have been stored with its ack lost.
/// Retry with the same `event_id` so consumers can de-duplicate.
#[derive(Debug, Error)]
#[error("publish of {event_id} timed out after {attempts} attempts ({elapsed:?})")]
pub struct TimeoutError {
    pub event: Box<DomainEvent>,
    pub event_id: EventId,
    pub attempts: u32,
    pub elapsed: Duration,
    pub last_error: Option<BrokerError>,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish of {event_id} failed after {attempts} attempts: {source}")]
    Exhausted {
        event: Box<DomainEvent>,
        event_id: EventId,
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error(transparent)]
    Timeout(TimeoutError),

    #[error("broker refused {event_id}: {source}")]
    Rejected {
        event: Box<DomainEvent>,
        event_id: EventId,
        #[source]
        source: BrokerError,
    },

    #[error("event cannot be routed: {source}")]
    Unroutable {
        event: Box<DomainEvent>,
        #[source]
        source: RouteError,
    },

    #[error("event cannot be encoded: {source}")]
    Encode {
        event: Box<DomainEvent>,
        #[source]
        source: EncodeError,
    },

    #[error("publish buffer is full")]
    Backpressure { event: Box<DomainEvent> },

    #[error("publish buffer is closed")]
    BufferClosed { event: Box<DomainEvent> },
}

impl PublishError {
    /// True when the event may or may not have been stored.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, PublishError::Timeout(_))
    }

    pub fn event(&self) -> &DomainEvent {
        match self {
            PublishError::Exhausted { event, .. }
            | PublishError::Rejected { event, .. }
            | PublishError::Unroutable { event, .. }
            | PublishError::Encode { event, .. }
            | PublishError::Backpressure { event }
            | PublishError::BufferClosed { event } => event,
            PublishError::Timeout(t) => &t.event,
        }
    }

    /// Take back the event for compensation or a later retry.
    pub fn into_event(self) -> DomainEvent {
        match self {
            PublishError::Exhausted { event, .. }
            | PublishError::Rejected { event, .. }
            | PublishError::Unroutable { event, .. }
            | PublishError::Encode { event, .. }
            | PublishError::Backpressure { event }
            | PublishError::BufferClosed { event } => *event,
            PublishError::Timeout(t) => *t.event,
        }
    }

    /// Identity assigned before the failure, if it got that far.
    pub fn event_id(&self) -> Option<EventId> {
        match self {
            PublishError::Exhausted { event_id, .. } | PublishError::Rejected { event_id, .. } => {
                Some(*event_id)
            }
            PublishError::Timeout(t) => Some(t.event_id),
            _ => None,
        }
    }
}

/// Synchronous, thread-safe publisher.
///
/// Holds only immutable state, so one instance (or clones of it) can serve
/// any number of concurrent callers.
#[derive(Debug, Clone)]
pub struct Publisher<B> {
    routing: Arc<RoutingTable>,
    broker: B,
    config: PublisherConfig,
}

impl<B: Broker> Publisher<B> {
    pub fn new(routing: Arc<RoutingTable>, broker: B, config: PublisherConfig) -> Self {
        Self {
            routing,
            broker,
            config,
        }
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Publish with a fresh `eventId` and the default deadline.
    pub fn publish(&self, event: DomainEvent) -> Result<EventId, PublishError> {
        self.publish_with(event, PublishOptions::default())
    }

    #[instrument(
        skip(self, event, options),
        fields(
            event_type = %event.kind(),
            tenant_id = %event.tenant_id(),
            event_id,
            topic,
            partition,
            attempts,
        ),
        err
    )]
    pub fn publish_with(
        &self,
        event: DomainEvent,
        options: PublishOptions,
    ) -> Result<EventId, PublishError> {
        let started = Instant::now();
        let deadline = started + options.deadline.unwrap_or(self.config.default_deadline);
        let event_id = options.event_id.unwrap_or_default();

        let span = Span::current();
        span.record("event_id", tracing::field::display(event_id));

        let metadata = EnvelopeMetadata::new(event_id, self.config.produced_by.clone())
            .with_correlation(options.correlation_id);
        let (envelope, payload) = match codec::encode_event(&event, metadata) {
            Ok(encoded) => encoded,
            Err(source) => {
                return Err(PublishError::Encode {
                    event: Box::new(event),
                    source,
                });
            }
        };
        let route = match self.routing.route(&envelope) {
            Ok(route) => route,
            Err(source) => {
                return Err(PublishError::Unroutable {
                    event: Box::new(event),
                    source,
                });
            }
        };

        span.record("topic", route.channel.topic());
        span.record("partition", route.partition);

        let record = OutboundRecord {
            topic: route.channel.topic().to_string(),
            partition: route.partition,
            key: route.partition_key,
            payload,
        };

        let mut attempts = 0u32;
        let mut last_error = None;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PublishError::Timeout(TimeoutError {
                    event: Box::new(event),
                    event_id,
                    attempts,
                    elapsed: started.elapsed(),
                    last_error,
                }));
            }

            attempts += 1;
            span.record("attempts", attempts);

            match self.broker.send_within(&record, remaining) {
                Ok(ack) => {
                    debug!(position = %ack.position, "broker acknowledged");
                    if Instant::now() > deadline {
                        warn!(
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "ack arrived after the deadline"
                        );
                    }
                    if attempts > 1 {
                        info!(attempts, "publish recovered after retries");
                    }
                    return Ok(event_id);
                }
                Err(e) if !e.is_transient() => {
                    return Err(PublishError::Rejected {
                        event: Box::new(event),
                        event_id,
                        source: e,
                    });
                }
                Err(e) if Instant::now() >= deadline => {
                    return Err(PublishError::Timeout(TimeoutError {
                        event: Box::new(event),
                        event_id,
                        attempts,
                        elapsed: started.elapsed(),
                        last_error: Some(e),
                    }));
                }
                Err(e) => {
                    if attempts >= self.config.retry.max_attempts() {
                        return Err(PublishError::Exhausted {
                            event: Box::new(event),
                            event_id,
                            attempts,
                            source: e,
                        });
                    }

                    let delay = self.config.retry.delay_for_retry(attempts);
                    if Instant::now() + delay >= deadline {
                        return Err(PublishError::Timeout(TimeoutError {
                            event: Box::new(event),
                            event_id,
                            attempts,
                            elapsed: started.elapsed(),
                            last_error: Some(e),
                        }));
                    }

                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "broker unavailable, retrying publish"
                    );
                    last_error = Some(e);
                    thread::sleep(delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::{AggregateId, TenantId};
    use switchyard_events::{InMemoryBroker, OutboundRecord, BrokerAck, codec::decode, payload};

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy::fixed(max_retries, Duration::from_millis(1))
    }

    fn publisher(broker: Arc<InMemoryBroker>, retry: RetryPolicy) -> Publisher<Arc<InMemoryBroker>> {
        let routing = Arc::new(RoutingTable::standard(4).unwrap());
        let config = PublisherConfig::new(ServiceId::new("crm-service").unwrap()).with_retry(retry);
        Publisher::new(routing, broker, config)
    }

    fn customer_created(aggregate: &str) -> DomainEvent {
        DomainEvent::new(
            TenantId::new("t1").unwrap(),
            AggregateId::new(aggregate).unwrap(),
            payload::CustomerCreated {
                name: "Ada".to_string(),
                email: None,
            },
        )
    }

    #[test]
    fn publishes_to_the_routed_partition() {
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = publisher(broker.clone(), fast_retry(0));

        let event_id = publisher.publish(customer_created("cust-1")).unwrap();

        let channel = publisher.routing().channel("crm.customer.events").unwrap();
        let partition = channel.partition_for("cust-1");
        let records = broker.records("crm.customer.events", partition);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "cust-1");

        let envelope = decode(&records[0].payload).unwrap();
        assert_eq!(envelope.event_id(), event_id);
        assert_eq!(envelope.produced_by().as_str(), "crm-service");
    }

    #[test]
    fn transient_failures_are_retried_with_the_same_event_id() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.fail_next_sends(2);
        let publisher = publisher(broker.clone(), fast_retry(4));

        let event_id = publisher.publish(customer_created("cust-1")).unwrap();

        assert_eq!(broker.send_attempts(), 3);
        let stored = broker.topic_records("crm.customer.events");
        assert_eq!(stored.len(), 1);
        assert_eq!(decode(&stored[0].payload).unwrap().event_id(), event_id);
    }

    #[test]
    fn outage_longer_than_the_retry_window_returns_the_event() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_available(false);
        let publisher = publisher(broker.clone(), fast_retry(2));

        let err = publisher.publish(customer_created("cust-1")).unwrap_err();

        assert!(matches!(err, PublishError::Exhausted { attempts: 3, .. }));
        assert!(!err.is_ambiguous());
        assert_eq!(broker.send_attempts(), 3);
        assert_eq!(err.into_event().aggregate_id().unwrap().as_str(), "cust-1");
    }

    #[test]
    fn deadline_yields_an_ambiguous_timeout() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_available(false);
        let retry = RetryPolicy::fixed(10, Duration::from_millis(50));
        let publisher = publisher(broker, retry);

        let options = PublishOptions::default().deadline(Duration::from_millis(20));
        let err = publisher
            .publish_with(customer_created("cust-1"), options)
            .unwrap_err();

        match &err {
            PublishError::Timeout(t) => {
                assert_eq!(t.attempts, 1);
                assert!(t.last_error.is_some());
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(err.is_ambiguous());
    }

    #[test]
    fn caller_supplied_identity_is_kept() {
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = publisher(broker.clone(), fast_retry(0));
        let event_id = EventId::new();
        let correlation = CorrelationId::new("req-42").unwrap();

        let returned = publisher
            .publish_with(
                customer_created("cust-1"),
                PublishOptions::default()
                    .event_id(event_id)
                    .correlation_id(correlation.clone()),
            )
            .unwrap();

        assert_eq!(returned, event_id);
        let envelope = decode(&broker.topic_records("crm.customer.events")[0].payload).unwrap();
        assert_eq!(envelope.correlation_id(), Some(&correlation));
    }

    #[test]
    fn aggregate_channel_without_aggregate_is_unroutable() {
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = publisher(broker.clone(), fast_retry(0));
        let event = DomainEvent::for_tenant(
            TenantId::new("t1").unwrap(),
            payload::CustomerDeactivated {
                reason: "churn".to_string(),
            },
        );

        let err = publisher.publish(event).unwrap_err();

        assert!(matches!(err, PublishError::Unroutable { .. }));
        assert_eq!(broker.send_attempts(), 0);
    }

    struct RejectingBroker;

    impl Broker for RejectingBroker {
        fn send(&self, _record: &OutboundRecord) -> Result<BrokerAck, BrokerError> {
            Err(BrokerError::Rejected("record too large".to_string()))
        }

        fn fetch(
            &self,
            _topic: &str,
            _partition: u32,
            _group: &str,
            _max: usize,
        ) -> Result<Vec<switchyard_events::Delivery>, BrokerError> {
            Ok(Vec::new())
        }

        fn commit(
            &self,
            _group: &str,
            _delivery: &switchyard_events::Delivery,
        ) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[test]
    fn rejections_are_not_retried() {
        let routing = Arc::new(RoutingTable::standard(4).unwrap());
        let config = PublisherConfig::new(ServiceId::new("crm-service").unwrap())
            .with_retry(fast_retry(5));
        let publisher = Publisher::new(routing, RejectingBroker, config);

        let err = publisher.publish(customer_created("cust-1")).unwrap_err();

        assert!(matches!(err, PublishError::Rejected { .. }));
        assert!(err.event_id().is_some());
    }

    /// Takes `delay` per send, then reports the broker unavailable.
    struct SlowBroker {
        delay: Duration,
        timeouts: std::sync::Mutex<Vec<Duration>>,
    }

    impl SlowBroker {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                timeouts: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    impl Broker for SlowBroker {
        fn send(&self, _record: &OutboundRecord) -> Result<BrokerAck, BrokerError> {
            thread::sleep(self.delay);
            Err(BrokerError::Unavailable("slow".to_string()))
        }

        fn send_within(
            &self,
            record: &OutboundRecord,
            timeout: Duration,
        ) -> Result<BrokerAck, BrokerError> {
            self.timeouts.lock().unwrap().push(timeout);
            self.send(record)
        }

        fn fetch(
            &self,
            _topic: &str,
            _partition: u32,
            _group: &str,
            _max: usize,
        ) -> Result<Vec<switchyard_events::Delivery>, BrokerError> {
            Ok(Vec::new())
        }

        fn commit(
            &self,
            _group: &str,
            _delivery: &switchyard_events::Delivery,
        ) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[test]
    fn slow_send_past_the_deadline_is_a_timeout() {
        let routing = Arc::new(RoutingTable::standard(4).unwrap());
        let config = PublisherConfig::new(ServiceId::new("crm-service").unwrap())
            .with_retry(fast_retry(0));
        let broker = Arc::new(SlowBroker::new(Duration::from_millis(300)));
        let publisher = Publisher::new(routing, broker.clone(), config);

        let options = PublishOptions::default().deadline(Duration::from_millis(20));
        let err = publisher
            .publish_with(customer_created("cust-1"), options)
            .unwrap_err();

        match &err {
            PublishError::Timeout(t) => {
                assert_eq!(t.attempts, 1);
                assert_eq!(t.last_error, Some(BrokerError::Unavailable("slow".to_string())));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(err.is_ambiguous());
        assert_eq!(err.into_event().aggregate_id().unwrap().as_str(), "cust-1");
    }

    #[test]
    fn broker_calls_get_only_the_time_left() {
        let routing = Arc::new(RoutingTable::standard(4).unwrap());
        let config = PublisherConfig::new(ServiceId::new("crm-service").unwrap())
            .with_retry(RetryPolicy::fixed(10, Duration::from_millis(1)));
        let broker = Arc::new(SlowBroker::new(Duration::from_millis(15)));
        let publisher = Publisher::new(routing, broker.clone(), config);

        let deadline = Duration::from_millis(100);
        let err = publisher
            .publish_with(customer_created("cust-1"), PublishOptions::default().deadline(deadline))
            .unwrap_err();
        assert!(matches!(err, PublishError::Timeout(_)));

        let timeouts = broker.timeouts.lock().unwrap();
        assert!(timeouts.len() >= 2);
        assert!(timeouts.iter().all(|t| *t <= deadline));
        assert!(timeouts.windows(2).all(|w| w[1] < w[0]));
    }
}
