//! Infrastructure layer: publisher, consumer dispatcher, idempotency stores,
//! dead letters, broker adapters and configuration.
//!
//! Everything here is synchronous and thread-based. Postgres access bridges
//! into a tokio runtime handle; the Redis adapters (feature `redis`) use the
//! blocking client.

pub mod broker;
pub mod config;
pub mod dead_letter;
pub mod dispatcher;
pub mod idempotency;
pub mod publisher;
pub mod retry;
pub mod workers;

pub use config::{ConfigError, SwitchyardConfig};
pub use dead_letter::{
    BrokerDeadLetterSink, DeadLetter, DeadLetterError, DeadLetterReason, DeadLetterSink,
    dlq_topic, replay_dead_letter,
};
pub use dispatcher::{
    ConsumerDispatcher, DeliveryOutcome, DispatchError, DispatcherConfig, DispatcherError,
    DispatcherHandle, DispatcherStats, HandlerRegistry, PartitionAssignment,
};
pub use idempotency::{
    DeliveryKey, DeliveryRecord, IdempotencyError, IdempotencyStore, InMemoryIdempotencyStore,
    PostgresIdempotencyStore, Reservation,
};
pub use publisher::{
    BufferedPublisher, PublishError, PublishOptions, Publisher, PublisherConfig, TimeoutError,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use workers::{IdempotencyReaper, WorkerHandle};
