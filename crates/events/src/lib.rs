//! Domain event model, envelope codec and routing.
//!
//! Everything in this crate is transport-agnostic mechanics: the closed set
//! of event variants, the wire envelope, the validated routing table, and the
//! broker/handler contracts that `switchyard-infra` builds the publisher and
//! dispatcher on.

pub mod broker;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod event;
pub mod handler;
pub mod in_memory_broker;
pub mod payload;
pub mod routing;

pub use broker::{Broker, BrokerAck, BrokerError, Delivery, OutboundRecord};
pub use codec::{SCHEMA_VERSION, SUPPORTED_SCHEMA_VERSIONS};
pub use envelope::{EnvelopeMetadata, EventEnvelope};
pub use error::{ConfigurationError, DecodeError, EncodeError, RoutingError, RoutingIssue};
pub use event::{DomainEvent, EventKind, EventPayload, UnknownEventKind};
pub use handler::{EventHandler, HandlerOutcome};
pub use in_memory_broker::InMemoryBroker;
pub use routing::{
    Binding, Channel, INTERNAL_CHANNEL, PartitionKeyRule, Route, RouteError, RoutingTable,
    RoutingTableBuilder, partition_for,
};
