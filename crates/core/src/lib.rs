//! `switchyard-core`: identifiers shared by the routing and dispatch layers.
//!
//! This crate has no IO and no knowledge of brokers or channels.

pub mod error;
pub mod id;

pub use error::IdError;
pub use id::{AggregateId, ConsumerGroup, CorrelationId, EventId, ServiceId, TenantId};
