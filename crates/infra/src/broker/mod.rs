//! Broker adapters backed by external infrastructure.
//!
//! The broker contract and the in-memory implementation live in
//! `switchyard-events`; this module holds the networked ones.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsBroker;
