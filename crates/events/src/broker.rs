//! Broker adapter contract (partitioned, durable, log-style transport).
//!
//! The publisher and dispatcher only ever talk to a broker through this
//! trait. Implementations own connection handling and the physical layout of
//! topics; they must provide:
//!
//! - **Durable acknowledgement**: `send` returns only after the record is
//!   stored. The ack is the sole success signal for a publish.
//! - **Per-partition order**: records sent to one partition are fetched in
//!   send order.
//! - **At-least-once delivery per consumer group**: `fetch` starts from the
//!   group's committed position, so anything fetched but not committed is
//!   delivered again.
//!
//! ```text
//! Publisher → Broker::send ─▶ [topic/partition log] ─▶ Broker::fetch → Dispatcher
//!                                                      Broker::commit ◀─┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// One record to append to a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub topic: String,
    pub partition: u32,
    pub key: String,
    pub payload: Vec<u8>,
}

/// Durable-write acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAck {
    pub topic: String,
    pub partition: u32,
    /// Broker-assigned position (offset or stream entry id).
    pub position: String,
}

/// One record handed to a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: u32,
    pub position: String,
    pub key: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Broker unreachable or overloaded; retrying may succeed.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Broker refused the request (bad topic, oversized record, ACL).
    #[error("broker rejected request: {0}")]
    Rejected(String),

    /// Unexpected reply shape or client-side failure.
    #[error("broker protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_))
    }
}

pub trait Broker: Send + Sync {
    /// Append a record and wait for the durable ack.
    fn send(&self, record: &OutboundRecord) -> Result<BrokerAck, BrokerError>;

    /// `send`, giving up with [`BrokerError::Unavailable`] once `timeout`
    /// has passed. Adapters that talk to the network must honour the
    /// timeout; the default suits brokers whose `send` cannot block.
    fn send_within(
        &self,
        record: &OutboundRecord,
        timeout: Duration,
    ) -> Result<BrokerAck, BrokerError> {
        let _ = timeout;
        self.send(record)
    }

    /// Up to `max` records from the group's committed position onwards.
    ///
    /// May block briefly waiting for new records; returns an empty batch when
    /// nothing is available.
    fn fetch(
        &self,
        topic: &str,
        partition: u32,
        group: &str,
        max: usize,
    ) -> Result<Vec<Delivery>, BrokerError>;

    /// Mark `delivery` (and everything before it in its partition) consumed
    /// for `group`.
    fn commit(&self, group: &str, delivery: &Delivery) -> Result<(), BrokerError>;
}

impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    fn send(&self, record: &OutboundRecord) -> Result<BrokerAck, BrokerError> {
        (**self).send(record)
    }

    fn send_within(
        &self,
        record: &OutboundRecord,
        timeout: Duration,
    ) -> Result<BrokerAck, BrokerError> {
        (**self).send_within(record, timeout)
    }

    fn fetch(
        &self,
        topic: &str,
        partition: u32,
        group: &str,
        max: usize,
    ) -> Result<Vec<Delivery>, BrokerError> {
        (**self).fetch(topic, partition, group, max)
    }

    fn commit(&self, group: &str, delivery: &Delivery) -> Result<(), BrokerError> {
        (**self).commit(group, delivery)
    }
}
