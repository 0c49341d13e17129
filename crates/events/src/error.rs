//! Error taxonomy shared by the producer and consumer sides.

use thiserror::Error;

use crate::EventKind;

/// Fatal wiring mistake. Never auto-corrected.
///
/// Raised at startup for an invalid routing table or dispatcher setup, and
/// per message when a delivered event type has no local handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("invalid routing table: {}", join(.issues))]
    InvalidRoutingTable { issues: Vec<RoutingIssue> },

    #[error("event type {0} has no channel in the routing table")]
    Unrouted(EventKind),

    #[error("channel '{0}' is not declared in the routing table")]
    UnknownChannel(String),

    #[error("no handler registered for event type {0}")]
    MissingHandler(EventKind),

    #[error("handler for {kind} can never fire: it routes to '{channel}', which is not subscribed")]
    UnreachableHandler { kind: EventKind, channel: String },

    #[error("dispatcher subscribes to no channels")]
    NoSubscriptions,
}

/// One violation found while validating a routing table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingIssue {
    #[error("variant {0} is not mapped to any channel")]
    UnmappedVariant(EventKind),

    #[error("variant {kind} is mapped to several channels: {}", .channels.join(", "))]
    DuplicateMapping { kind: EventKind, channels: Vec<String> },

    #[error("channel '{0}' has no mapped variants")]
    DeadChannel(String),

    #[error("variant {kind} is bound to undeclared channel '{channel}'")]
    UndeclaredChannel { kind: EventKind, channel: String },

    #[error("channel '{0}' is declared more than once")]
    DuplicateChannel(String),

    #[error("topic '{topic}' is bound to several channels: {}", .channels.join(", "))]
    SharedTopic { topic: String, channels: Vec<String> },

    #[error("channel '{0}' has zero partitions")]
    ZeroPartitions(String),
}

fn join(issues: &[RoutingIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// An envelope could not be read. Retrying cannot help, so these go straight
/// to dead-letter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("unsupported schema version {0}")]
    UnsupportedSchemaVersion(u64),

    #[error("unknown event type '{0}'")]
    UnknownEventType(String),

    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: EventKind, reason: String },
}

/// A domain event could not be turned into bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("failed to serialize {kind} payload: {reason}")]
    Payload { kind: EventKind, reason: String },

    #[error("failed to serialize envelope: {0}")]
    Envelope(String),
}

/// Partition key could not be derived for an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("channel '{channel}' keys by aggregateId and declares no tenant fallback, but the {kind} event has no aggregateId")]
    MissingAggregateId { channel: String, kind: EventKind },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_table_error_names_every_offender() {
        let err = ConfigurationError::InvalidRoutingTable {
            issues: vec![
                RoutingIssue::UnmappedVariant(EventKind::InvoicePaid),
                RoutingIssue::DeadChannel("finance.legacy.events".into()),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("InvoicePaid"));
        assert!(msg.contains("finance.legacy.events"));
    }
}
