//! Dead-letter records and the sink the dispatcher parks them in.
//!
//! A dead letter keeps the exact bytes that were delivered, so an operator
//! can inspect the failure and replay the message unchanged once the cause
//! is fixed. Records go to `<topic>.dlq` on the partition the message came
//! from, keeping per-aggregate order inside the dead-letter topic too.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};

use switchyard_events::{
    Broker, BrokerAck, BrokerError, Delivery, EventEnvelope, EventKind, OutboundRecord,
};

/// Dead-letter topic for a source topic.
pub fn dlq_topic(topic: &str) -> String {
    format!("{topic}.dlq")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum DeadLetterReason {
    /// Bytes did not decode into a supported envelope.
    Decode { error: String },
    /// No handler registered for the event type.
    MissingHandler { event_type: EventKind },
    /// Handler kept asking for a retry until the policy ran out.
    HandlerExhausted { last_error: String },
    /// Handler declared the event unprocessable.
    HandlerRejected { reason: String },
    /// The same `eventId` was already processed with a different payload.
    PayloadConflict {
        processed_fingerprint: String,
        delivered_fingerprint: String,
    },
}

impl core::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DeadLetterReason::Decode { error } => write!(f, "undecodable: {error}"),
            DeadLetterReason::MissingHandler { event_type } => {
                write!(f, "no handler for {event_type}")
            }
            DeadLetterReason::HandlerExhausted { last_error } => {
                write!(f, "retries exhausted: {last_error}")
            }
            DeadLetterReason::HandlerRejected { reason } => write!(f, "rejected: {reason}"),
            DeadLetterReason::PayloadConflict { .. } => {
                write!(f, "eventId reused with a different payload")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub topic: String,
    pub partition: u32,
    pub position: String,
    pub key: String,
    pub consumer_group: String,
    /// Handler invocations made before giving up (0 when never invoked).
    pub attempts: u32,
    pub reason: DeadLetterReason,
    pub dead_lettered_at: DateTime<Utc>,
    /// Delivered bytes, base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub original: Vec<u8>,
    /// Decoded envelope, when decoding got that far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<EventEnvelope>,
}

impl DeadLetter {
    pub fn from_delivery(
        delivery: &Delivery,
        consumer_group: &str,
        envelope: Option<EventEnvelope>,
        attempts: u32,
        reason: DeadLetterReason,
    ) -> Self {
        Self {
            topic: delivery.topic.clone(),
            partition: delivery.partition,
            position: delivery.position.clone(),
            key: delivery.key.clone(),
            consumer_group: consumer_group.to_string(),
            attempts,
            reason,
            dead_lettered_at: Utc::now(),
            original: delivery.payload.clone(),
            envelope,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DeadLetterError> {
        serde_json::to_vec(self).map_err(|e| DeadLetterError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DeadLetterError> {
        serde_json::from_slice(bytes).map_err(|e| DeadLetterError::Decode(e.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("failed to encode dead letter: {0}")]
    Encode(String),

    #[error("failed to decode dead letter: {0}")]
    Decode(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Where the dispatcher parks deliveries it gives up on.
///
/// `write` must be durable when it returns `Ok`: the dispatcher commits the
/// original delivery right after.
pub trait DeadLetterSink: Send + Sync {
    fn write(&self, letter: &DeadLetter) -> Result<(), DeadLetterError>;
}

impl<S> DeadLetterSink for std::sync::Arc<S>
where
    S: DeadLetterSink + ?Sized,
{
    fn write(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        (**self).write(letter)
    }
}

/// Writes dead letters back into the broker as `<topic>.dlq`.
#[derive(Debug, Clone)]
pub struct BrokerDeadLetterSink<B> {
    broker: B,
}

impl<B: Broker> BrokerDeadLetterSink<B> {
    pub fn new(broker: B) -> Self {
        Self { broker }
    }
}

impl<B: Broker> DeadLetterSink for BrokerDeadLetterSink<B> {
    #[instrument(
        skip(self, letter),
        fields(topic = %letter.topic, partition = letter.partition, position = %letter.position),
        err
    )]
    fn write(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let record = OutboundRecord {
            topic: dlq_topic(&letter.topic),
            partition: letter.partition,
            key: letter.key.clone(),
            payload: letter.to_bytes()?,
        };
        self.broker.send(&record)?;
        Ok(())
    }
}

/// Send a dead letter's original bytes back to where they were first
/// delivered. Consumers see it as a fresh record with the same `eventId`.
#[instrument(skip(broker, letter), fields(topic = %letter.topic, partition = letter.partition), err)]
pub fn replay_dead_letter<B: Broker + ?Sized>(
    broker: &B,
    letter: &DeadLetter,
) -> Result<BrokerAck, DeadLetterError> {
    let record = OutboundRecord {
        topic: letter.topic.clone(),
        partition: letter.partition,
        key: letter.key.clone(),
        payload: letter.original.clone(),
    };
    let ack = broker.send(&record)?;
    info!(position = %ack.position, reason = %letter.reason, "dead letter replayed");
    Ok(ack)
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
