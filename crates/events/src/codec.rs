//! Envelope codec: versioned JSON on the wire.
//!
//! Decoding is tolerant of unknown fields (newer producers may add optional
//! metadata) and fails closed on anything required that is missing, mistyped
//! or unrecognized.

use serde_json::Value as JsonValue;

use crate::envelope::{EnvelopeMetadata, EventEnvelope};
use crate::error::{DecodeError, EncodeError};
use crate::{DomainEvent, EventKind, EventPayload};

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 1;

/// Schema versions this build can read.
pub const SUPPORTED_SCHEMA_VERSIONS: &[u32] = &[1];

const REQUIRED_FIELDS: &[&str] = &[
    "eventId",
    "eventType",
    "producedBy",
    "tenantId",
    "occurredAt",
    "payload",
];

/// Encode an already sealed envelope.
pub fn encode(envelope: &EventEnvelope) -> Result<Vec<u8>, EncodeError> {
    serde_json::to_vec(envelope).map_err(|e| EncodeError::Envelope(e.to_string()))
}

/// Seal a domain event with producer metadata and encode it.
pub fn encode_event(
    event: &DomainEvent,
    metadata: EnvelopeMetadata,
) -> Result<(EventEnvelope, Vec<u8>), EncodeError> {
    let envelope = EventEnvelope::seal(event, metadata)?;
    let bytes = encode(&envelope)?;
    Ok((envelope, bytes))
}

/// Decode and validate an envelope.
pub fn decode(bytes: &[u8]) -> Result<EventEnvelope, DecodeError> {
    let value: JsonValue =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let object = value
        .as_object()
        .ok_or_else(|| DecodeError::Malformed("envelope is not a JSON object".to_string()))?;

    let version = object
        .get("schemaVersion")
        .filter(|v| !v.is_null())
        .ok_or_else(|| DecodeError::MissingField("schemaVersion".to_string()))?
        .as_u64()
        .ok_or_else(|| {
            DecodeError::Malformed("schemaVersion is not an unsigned integer".to_string())
        })?;

    if !SUPPORTED_SCHEMA_VERSIONS
        .iter()
        .any(|v| u64::from(*v) == version)
    {
        return Err(DecodeError::UnsupportedSchemaVersion(version));
    }

    for field in REQUIRED_FIELDS {
        match object.get(*field) {
            None | Some(JsonValue::Null) => {
                return Err(DecodeError::MissingField((*field).to_string()));
            }
            Some(_) => {}
        }
    }

    let tag = object
        .get("eventType")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| DecodeError::Malformed("eventType is not a string".to_string()))?;
    let kind: EventKind = tag
        .parse()
        .map_err(|_| DecodeError::UnknownEventType(tag.to_string()))?;

    let envelope: EventEnvelope =
        serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    // Structural check of the body against its tag; the envelope keeps the
    // original JSON (including any unknown optional fields).
    EventPayload::from_json(kind, envelope.payload().clone()).map_err(|e| {
        DecodeError::InvalidPayload {
            kind,
            reason: e.to_string(),
        }
    })?;

    Ok(envelope)
}
