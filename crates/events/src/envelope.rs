use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use switchyard_core::{AggregateId, CorrelationId, EventId, ServiceId, TenantId};

use crate::codec::SCHEMA_VERSION;
use crate::error::{DecodeError, EncodeError};
use crate::{DomainEvent, EventKind, EventPayload};

/// Producer-side metadata stamped onto an envelope at publish time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeMetadata {
    pub event_id: EventId,
    pub produced_by: ServiceId,
    pub correlation_id: Option<CorrelationId>,
}

impl EnvelopeMetadata {
    pub fn new(event_id: EventId, produced_by: ServiceId) -> Self {
        Self {
            event_id,
            produced_by,
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Option<CorrelationId>) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

/// Transport wrapper for one domain event.
///
/// Exists only in transit (publisher → broker → dispatcher). The payload is
/// kept as JSON so a consumer can inspect, dead-letter or replay an envelope
/// without re-encoding it; [`EventEnvelope::event`] recovers the typed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    event_id: EventId,
    event_type: EventKind,
    schema_version: u32,
    produced_by: ServiceId,
    tenant_id: TenantId,
    #[serde(default)]
    aggregate_id: Option<AggregateId>,
    occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<CorrelationId>,
    payload: JsonValue,
}

impl EventEnvelope {
    /// Wrap a domain event for transport at the current schema version.
    pub fn seal(event: &DomainEvent, metadata: EnvelopeMetadata) -> Result<Self, EncodeError> {
        let kind = event.kind();
        let payload = event
            .payload()
            .to_json()
            .map_err(|e| EncodeError::Payload {
                kind,
                reason: e.to_string(),
            })?;

        Ok(Self {
            event_id: metadata.event_id,
            event_type: kind,
            schema_version: SCHEMA_VERSION,
            produced_by: metadata.produced_by,
            tenant_id: event.tenant_id().clone(),
            aggregate_id: event.aggregate_id().cloned(),
            occurred_at: event.occurred_at(),
            correlation_id: metadata.correlation_id,
            payload,
        })
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> EventKind {
        self.event_type
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn produced_by(&self) -> &ServiceId {
        &self.produced_by
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn aggregate_id(&self) -> Option<&AggregateId> {
        self.aggregate_id.as_ref()
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    /// Typed view of the payload.
    pub fn event(&self) -> Result<DomainEvent, DecodeError> {
        let payload =
            EventPayload::from_json(self.event_type, self.payload.clone()).map_err(|e| {
                DecodeError::InvalidPayload {
                    kind: self.event_type,
                    reason: e.to_string(),
                }
            })?;

        Ok(DomainEvent::from_parts(
            self.tenant_id.clone(),
            self.aggregate_id.clone(),
            self.occurred_at,
            payload,
        ))
    }

    /// SHA-256 over the event type and canonical payload JSON, hex encoded.
    ///
    /// Two envelopes with the same `eventId` must share a fingerprint;
    /// consumers treat a mismatch as a payload conflict.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.event_type.as_str().as_bytes());
        hasher.update(b"\n");
        // serde_json maps are key-ordered, so this rendering is canonical.
        hasher.update(self.payload.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}
