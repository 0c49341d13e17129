//! The closed domain event model.
//!
//! Every variant is listed exactly once in the `domain_events!` invocation
//! below. That single list generates the fieldless [`EventKind`] tag (with
//! [`EventKind::ALL`], the enumerated universe the routing table is checked
//! against) and the [`EventPayload`] union, so the two can never drift apart.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use switchyard_core::{AggregateId, TenantId};

use crate::payload;

macro_rules! domain_events {
    ($($variant:ident),+ $(,)?) => {
        /// Variant tag of a domain event (the wire `eventType`).
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum EventKind {
            $($variant),+
        }

        impl EventKind {
            /// Every variant, in declaration order.
            pub const ALL: &'static [EventKind] = &[$(EventKind::$variant),+];

            /// Stable wire tag.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(EventKind::$variant => stringify!($variant)),+
                }
            }
        }

        /// Typed payload of a domain event; one arm per [`EventKind`].
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum EventPayload {
            $($variant(payload::$variant)),+
        }

        impl EventPayload {
            pub fn kind(&self) -> EventKind {
                match self {
                    $(EventPayload::$variant(_) => EventKind::$variant),+
                }
            }

            /// Serialize the payload body (without the tag).
            pub fn to_json(&self) -> Result<JsonValue, serde_json::Error> {
                match self {
                    $(EventPayload::$variant(p) => serde_json::to_value(p)),+
                }
            }

            /// Deserialize a payload body for a known tag.
            pub fn from_json(kind: EventKind, body: JsonValue) -> Result<Self, serde_json::Error> {
                match kind {
                    $(EventKind::$variant => serde_json::from_value(body).map(EventPayload::$variant)),+
                }
            }
        }

        $(
            impl From<payload::$variant> for EventPayload {
                fn from(value: payload::$variant) -> Self {
                    EventPayload::$variant(value)
                }
            }
        )+
    };
}

domain_events! {
    // crm.customer
    CustomerCreated,
    CustomerUpdated,
    CustomerDeactivated,
    // commerce.order
    OrderPlaced,
    OrderConfirmed,
    OrderCancelled,
    // finance.invoice
    InvoiceIssued,
    InvoicePaid,
    InvoiceVoided,
    // supply.inventory
    StockAdjusted,
    StockReserved,
    StockReleased,
    // operations.service-order
    ServiceOrderOpened,
    ServiceOrderCompleted,
    // platform.user
    UserRegistered,
    UserRoleChanged,
    // platform.internal (tenant-scoped, no aggregate)
    TenantProvisioned,
    FeatureFlagChanged,
}

impl EventKind {
    /// Dense index in `0..ALL.len()`, used for O(1) table lookups.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type '{0}'")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

/// A fact raised by business logic at the moment of a state transition.
///
/// Immutable once constructed; handed straight to the publisher and never
/// persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEvent {
    tenant_id: TenantId,
    aggregate_id: Option<AggregateId>,
    occurred_at: DateTime<Utc>,
    payload: EventPayload,
}

impl DomainEvent {
    /// Event about a specific aggregate, stamped with the current time.
    pub fn new(
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        payload: impl Into<EventPayload>,
    ) -> Self {
        Self {
            tenant_id,
            aggregate_id: Some(aggregate_id),
            occurred_at: Utc::now(),
            payload: payload.into(),
        }
    }

    /// Tenant-wide event with no owning aggregate (e.g. platform internals).
    pub fn for_tenant(tenant_id: TenantId, payload: impl Into<EventPayload>) -> Self {
        Self {
            tenant_id,
            aggregate_id: None,
            occurred_at: Utc::now(),
            payload: payload.into(),
        }
    }

    /// Override business time (replays, imports, deterministic tests).
    pub fn occurred_at_time(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub(crate) fn from_parts(
        tenant_id: TenantId,
        aggregate_id: Option<AggregateId>,
        occurred_at: DateTime<Utc>,
        payload: EventPayload,
    ) -> Self {
        Self {
            tenant_id,
            aggregate_id,
            occurred_at,
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
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

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn kind_indices_are_dense_and_unique() {
        let mut seen = HashSet::new();
        for (i, kind) in EventKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
            assert!(seen.insert(kind.as_str()));
        }
    }

    #[test]
    fn tags_parse_back_to_their_kind() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), *kind);
        }
        assert!("CustomerExploded".parse::<EventKind>().is_err());
    }

    #[test]
    fn payload_body_is_checked_against_its_tag() {
        let body = serde_json::json!({ "name": "Acme" });
        let p = EventPayload::from_json(EventKind::CustomerCreated, body.clone()).unwrap();
        assert_eq!(p.kind(), EventKind::CustomerCreated);

        // CustomerDeactivated requires `reason`.
        assert!(EventPayload::from_json(EventKind::CustomerDeactivated, body).is_err());
    }

    #[test]
    fn tenant_events_have_no_aggregate() {
        let ev = DomainEvent::for_tenant(
            TenantId::new("t1").unwrap(),
            payload::TenantProvisioned {
                plan: "standard".into(),
            },
        );
        assert_eq!(ev.kind(), EventKind::TenantProvisioned);
        assert!(ev.aggregate_id().is_none());
    }
}
