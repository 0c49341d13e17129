//! Routing table: event variant → channel → topic/partition.
//!
//! The table is built once at process start from an explicit list of
//! channel declarations and `(variant, channel)` bindings, checked against
//! [`EventKind::ALL`], and never mutated afterwards. It is plain data, so it
//! can be shared as `Arc<RoutingTable>` by every publisher and dispatcher
//! without locking.

use std::collections::{BTreeMap, HashMap};

use sha2::{Digest, Sha256};

use crate::error::{ConfigurationError, RoutingError, RoutingIssue};
use crate::{EventEnvelope, EventKind};

/// Broadcast channel for cross-cutting internal events.
pub const INTERNAL_CHANNEL: &str = "platform.internal.events";

/// How a channel derives the partition key from an envelope.
///
/// The tenant fallback is a separate rule on purpose: a channel keyed by
/// aggregate never silently degrades to tenant ordering.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PartitionKeyRule {
    /// `aggregateId`; an envelope without one cannot be routed.
    AggregateId,
    /// `aggregateId`, or `tenantId` when the event has no aggregate.
    AggregateIdOrTenant,
    /// Always `tenantId`.
    TenantId,
}

/// Logical destination, bound one-to-one to a physical broker topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    name: String,
    topic: String,
    partitions: u32,
    key_rule: PartitionKeyRule,
}

impl Channel {
    /// A channel whose topic has the same name as the channel.
    pub fn new(name: impl Into<String>, partitions: u32, key_rule: PartitionKeyRule) -> Self {
        let name = name.into();
        Self {
            topic: name.clone(),
            name,
            partitions,
            key_rule,
        }
    }

    /// Bind the channel to a differently named physical topic.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    pub fn key_rule(&self) -> PartitionKeyRule {
        self.key_rule
    }

    /// Extract the partition key according to this channel's rule.
    pub fn partition_key(&self, envelope: &EventEnvelope) -> Result<String, RoutingError> {
        let aggregate = envelope.aggregate_id().map(|a| a.as_str().to_string());
        let tenant = || envelope.tenant_id().as_str().to_string();

        match (self.key_rule, aggregate) {
            (PartitionKeyRule::TenantId, _) => Ok(tenant()),
            (_, Some(aggregate)) => Ok(aggregate),
            (PartitionKeyRule::AggregateIdOrTenant, None) => Ok(tenant()),
            (PartitionKeyRule::AggregateId, None) => Err(RoutingError::MissingAggregateId {
                channel: self.name.clone(),
                kind: envelope.event_type(),
            }),
        }
    }

    /// Partition index for a key. Pure and stable across processes.
    pub fn partition_for(&self, key: &str) -> u32 {
        partition_for(key, self.partitions)
    }
}

/// First 8 bytes of SHA-256(key), big-endian, modulo `partitions`.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % u64::from(partitions)) as u32
}

/// Resolved destination for one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route<'a> {
    pub channel: &'a Channel,
    pub partition_key: String,
    pub partition: u32,
}

/// One `(variant, channel)` registration, as declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub kind: EventKind,
    pub channel: String,
}

/// Immutable, exhaustively validated variant → channel mapping.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    channels: Vec<Channel>,
    // Indexed by `EventKind::index()`; every slot is filled after validation.
    by_kind: Vec<usize>,
    by_name: HashMap<String, usize>,
}

impl RoutingTable {
    pub fn builder() -> RoutingTableBuilder {
        RoutingTableBuilder::default()
    }

    /// Production table using the `<domain>.<aggregate>.events` convention.
    pub fn standard(default_partitions: u32) -> Result<Self, ConfigurationError> {
        Self::standard_builder(default_partitions).build()
    }

    /// The standard declarations, left open for per-channel overrides.
    pub fn standard_builder(default_partitions: u32) -> RoutingTableBuilder {
        use EventKind::*;
        use PartitionKeyRule as Rule;

        let p = default_partitions;
        RoutingTable::builder()
            .channel(Channel::new("crm.customer.events", p, Rule::AggregateId))
            .channel(Channel::new("commerce.order.events", p, Rule::AggregateId))
            .channel(Channel::new("finance.invoice.events", p, Rule::AggregateId))
            .channel(Channel::new("supply.inventory.events", p, Rule::AggregateId))
            .channel(Channel::new("operations.service-order.events", p, Rule::AggregateId))
            .channel(Channel::new("platform.user.events", p, Rule::AggregateId))
            .channel(Channel::new(INTERNAL_CHANNEL, p, Rule::AggregateIdOrTenant))
            .bind_all(
                "crm.customer.events",
                [CustomerCreated, CustomerUpdated, CustomerDeactivated],
            )
            .bind_all(
                "commerce.order.events",
                [OrderPlaced, OrderConfirmed, OrderCancelled],
            )
            .bind_all(
                "finance.invoice.events",
                [InvoiceIssued, InvoicePaid, InvoiceVoided],
            )
            .bind_all(
                "supply.inventory.events",
                [StockAdjusted, StockReserved, StockReleased],
            )
            .bind_all(
                "operations.service-order.events",
                [ServiceOrderOpened, ServiceOrderCompleted],
            )
            .bind_all("platform.user.events", [UserRegistered, UserRoleChanged])
            .bind_all(INTERNAL_CHANNEL, [TenantProvisioned, FeatureFlagChanged])
    }

    /// Channel for a variant. O(1).
    pub fn channel_for(&self, kind: EventKind) -> Result<&Channel, ConfigurationError> {
        self.by_kind
            .get(kind.index())
            .and_then(|i| self.channels.get(*i))
            .ok_or(ConfigurationError::Unrouted(kind))
    }

    /// Full destination for an envelope: channel, key and partition.
    pub fn route(&self, envelope: &EventEnvelope) -> Result<Route<'_>, RouteError> {
        let channel = self.channel_for(envelope.event_type())?;
        let partition_key = channel.partition_key(envelope)?;
        let partition = channel.partition_for(&partition_key);
        Ok(Route {
            channel,
            partition_key,
            partition,
        })
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.by_name.get(name).map(|i| &self.channels[*i])
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Variants bound to a channel, in declaration order of [`EventKind::ALL`].
    pub fn kinds_for(&self, channel: &str) -> Vec<EventKind> {
        let Some(target) = self.by_name.get(channel) else {
            return Vec::new();
        };
        EventKind::ALL
            .iter()
            .copied()
            .filter(|k| self.by_kind[k.index()] == *target)
            .collect()
    }

    /// The binding records, one per variant.
    pub fn bindings(&self) -> Vec<Binding> {
        EventKind::ALL
            .iter()
            .map(|k| Binding {
                kind: *k,
                channel: self.channels[self.by_kind[k.index()]].name.clone(),
            })
            .collect()
    }
}

/// Routing failed for a single envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Key(#[from] RoutingError),
}

/// Collects declarations; [`RoutingTableBuilder::build`] validates them.
#[derive(Debug, Default, Clone)]
pub struct RoutingTableBuilder {
    channels: Vec<Channel>,
    bindings: Vec<Binding>,
}

impl RoutingTableBuilder {
    pub fn channel(mut self, channel: Channel) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn bind(mut self, kind: EventKind, channel: impl Into<String>) -> Self {
        self.bindings.push(Binding {
            kind,
            channel: channel.into(),
        });
        self
    }

    pub fn bind_all(mut self, channel: &str, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        for kind in kinds {
            self = self.bind(kind, channel);
        }
        self
    }

    /// Change the partition count of a declared channel (configuration overrides).
    pub fn partitions(mut self, channel: &str, partitions: u32) -> Self {
        for c in self.channels.iter_mut().filter(|c| c.name == channel) {
            c.partitions = partitions;
        }
        self
    }

    /// Validate and freeze. Every violation is reported, not just the first.
    pub fn build(self) -> Result<RoutingTable, ConfigurationError> {
        let mut issues = Vec::new();

        let mut by_name: HashMap<String, usize> = HashMap::new();
        let mut topics: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for (i, channel) in self.channels.iter().enumerate() {
            if by_name.insert(channel.name.clone(), i).is_some() {
                issues.push(RoutingIssue::DuplicateChannel(channel.name.clone()));
            }
            if channel.partitions == 0 {
                issues.push(RoutingIssue::ZeroPartitions(channel.name.clone()));
            }
            topics
                .entry(channel.topic.as_str())
                .or_default()
                .push(channel.name.clone());
        }
        for (topic, names) in topics {
            if names.len() > 1 {
                let mut distinct = names.clone();
                distinct.dedup();
                if distinct.len() > 1 {
                    issues.push(RoutingIssue::SharedTopic {
                        topic: topic.to_string(),
                        channels: distinct,
                    });
                }
            }
        }

        let mut targets: Vec<Vec<String>> = vec![Vec::new(); EventKind::ALL.len()];
        for binding in &self.bindings {
            if !by_name.contains_key(&binding.channel) {
                issues.push(RoutingIssue::UndeclaredChannel {
                    kind: binding.kind,
                    channel: binding.channel.clone(),
                });
                continue;
            }
            targets[binding.kind.index()].push(binding.channel.clone());
        }

        let mut by_kind = Vec::with_capacity(EventKind::ALL.len());
        for kind in EventKind::ALL {
            let bound = &targets[kind.index()];
            match bound.as_slice() {
                [] => issues.push(RoutingIssue::UnmappedVariant(*kind)),
                [only] => by_kind.push(by_name[only]),
                many => issues.push(RoutingIssue::DuplicateMapping {
                    kind: *kind,
                    channels: many.to_vec(),
                }),
            }
        }

        for channel in &self.channels {
            let used = targets.iter().flatten().any(|name| name == &channel.name);
            if !used {
                issues.push(RoutingIssue::DeadChannel(channel.name.clone()));
            }
        }

        if !issues.is_empty() {
            return Err(ConfigurationError::InvalidRoutingTable { issues });
        }

        Ok(RoutingTable {
            channels: self.channels,
            by_kind,
            by_name,
        })
    }
}
