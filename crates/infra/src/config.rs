//! Environment-driven configuration.
//!
//! | variable                              | default          |
//! |---------------------------------------|------------------|
//! | `SWITCHYARD_SERVICE`                  | required         |
//! | `SWITCHYARD_CONSUMER_GROUP`           | service name     |
//! | `SWITCHYARD_BROKER_URL`               | unset: in-memory |
//! | `SWITCHYARD_DEFAULT_PARTITIONS`       | 8                |
//! | `SWITCHYARD_PARTITIONS`               | `ch=n,ch=n`      |
//! | `SWITCHYARD_PUBLISH_MAX_ATTEMPTS`     | 5                |
//! | `SWITCHYARD_PUBLISH_BASE_DELAY_MS`    | 100              |
//! | `SWITCHYARD_PUBLISH_MAX_DELAY_MS`     | 2000             |
//! | `SWITCHYARD_PUBLISH_DEADLINE_MS`      | 10000            |
//! | `SWITCHYARD_HANDLER_MAX_RETRIES`      | 3                |
//! | `SWITCHYARD_HANDLER_BASE_DELAY_MS`    | 50               |
//! | `SWITCHYARD_HANDLER_MAX_DELAY_MS`     | 1000             |
//! | `SWITCHYARD_IDEMPOTENCY_URL`          | unset: in-memory |
//! | `SWITCHYARD_RETENTION_HOURS`          | 168              |
//! | `SWITCHYARD_RESERVATION_LEASE_SECS`   | 30               |
//! | `SWITCHYARD_PUBLISH_BUFFER`           | 1024             |
//!
//! Backend URLs pick the adapter by scheme: `redis://` (feature `redis`)
//! for the broker, `postgres://` or `redis://` for the idempotency store.
//! The Postgres store must be built inside a tokio runtime context, and that
//! runtime must keep running on some thread while the store is in use.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use switchyard_core::{ConsumerGroup, IdError, ServiceId};
use switchyard_events::{Broker, ConfigurationError, InMemoryBroker, RoutingTable};

use crate::dispatcher::DispatcherConfig;
use crate::idempotency::{IdempotencyStore, InMemoryIdempotencyStore, PostgresIdempotencyStore};
use crate::publisher::{BufferedPublisher, FailureCallback, Publisher, PublisherConfig};
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var}: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("{var}: {source}")]
    Id {
        var: &'static str,
        #[source]
        source: IdError,
    },

    #[error(transparent)]
    Routing(#[from] ConfigurationError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchyardConfig {
    pub service: ServiceId,
    pub consumer_group: ConsumerGroup,
    pub broker_url: Option<String>,
    pub default_partitions: u32,
    pub partition_overrides: BTreeMap<String, u32>,
    pub publish_retry: RetryPolicy,
    pub publish_deadline: Duration,
    pub handler_retry: RetryPolicy,
    pub idempotency_url: Option<String>,
    pub retention: Duration,
    pub reservation_lease: Duration,
    pub publish_buffer: usize,
}

impl SwitchyardConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &'static str| lookup(name).filter(|v| !v.trim().is_empty());

        let service_raw = get("SWITCHYARD_SERVICE").ok_or(ConfigError::Missing("SWITCHYARD_SERVICE"))?;
        let service = ServiceId::new(service_raw.clone()).map_err(|source| ConfigError::Id {
            var: "SWITCHYARD_SERVICE",
            source,
        })?;
        let consumer_group = ConsumerGroup::new(
            get("SWITCHYARD_CONSUMER_GROUP").unwrap_or(service_raw),
        )
        .map_err(|source| ConfigError::Id {
            var: "SWITCHYARD_CONSUMER_GROUP",
            source,
        })?;

        let publish_attempts: u32 = parse_or(&get, "SWITCHYARD_PUBLISH_MAX_ATTEMPTS", 5)?;
        if publish_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "SWITCHYARD_PUBLISH_MAX_ATTEMPTS",
                reason: "must be at least 1".to_string(),
            });
        }
        let publish_retry = RetryPolicy::exponential(
            publish_attempts - 1,
            millis_or(&get, "SWITCHYARD_PUBLISH_BASE_DELAY_MS", 100)?,
            millis_or(&get, "SWITCHYARD_PUBLISH_MAX_DELAY_MS", 2_000)?,
        );
        let handler_retry = RetryPolicy::exponential(
            parse_or(&get, "SWITCHYARD_HANDLER_MAX_RETRIES", 3)?,
            millis_or(&get, "SWITCHYARD_HANDLER_BASE_DELAY_MS", 50)?,
            millis_or(&get, "SWITCHYARD_HANDLER_MAX_DELAY_MS", 1_000)?,
        );

        let default_partitions: u32 = parse_or(&get, "SWITCHYARD_DEFAULT_PARTITIONS", 8)?;
        let partition_overrides = match get("SWITCHYARD_PARTITIONS") {
            Some(raw) => parse_partition_overrides(&raw)?,
            None => BTreeMap::new(),
        };

        let retention_hours: u64 = parse_or(&get, "SWITCHYARD_RETENTION_HOURS", 7 * 24)?;
        let lease_secs: u64 = parse_or(&get, "SWITCHYARD_RESERVATION_LEASE_SECS", 30)?;

        Ok(Self {
            service,
            consumer_group,
            broker_url: get("SWITCHYARD_BROKER_URL"),
            default_partitions,
            partition_overrides,
            publish_retry,
            publish_deadline: millis_or(&get, "SWITCHYARD_PUBLISH_DEADLINE_MS", 10_000)?,
            handler_retry,
            idempotency_url: get("SWITCHYARD_IDEMPOTENCY_URL"),
            retention: Duration::from_secs(retention_hours.saturating_mul(3600)),
            reservation_lease: Duration::from_secs(lease_secs),
            publish_buffer: parse_or(&get, "SWITCHYARD_PUBLISH_BUFFER", 1024)?,
        })
    }

    /// The standard routing table with partition overrides applied, validated.
    pub fn routing_table(&self) -> Result<RoutingTable, ConfigError> {
        let mut builder = RoutingTable::standard_builder(self.default_partitions);
        for (channel, partitions) in &self.partition_overrides {
            builder = builder.partitions(channel, *partitions);
        }
        let table = builder.build()?;

        if let Some(unknown) = self
            .partition_overrides
            .keys()
            .find(|name| table.channel(name).is_none())
        {
            return Err(ConfigurationError::UnknownChannel(unknown.clone()).into());
        }
        Ok(table)
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig::new(self.service.clone())
            .with_retry(self.publish_retry.clone())
            .with_deadline(self.publish_deadline)
    }

    pub fn dispatcher_config(
        &self,
        channels: impl IntoIterator<Item = impl Into<String>>,
    ) -> DispatcherConfig {
        DispatcherConfig::new(self.consumer_group.clone(), channels)
            .with_retry(self.handler_retry.clone())
    }

    /// Broker named by `SWITCHYARD_BROKER_URL`; in-memory when unset.
    pub fn broker(&self) -> Result<Arc<dyn Broker>, ConfigError> {
        const VAR: &str = "SWITCHYARD_BROKER_URL";
        let Some(url) = self.broker_url.as_deref() else {
            info!("using in-memory broker");
            return Ok(Arc::new(InMemoryBroker::new()));
        };

        match scheme(url) {
            #[cfg(feature = "redis")]
            "redis" | "rediss" => {
                let consumer = format!("{}-{}", self.service, std::process::id());
                let broker = crate::broker::RedisStreamsBroker::new(url, consumer)
                    .map_err(|e| invalid(VAR, e))?;
                info!("using redis streams broker");
                Ok(Arc::new(broker))
            }
            other => Err(unsupported(VAR, other)),
        }
    }

    /// Idempotency store named by `SWITCHYARD_IDEMPOTENCY_URL`, using the
    /// configured retention and reservation lease; in-memory when unset.
    pub fn idempotency_store(&self) -> Result<Arc<dyn IdempotencyStore>, ConfigError> {
        const VAR: &str = "SWITCHYARD_IDEMPOTENCY_URL";
        let Some(url) = self.idempotency_url.as_deref() else {
            info!("using in-memory idempotency store");
            return Ok(Arc::new(InMemoryIdempotencyStore::with_windows(
                self.retention,
                self.reservation_lease,
            )));
        };

        match scheme(url) {
            "postgres" | "postgresql" => {
                // The pool spawns its maintenance task on the current runtime.
                let runtime = tokio::runtime::Handle::try_current()
                    .map_err(|_| invalid(VAR, "postgres store requires a tokio runtime context"))?;
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .connect_lazy(url)
                    .map_err(|e| invalid(VAR, e))?;
                let store = PostgresIdempotencyStore::new(pool, runtime)
                    .with_windows(self.retention, self.reservation_lease);
                info!("using postgres idempotency store");
                Ok(Arc::new(store))
            }
            #[cfg(feature = "redis")]
            "redis" | "rediss" => {
                let store = crate::idempotency::RedisIdempotencyStore::new(url)
                    .map_err(|e| invalid(VAR, e))?
                    .with_windows(self.retention, self.reservation_lease);
                info!("using redis idempotency store");
                Ok(Arc::new(store))
            }
            other => Err(unsupported(VAR, other)),
        }
    }

    /// Background publisher holding up to `SWITCHYARD_PUBLISH_BUFFER` events.
    pub fn buffered_publisher<B>(
        &self,
        routing: Arc<RoutingTable>,
        broker: B,
        on_failure: FailureCallback,
    ) -> std::io::Result<BufferedPublisher>
    where
        B: Broker + 'static,
    {
        let publisher = Publisher::new(routing, broker, self.publisher_config());
        BufferedPublisher::spawn(publisher, self.publish_buffer, on_failure)
    }
}

fn scheme(url: &str) -> &str {
    url.split_once("://").map_or("", |(scheme, _)| scheme)
}

fn invalid(var: &'static str, error: impl core::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        var,
        reason: error.to_string(),
    }
}

fn unsupported(var: &'static str, scheme: &str) -> ConfigError {
    invalid(var, format!("unsupported scheme {scheme:?}"))
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
    G: Fn(&'static str) -> Option<String>,
{
    match get(var) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn millis_or<G>(get: &G, var: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&'static str) -> Option<String>,
{
    parse_or(get, var, default).map(Duration::from_millis)
}

/// `crm.customer.events=16,commerce.order.events=32`
fn parse_partition_overrides(raw: &str) -> Result<BTreeMap<String, u32>, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        var: "SWITCHYARD_PARTITIONS",
        reason,
    };

    let mut overrides = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (channel, count) = pair
            .split_once('=')
            .ok_or_else(|| invalid(format!("expected channel=count, got {pair:?}")))?;
        let count: u32 = count
            .trim()
            .parse()
            .map_err(|e| invalid(format!("{pair:?}: {e}")))?;
        overrides.insert(channel.trim().to_string(), count);
    }
    Ok(overrides)
}
