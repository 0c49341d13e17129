//! Redis Streams broker (durable, at-least-once delivery).
//!
//! - **Stream per partition**: `<topic>:<partition>`, so order holds per
//!   partition exactly as the routing table assigns it
//! - **Consumer groups**: one Redis consumer group per dispatcher group,
//!   created on first fetch
//! - **Partition ownership**: a Redis consumer group would hand one stream's
//!   entries to every consumer reading it. A partition is therefore read by
//!   one consumer at a time, the holder of the lease key
//!   `switchyard:lease:<group>:<stream>`. Each fetch renews the lease; a
//!   consumer without it gets an empty batch
//! - **Takeover**: a consumer that acquires a lease first claims (`XAUTOCLAIM`)
//!   the pending entries its predecessor left idle for at least
//!   `claim_min_idle`, so nothing stays stuck with a dead consumer
//! - **Redelivery**: `fetch` first re-reads this consumer's pending entries
//!   (delivered, never acknowledged), then asks for new ones
//! - **Commit**: `XACK` of the delivered entry id
//!
//! The lease must outlive the slowest handler run plus the poll interval,
//! or a second consumer can take the partition while the first is still
//! working on it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redis::streams::StreamReadReply;
use tracing::{debug, info, instrument};

use switchyard_events::{Broker, BrokerAck, BrokerError, Delivery, OutboundRecord};

const KEY_FIELD: &str = "key";
const PAYLOAD_FIELD: &str = "payload";
const LEASE_PREFIX: &str = "switchyard:lease";

/// Default time `fetch` blocks waiting for new entries.
const DEFAULT_BLOCK_MS: u64 = 100;

/// Default partition lease.
pub const DEFAULT_PARTITION_LEASE: Duration = Duration::from_secs(30);

/// Default bound on connect and on each reply.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Entries claimed per `XAUTOCLAIM` call, and calls per takeover.
const CLAIM_BATCH: usize = 100;
const CLAIM_ROUNDS: usize = 16;

/// 1 = acquired, 2 = renewed, 0 = held by another consumer.
const LEASE_SCRIPT: &str = r#"
local holder = redis.call('GET', KEYS[1])
if not holder then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return 1
end
if holder == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return 2
end
return 0
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lease {
    Acquired,
    Renewed,
    HeldElsewhere,
}

impl Lease {
    fn from_reply(reply: i64) -> Result<Self, BrokerError> {
        match reply {
            1 => Ok(Lease::Acquired),
            2 => Ok(Lease::Renewed),
            0 => Ok(Lease::HeldElsewhere),
            other => Err(BrokerError::Protocol(format!("unexpected lease reply {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisStreamsBroker {
    client: Arc<redis::Client>,
    consumer_name: String,
    block_ms: u64,
    partition_lease: Duration,
    claim_min_idle: Duration,
    response_timeout: Duration,
    known_groups: Arc<Mutex<HashSet<(String, String)>>>,
}

impl RedisStreamsBroker {
    /// `consumer_name` must be unique per process within a consumer group
    /// (e.g. `<host>-<pid>`); pending entries are tracked per consumer.
    pub fn new(
        redis_url: impl AsRef<str>,
        consumer_name: impl Into<String>,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Rejected(format!("invalid redis url: {e}")))?;

        Ok(Self {
            client: Arc::new(client),
            consumer_name: consumer_name.into(),
            block_ms: DEFAULT_BLOCK_MS,
            partition_lease: DEFAULT_PARTITION_LEASE,
            claim_min_idle: DEFAULT_PARTITION_LEASE,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            known_groups: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn with_block_ms(mut self, block_ms: u64) -> Self {
        self.block_ms = block_ms;
        self
    }

    /// Lease on each partition; also the idle time after which a previous
    /// holder's pending entries are claimed.
    pub fn with_partition_lease(mut self, lease: Duration) -> Self {
        self.partition_lease = lease;
        self.claim_min_idle = lease;
        self
    }

    pub fn with_claim_min_idle(mut self, min_idle: Duration) -> Self {
        self.claim_min_idle = min_idle;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    fn connection(&self) -> Result<redis::Connection, BrokerError> {
        self.connection_within(self.response_timeout)
    }

    /// Connection whose connect, read and write each give up after `timeout`.
    fn connection_within(&self, timeout: Duration) -> Result<redis::Connection, BrokerError> {
        // Zero is "no timeout" to the socket layer.
        let timeout = timeout.max(Duration::from_millis(1));
        let conn = self
            .client
            .get_connection_with_timeout(timeout)
            .map_err(map_redis_error)?;
        conn.set_read_timeout(Some(timeout)).map_err(map_redis_error)?;
        conn.set_write_timeout(Some(timeout)).map_err(map_redis_error)?;
        Ok(conn)
    }

    fn lease(
        &self,
        conn: &mut redis::Connection,
        stream: &str,
        group: &str,
    ) -> Result<Lease, BrokerError> {
        let reply: i64 = redis::Script::new(LEASE_SCRIPT)
            .key(lease_key(group, stream))
            .arg(&self.consumer_name)
            .arg(millis(self.partition_lease))
            .invoke(conn)
            .map_err(map_redis_error)?;
        Lease::from_reply(reply)
    }

    /// Move a previous holder's idle pending entries to this consumer.
    fn claim_stale(
        &self,
        conn: &mut redis::Connection,
        stream: &str,
        group: &str,
    ) -> Result<usize, BrokerError> {
        let mut cursor = "0-0".to_string();
        let mut claimed = 0;
        for _ in 0..CLAIM_ROUNDS {
            let reply: redis::Value = redis::cmd("XAUTOCLAIM")
                .arg(stream)
                .arg(group)
                .arg(&self.consumer_name)
                .arg(millis(self.claim_min_idle))
                .arg(&cursor)
                .arg("COUNT")
                .arg(CLAIM_BATCH)
                .arg("JUSTID")
                .query(conn)
                .map_err(map_redis_error)?;
            let (next, ids) = parse_autoclaim(reply)?;
            claimed += ids;
            if next == "0-0" {
                break;
            }
            cursor = next;
        }
        Ok(claimed)
    }

    /// Create the consumer group (and stream) if it does not exist yet.
    fn ensure_group(
        &self,
        conn: &mut redis::Connection,
        stream: &str,
        group: &str,
    ) -> Result<(), BrokerError> {
        let cache_key = (stream.to_string(), group.to_string());
        if self
            .known_groups
            .lock()
            .map(|g| g.contains(&cache_key))
            .unwrap_or(false)
        {
            return Ok(());
        }

        // "0": a new group starts from the beginning of the stream.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query(conn);
        match created {
            Ok(_) => debug!(stream, group, "consumer group created"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(map_redis_error(e)),
        }

        if let Ok(mut groups) = self.known_groups.lock() {
            groups.insert(cache_key);
        }
        Ok(())
    }

    fn read_group(
        &self,
        conn: &mut redis::Connection,
        stream: &str,
        group: &str,
        count: usize,
        from: &str,
        block_ms: Option<u64>,
    ) -> Result<Vec<(String, String, Vec<u8>)>, BrokerError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(count);
        if let Some(ms) = block_ms {
            cmd.arg("BLOCK").arg(ms);
        }
        cmd.arg("STREAMS").arg(stream).arg(from);

        let reply: Option<StreamReadReply> = cmd.query(conn).map_err(map_redis_error)?;
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for stream_key in reply.keys {
            for entry in stream_key.ids {
                let key: String = entry.get(KEY_FIELD).unwrap_or_default();
                let payload: Vec<u8> = entry.get(PAYLOAD_FIELD).ok_or_else(|| {
                    BrokerError::Protocol(format!("entry {} has no payload field", entry.id))
                })?;
                entries.push((entry.id, key, payload));
            }
        }
        Ok(entries)
    }
}

pub fn stream_key(topic: &str, partition: u32) -> String {
    format!("{topic}:{partition}")
}

fn lease_key(group: &str, stream: &str) -> String {
    format!("{LEASE_PREFIX}:{group}:{stream}")
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// `XAUTOCLAIM .. JUSTID` reply: `[next-cursor, [id, ..], (deleted ids)]`.
/// Returns the next cursor and how many ids were claimed.
fn parse_autoclaim(reply: redis::Value) -> Result<(String, usize), BrokerError> {
    let malformed = || BrokerError::Protocol("malformed XAUTOCLAIM reply".to_string());

    let redis::Value::Bulk(items) = reply else {
        return Err(malformed());
    };
    let mut items = items.into_iter();
    let next = match items.next() {
        Some(redis::Value::Data(bytes)) => String::from_utf8(bytes).map_err(|_| malformed())?,
        Some(redis::Value::Status(s)) => s,
        _ => return Err(malformed()),
    };
    let claimed = match items.next() {
        Some(redis::Value::Bulk(ids)) => ids.len(),
        Some(redis::Value::Nil) | None => 0,
        Some(_) => return Err(malformed()),
    };
    Ok((next, claimed))
}

fn map_redis_error(e: redis::RedisError) -> BrokerError {
    if e.is_io_error() || e.is_timeout() || e.is_connection_refusal() || e.is_connection_dropped()
    {
        BrokerError::Unavailable(e.to_string())
    } else {
        BrokerError::Protocol(e.to_string())
    }
}

impl Broker for RedisStreamsBroker {
    fn send(&self, record: &OutboundRecord) -> Result<BrokerAck, BrokerError> {
        self.send_within(record, self.response_timeout)
    }

    #[instrument(
        skip(self, record),
        fields(topic = %record.topic, partition = record.partition, timeout_ms = timeout.as_millis() as u64),
        err
    )]
    fn send_within(
        &self,
        record: &OutboundRecord,
        timeout: Duration,
    ) -> Result<BrokerAck, BrokerError> {
        let mut conn = self.connection_within(timeout.min(self.response_timeout))?;
        let stream = stream_key(&record.topic, record.partition);

        let id: String = redis::cmd("XADD")
            .arg(&stream)
            .arg("*")
            .arg(KEY_FIELD)
            .arg(&record.key)
            .arg(PAYLOAD_FIELD)
            .arg(&record.payload)
            .query(&mut conn)
            .map_err(map_redis_error)?;

        Ok(BrokerAck {
            topic: record.topic.clone(),
            partition: record.partition,
            position: id,
        })
    }

    #[instrument(skip(self), err)]
    fn fetch(
        &self,
        topic: &str,
        partition: u32,
        group: &str,
        max: usize,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let mut conn = self.connection_within(
            self.response_timeout + Duration::from_millis(self.block_ms),
        )?;
        let stream = stream_key(topic, partition);
        self.ensure_group(&mut conn, &stream, group)?;

        match self.lease(&mut conn, &stream, group)? {
            Lease::HeldElsewhere => {
                debug!(stream, group, "partition owned by another consumer");
                return Ok(Vec::new());
            }
            Lease::Acquired => {
                let claimed = self.claim_stale(&mut conn, &stream, group)?;
                info!(stream, group, claimed, "partition lease acquired");
            }
            Lease::Renewed => {}
        }

        // "0" = this consumer's pending entries, ">" = never delivered.
        let mut entries = self.read_group(&mut conn, &stream, group, max, "0", None)?;
        if entries.is_empty() {
            entries =
                self.read_group(&mut conn, &stream, group, max, ">", Some(self.block_ms))?;
        }

        Ok(entries
            .into_iter()
            .map(|(position, key, payload)| Delivery {
                topic: topic.to_string(),
                partition,
                position,
                key,
                payload,
            })
            .collect())
    }

    #[instrument(
        skip(self, delivery),
        fields(topic = %delivery.topic, partition = delivery.partition, position = %delivery.position),
        err
    )]
    fn commit(&self, group: &str, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;
        let _: u64 = redis::cmd("XACK")
            .arg(stream_key(&delivery.topic, delivery.partition))
            .arg(group)
            .arg(&delivery.position)
            .query(&mut conn)
            .map_err(map_redis_error)?;
        Ok(())
    }
}
