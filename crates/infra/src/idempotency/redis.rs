//! Redis-backed idempotency store.
//!
//! Each key is a plain string entry `switchyard:idem:<group>:<event_id>`
//! whose value is `reserved|<fingerprint>|<lease-expiry-ms>` or
//! `processed|<fingerprint>|<processed-at rfc3339>`. Redis TTLs do the
//! expiry, so [`IdempotencyStore::prune_expired`] has nothing to do.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing::instrument;

use super::{
    DEFAULT_RESERVATION_LEASE, DEFAULT_RETENTION, DeliveryKey, DeliveryRecord, IdempotencyError,
    IdempotencyStore, Reservation, chrono_duration,
};

const KEY_PREFIX: &str = "switchyard:idem";

const RESERVE_ROUNDS: usize = 3;

/// Promote a reservation to processed; `nil` if no reservation exists.
const MARK_SCRIPT: &str = r#"
local v = redis.call('GET', KEYS[1])
if not v then return nil end
if string.sub(v, 1, 10) == 'processed|' then return v end
local fp = string.match(v, '^reserved|([^|]*)|')
local processed = 'processed|' .. fp .. '|' .. ARGV[1]
redis.call('SET', KEYS[1], processed, 'PX', ARGV[2])
return processed
"#;

/// Delete only if the entry is still a reservation.
const RELEASE_SCRIPT: &str = r#"
local v = redis.call('GET', KEYS[1])
if v and string.sub(v, 1, 9) == 'reserved|' then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Debug, Clone)]
pub struct RedisIdempotencyStore {
    client: Arc<::redis::Client>,
    retention: Duration,
    reservation_lease: Duration,
}

impl RedisIdempotencyStore {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, IdempotencyError> {
        let client = ::redis::Client::open(redis_url.as_ref())
            .map_err(|e| IdempotencyError::Unavailable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            retention: DEFAULT_RETENTION,
            reservation_lease: DEFAULT_RESERVATION_LEASE,
        })
    }

    pub fn with_windows(mut self, retention: Duration, reservation_lease: Duration) -> Self {
        self.retention = retention;
        self.reservation_lease = reservation_lease;
        self
    }

    fn connection(&self) -> Result<::redis::Connection, IdempotencyError> {
        self.client
            .get_connection()
            .map_err(|e| IdempotencyError::Unavailable(e.to_string()))
    }
}

fn redis_key(key: &DeliveryKey) -> String {
    format!("{KEY_PREFIX}:{}:{}", key.consumer_group, key.event_id)
}

fn px(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn command_error(op: &str, e: ::redis::RedisError) -> IdempotencyError {
    IdempotencyError::Unavailable(format!("{op} failed: {e}"))
}

/// Parse a stored value into what it means for a new caller.
fn parse_entry(key: &DeliveryKey, raw: &str) -> Result<Reservation, IdempotencyError> {
    let corrupt = |reason: &str| IdempotencyError::Corrupt {
        key: key.clone(),
        reason: format!("{reason}: {raw:?}"),
    };

    let mut parts = raw.splitn(3, '|');
    let (Some(status), Some(fingerprint), Some(rest)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(corrupt("expected three fields"));
    };

    match status {
        "reserved" => {
            let ms: i64 = rest.parse().map_err(|_| corrupt("bad lease expiry"))?;
            let lease_expires_at = Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| corrupt("lease expiry out of range"))?;
            Ok(Reservation::InFlight { lease_expires_at })
        }
        "processed" => {
            let processed_at = DateTime::parse_from_rfc3339(rest)
                .map_err(|_| corrupt("bad processed_at"))?
                .with_timezone(&Utc);
            Ok(Reservation::AlreadyProcessed(DeliveryRecord {
                event_id: key.event_id,
                consumer_group: key.consumer_group.clone(),
                fingerprint: fingerprint.to_string(),
                processed_at,
            }))
        }
        _ => Err(corrupt("unknown status")),
    }
}

impl IdempotencyStore for RedisIdempotencyStore {
    #[instrument(skip(self, fingerprint), fields(key = %key), err)]
    fn check_and_reserve(
        &self,
        key: &DeliveryKey,
        fingerprint: &str,
    ) -> Result<Reservation, IdempotencyError> {
        let mut conn = self.connection()?;
        let redis_key = redis_key(key);

        for _ in 0..RESERVE_ROUNDS {
            let lease_expires_at = Utc::now() + chrono_duration(self.reservation_lease);
            let value = format!(
                "reserved|{fingerprint}|{}",
                lease_expires_at.timestamp_millis()
            );

            let set: Option<String> = ::redis::cmd("SET")
                .arg(&redis_key)
                .arg(&value)
                .arg("NX")
                .arg("PX")
                .arg(px(self.reservation_lease))
                .query(&mut conn)
                .map_err(|e| command_error("SET NX", e))?;
            if set.is_some() {
                return Ok(Reservation::Reserved);
            }

            let existing: Option<String> = ::redis::cmd("GET")
                .arg(&redis_key)
                .query(&mut conn)
                .map_err(|e| command_error("GET", e))?;
            if let Some(raw) = existing {
                return parse_entry(key, &raw);
            }
        }

        Err(IdempotencyError::Unavailable(format!(
            "reservation for {key} kept changing hands"
        )))
    }

    #[instrument(skip(self), fields(key = %key), err)]
    fn mark_processed(&self, key: &DeliveryKey) -> Result<DeliveryRecord, IdempotencyError> {
        let mut conn = self.connection()?;
        let stored: Option<String> = ::redis::Script::new(MARK_SCRIPT)
            .key(redis_key(key))
            .arg(Utc::now().to_rfc3339())
            .arg(px(self.retention))
            .invoke(&mut conn)
            .map_err(|e| command_error("mark script", e))?;

        let raw = stored.ok_or_else(|| IdempotencyError::NotReserved(key.clone()))?;
        match parse_entry(key, &raw)? {
            Reservation::AlreadyProcessed(record) => Ok(record),
            _ => Err(IdempotencyError::Corrupt {
                key: key.clone(),
                reason: "entry not promoted to processed".to_string(),
            }),
        }
    }

    #[instrument(skip(self), fields(key = %key), err)]
    fn release(&self, key: &DeliveryKey) -> Result<(), IdempotencyError> {
        let mut conn = self.connection()?;
        let _: i64 = ::redis::Script::new(RELEASE_SCRIPT)
            .key(redis_key(key))
            .invoke(&mut conn)
            .map_err(|e| command_error("release script", e))?;
        Ok(())
    }

    fn prune_expired(&self, _now: DateTime<Utc>) -> Result<usize, IdempotencyError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::{ConsumerGroup, EventId};

    fn key() -> DeliveryKey {
        DeliveryKey::new(EventId::new(), ConsumerGroup::new("billing").unwrap())
    }

    #[test]
    fn keys_are_scoped_by_group_and_event() {
        let k = key();
        assert_eq!(
            redis_key(&k),
            format!("switchyard:idem:billing:{}", k.event_id)
        );
    }

    #[test]
    fn parses_processed_entries() {
        let k = key();
        let raw = "processed|abc123|2024-05-01T10:00:00+00:00";
        match parse_entry(&k, raw).unwrap() {
            Reservation::AlreadyProcessed(record) => {
                assert_eq!(record.fingerprint, "abc123");
                assert_eq!(record.processed_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_reservations_as_in_flight() {
        let k = key();
        let entry = parse_entry(&k, "reserved|abc123|1714557600000").unwrap();
        assert!(matches!(entry, Reservation::InFlight { .. }));
    }

    #[test]
    fn rejects_garbage() {
        let k = key();
        assert!(matches!(
            parse_entry(&k, "nonsense"),
            Err(IdempotencyError::Corrupt { .. })
        ));
        assert!(matches!(
            parse_entry(&k, "reserved|fp|not-a-number"),
            Err(IdempotencyError::Corrupt { .. })
        ));
    }

    #[test]
    #[ignore = "needs REDIS_URL"]
    fn redis_store_satisfies_the_contract() {
        let Ok(url) = std::env::var("REDIS_URL") else {
            return;
        };
        crate::idempotency::contract::run_all(&|retention, lease| {
            std::sync::Arc::new(
                RedisIdempotencyStore::new(&url)
                    .unwrap()
                    .with_windows(retention, lease),
            )
        });
    }
}
