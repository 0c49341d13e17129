//! Postgres-backed idempotency store.
//!
//! One row per `(event_id, consumer_group)`:
//!
//! | status      | meaning                                   | expires_at            |
//! |-------------|-------------------------------------------|-----------------------|
//! | `reserved`  | a worker is running the handler           | end of the lease      |
//! | `processed` | the group finished the event              | end of retention      |
//!
//! Reservation is a single `INSERT .. ON CONFLICT DO UPDATE .. WHERE` so two
//! workers racing on the same key are serialized by the primary key. The
//! conflict branch only fires for a reservation whose lease ran out.
//!
//! Completing a reservation is a conditional `UPDATE`: it only matches a
//! `reserved` row whose lease is still live.
//!
//! The [`IdempotencyStore`] trait is synchronous (the dispatcher runs on plain
//! threads), so queries are driven with `block_on` on a runtime handle
//! captured at construction. Do not call into this store from a thread that
//! is itself driving that runtime.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::{Span, instrument};

use super::{
    DEFAULT_RESERVATION_LEASE, DEFAULT_RETENTION, DeliveryKey, DeliveryRecord, IdempotencyError,
    IdempotencyStore, Reservation,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS delivery_records (
    event_id        UUID        NOT NULL,
    consumer_group  TEXT        NOT NULL,
    fingerprint     TEXT        NOT NULL,
    status          TEXT        NOT NULL CHECK (status IN ('reserved', 'processed')),
    processed_at    TIMESTAMPTZ,
    expires_at      TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (event_id, consumer_group)
);
CREATE INDEX IF NOT EXISTS delivery_records_expires_at ON delivery_records (expires_at);
"#;

/// Reservations can disappear between the failed insert and the follow-up
/// select (released by the holder); re-run the insert this many times.
const RESERVE_ROUNDS: usize = 3;

#[derive(Debug, Clone)]
pub struct PostgresIdempotencyStore {
    pool: Arc<PgPool>,
    runtime: Handle,
    retention: Duration,
    reservation_lease: Duration,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
            retention: DEFAULT_RETENTION,
            reservation_lease: DEFAULT_RESERVATION_LEASE,
        }
    }

    /// Use the runtime of the calling context.
    pub fn from_current(pool: PgPool) -> Result<Self, IdempotencyError> {
        let runtime = Handle::try_current().map_err(|_| {
            IdempotencyError::Unavailable(
                "PostgresIdempotencyStore requires a tokio runtime handle".to_string(),
            )
        })?;
        Ok(Self::new(pool, runtime))
    }

    pub fn with_windows(mut self, retention: Duration, reservation_lease: Duration) -> Self {
        self.retention = retention;
        self.reservation_lease = reservation_lease;
        self
    }

    /// Create the table and index if missing.
    pub fn ensure_schema(&self) -> Result<(), IdempotencyError> {
        self.runtime.block_on(async {
            sqlx::raw_sql(SCHEMA)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
            Ok(())
        })
    }

    async fn try_reserve(
        &self,
        key: &DeliveryKey,
        fingerprint: &str,
    ) -> Result<bool, IdempotencyError> {
        let row = sqlx::query(
            r#"
            INSERT INTO delivery_records (event_id, consumer_group, fingerprint, status, expires_at)
            VALUES ($1, $2, $3, 'reserved', NOW() + $4::bigint * INTERVAL '1 millisecond')
            ON CONFLICT (event_id, consumer_group) DO UPDATE
            SET fingerprint = EXCLUDED.fingerprint,
                expires_at = EXCLUDED.expires_at
            WHERE delivery_records.status = 'reserved'
              AND delivery_records.expires_at < NOW()
            RETURNING event_id
            "#,
        )
        .bind(key.event_id.as_uuid())
        .bind(key.consumer_group.as_str())
        .bind(fingerprint)
        .bind(millis(self.reservation_lease))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("check_and_reserve", e))?;

        Ok(row.is_some())
    }

    async fn current(&self, key: &DeliveryKey) -> Result<Option<Reservation>, IdempotencyError> {
        let row = sqlx::query(
            r#"
            SELECT fingerprint, status, processed_at, expires_at
            FROM delivery_records
            WHERE event_id = $1 AND consumer_group = $2
            "#,
        )
        .bind(key.event_id.as_uuid())
        .bind(key.consumer_group.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("check_and_reserve", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let corrupt = |reason: String| IdempotencyError::Corrupt {
            key: key.clone(),
            reason,
        };
        let status: String = row.try_get("status").map_err(|e| corrupt(e.to_string()))?;
        let expires_at: DateTime<Utc> =
            row.try_get("expires_at").map_err(|e| corrupt(e.to_string()))?;

        match status.as_str() {
            "reserved" => Ok(Some(Reservation::InFlight {
                lease_expires_at: expires_at,
            })),
            "processed" => {
                let fingerprint: String =
                    row.try_get("fingerprint").map_err(|e| corrupt(e.to_string()))?;
                let processed_at: Option<DateTime<Utc>> =
                    row.try_get("processed_at").map_err(|e| corrupt(e.to_string()))?;
                Ok(Some(Reservation::AlreadyProcessed(DeliveryRecord {
                    event_id: key.event_id,
                    consumer_group: key.consumer_group.clone(),
                    fingerprint,
                    processed_at: processed_at.ok_or_else(|| {
                        corrupt("processed row without processed_at".to_string())
                    })?,
                })))
            }
            other => Err(corrupt(format!("unknown status {other:?}"))),
        }
    }
}

impl IdempotencyStore for PostgresIdempotencyStore {
    #[instrument(skip(self, fingerprint), fields(key = %key, outcome), err)]
    fn check_and_reserve(
        &self,
        key: &DeliveryKey,
        fingerprint: &str,
    ) -> Result<Reservation, IdempotencyError> {
        self.runtime.block_on(async {
            for _ in 0..RESERVE_ROUNDS {
                if self.try_reserve(key, fingerprint).await? {
                    Span::current().record("outcome", "reserved");
                    return Ok(Reservation::Reserved);
                }
                if let Some(existing) = self.current(key).await? {
                    Span::current().record("outcome", "held");
                    return Ok(existing);
                }
            }
            Err(IdempotencyError::Unavailable(format!(
                "reservation for {key} kept changing hands"
            )))
        })
    }

    /// Only a live reservation can be completed. A processed row returns its
    /// existing record; a reservation whose lease ran out is
    /// [`IdempotencyError::LeaseExpired`], since another worker may own it.
    #[instrument(skip(self), fields(key = %key), err)]
    fn mark_processed(&self, key: &DeliveryKey) -> Result<DeliveryRecord, IdempotencyError> {
        self.runtime.block_on(async {
            let updated = sqlx::query(
                r#"
                UPDATE delivery_records
                SET status = 'processed',
                    processed_at = NOW(),
                    expires_at = NOW() + $3::bigint * INTERVAL '1 millisecond'
                WHERE event_id = $1 AND consumer_group = $2
                  AND status = 'reserved' AND expires_at > NOW()
                RETURNING fingerprint, processed_at
                "#,
            )
            .bind(key.event_id.as_uuid())
            .bind(key.consumer_group.as_str())
            .bind(millis(self.retention))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_processed", e))?;

            if let Some(row) = updated {
                return record_from_row(key, &row);
            }

            let current = sqlx::query(
                r#"
                SELECT status, fingerprint, processed_at
                FROM delivery_records
                WHERE event_id = $1 AND consumer_group = $2
                "#,
            )
            .bind(key.event_id.as_uuid())
            .bind(key.consumer_group.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_processed", e))?;

            let Some(row) = current else {
                return Err(IdempotencyError::NotReserved(key.clone()));
            };
            let status: String = row.try_get("status").map_err(|e| IdempotencyError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            match status.as_str() {
                "processed" => record_from_row(key, &row),
                "reserved" => Err(IdempotencyError::LeaseExpired(key.clone())),
                other => Err(IdempotencyError::Corrupt {
                    key: key.clone(),
                    reason: format!("unknown status {other:?}"),
                }),
            }
        })
    }

    #[instrument(skip(self), fields(key = %key), err)]
    fn release(&self, key: &DeliveryKey) -> Result<(), IdempotencyError> {
        self.runtime.block_on(async {
            sqlx::query(
                r#"
                DELETE FROM delivery_records
                WHERE event_id = $1 AND consumer_group = $2 AND status = 'reserved'
                "#,
            )
            .bind(key.event_id.as_uuid())
            .bind(key.consumer_group.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("release", e))?;
            Ok(())
        })
    }

    #[instrument(skip(self), err)]
    fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, IdempotencyError> {
        self.runtime.block_on(async {
            let result = sqlx::query("DELETE FROM delivery_records WHERE expires_at < $1")
                .bind(now)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("prune_expired", e))?;
            Ok(result.rows_affected() as usize)
        })
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn record_from_row(
    key: &DeliveryKey,
    row: &sqlx::postgres::PgRow,
) -> Result<DeliveryRecord, IdempotencyError> {
    let corrupt = |reason: String| IdempotencyError::Corrupt {
        key: key.clone(),
        reason,
    };
    let processed_at: Option<DateTime<Utc>> =
        row.try_get("processed_at").map_err(|e| corrupt(e.to_string()))?;
    Ok(DeliveryRecord {
        event_id: key.event_id,
        consumer_group: key.consumer_group.clone(),
        fingerprint: row.try_get("fingerprint").map_err(|e| corrupt(e.to_string()))?,
        processed_at: processed_at
            .ok_or_else(|| corrupt("processed row without processed_at".to_string()))?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> IdempotencyError {
    match err {
        sqlx::Error::Database(db_err) => IdempotencyError::Unavailable(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            IdempotencyError::Unavailable(format!("connection pool closed in {}", operation))
        }
        _ => IdempotencyError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}
