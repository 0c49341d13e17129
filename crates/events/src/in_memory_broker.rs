//! In-memory partitioned log broker for tests/dev.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::broker::{Broker, BrokerAck, BrokerError, Delivery, OutboundRecord};

#[derive(Debug, Clone)]
struct StoredRecord {
    key: String,
    payload: Vec<u8>,
}

type PartitionKey = (String, u32);
type CursorKey = (String, String, u32);

#[derive(Debug)]
struct Inner {
    logs: HashMap<PartitionKey, Vec<StoredRecord>>,
    // (group, topic, partition) → next offset to deliver
    committed: HashMap<CursorKey, u64>,
    available: bool,
    fail_next_sends: u32,
    send_attempts: u64,
}

/// In-memory broker.
///
/// - No IO, topics and partitions are created on first use
/// - Offsets are plain indices into the partition log
/// - Fault injection for exercising publisher retries
#[derive(Debug)]
pub struct InMemoryBroker {
    inner: Mutex<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, BrokerError> {
        self.inner
            .lock()
            .map_err(|_| BrokerError::Protocol("in-memory broker lock poisoned".to_string()))
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.available = available;
        }
    }

    /// Fail the next `n` sends with `Unavailable`, then recover.
    pub fn fail_next_sends(&self, n: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_next_sends = n;
        }
    }

    /// Total `send` calls seen, including failed ones.
    pub fn send_attempts(&self) -> u64 {
        self.inner.lock().map(|i| i.send_attempts).unwrap_or(0)
    }

    /// Move a group's position back so records from `offset` are redelivered.
    pub fn rewind(&self, group: &str, topic: &str, partition: u32, offset: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner
                .committed
                .insert((group.to_string(), topic.to_string(), partition), offset);
        }
    }

    /// Committed position of a group (next offset it will be given).
    pub fn committed(&self, group: &str, topic: &str, partition: u32) -> u64 {
        self.inner
            .lock()
            .ok()
            .and_then(|i| {
                i.committed
                    .get(&(group.to_string(), topic.to_string(), partition))
                    .copied()
            })
            .unwrap_or(0)
    }

    /// Everything ever written to a partition, regardless of consumers.
    pub fn records(&self, topic: &str, partition: u32) -> Vec<Delivery> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        inner
            .logs
            .get(&(topic.to_string(), partition))
            .map(|log| {
                log.iter()
                    .enumerate()
                    .map(|(offset, r)| to_delivery(topic, partition, offset, r))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Records across all partitions of a topic, partition by partition.
    pub fn topic_records(&self, topic: &str) -> Vec<Delivery> {
        let mut partitions: Vec<u32> = match self.inner.lock() {
            Ok(inner) => inner
                .logs
                .keys()
                .filter(|(t, _)| t == topic)
                .map(|(_, p)| *p)
                .collect(),
            Err(_) => return Vec::new(),
        };
        partitions.sort_unstable();
        partitions
            .into_iter()
            .flat_map(|p| self.records(topic, p))
            .collect()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                logs: HashMap::new(),
                committed: HashMap::new(),
                available: true,
                fail_next_sends: 0,
                send_attempts: 0,
            }),
        }
    }
}

fn to_delivery(topic: &str, partition: u32, offset: usize, record: &StoredRecord) -> Delivery {
    Delivery {
        topic: topic.to_string(),
        partition,
        position: offset.to_string(),
        key: record.key.clone(),
        payload: record.payload.clone(),
    }
}

impl Broker for InMemoryBroker {
    fn send(&self, record: &OutboundRecord) -> Result<BrokerAck, BrokerError> {
        let mut inner = self.lock()?;
        inner.send_attempts += 1;

        if !inner.available {
            return Err(BrokerError::Unavailable("broker offline".to_string()));
        }
        if inner.fail_next_sends > 0 {
            inner.fail_next_sends -= 1;
            return Err(BrokerError::Unavailable("injected send failure".to_string()));
        }

        let log = inner
            .logs
            .entry((record.topic.clone(), record.partition))
            .or_default();
        log.push(StoredRecord {
            key: record.key.clone(),
            payload: record.payload.clone(),
        });

        Ok(BrokerAck {
            topic: record.topic.clone(),
            partition: record.partition,
            position: (log.len() - 1).to_string(),
        })
    }

    fn fetch(
        &self,
        topic: &str,
        partition: u32,
        group: &str,
        max: usize,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let inner = self.lock()?;
        let start = inner
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
            .unwrap_or(0) as usize;

        let Some(log) = inner.logs.get(&(topic.to_string(), partition)) else {
            return Ok(Vec::new());
        };

        Ok(log
            .iter()
            .enumerate()
            .skip(start)
            .take(max)
            .map(|(offset, r)| to_delivery(topic, partition, offset, r))
            .collect())
    }

    fn commit(&self, group: &str, delivery: &Delivery) -> Result<(), BrokerError> {
        let offset: u64 = delivery.position.parse().map_err(|_| {
            BrokerError::Protocol(format!("invalid in-memory offset '{}'", delivery.position))
        })?;

        let mut inner = self.lock()?;
        let cursor = inner
            .committed
            .entry((group.to_string(), delivery.topic.clone(), delivery.partition))
            .or_insert(0);
        *cursor = (*cursor).max(offset + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(topic: &str, partition: u32, body: &str) -> OutboundRecord {
        OutboundRecord {
            topic: topic.to_string(),
            partition,
            key: "k".to_string(),
            payload: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn uncommitted_records_are_fetched_again() {
        let broker = InMemoryBroker::new();
        broker.send(&record("t", 0, "a")).unwrap();
        broker.send(&record("t", 0, "b")).unwrap();

        let first = broker.fetch("t", 0, "g", 10).unwrap();
        assert_eq!(first.len(), 2);
        broker.commit("g", &first[0]).unwrap();

        let again = broker.fetch("t", 0, "g", 10).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].payload, b"b");
    }

    #[test]
    fn groups_track_positions_independently() {
        let broker = InMemoryBroker::new();
        broker.send(&record("t", 1, "a")).unwrap();

        let d = broker.fetch("t", 1, "billing", 10).unwrap();
        broker.commit("billing", &d[0]).unwrap();

        assert!(broker.fetch("t", 1, "billing", 10).unwrap().is_empty());
        assert_eq!(broker.fetch("t", 1, "crm", 10).unwrap().len(), 1);
    }

    #[test]
    fn injected_failures_are_transient() {
        let broker = InMemoryBroker::new();
        broker.fail_next_sends(2);

        assert!(broker.send(&record("t", 0, "a")).unwrap_err().is_transient());
        assert!(broker.send(&record("t", 0, "a")).is_err());
        assert!(broker.send(&record("t", 0, "a")).is_ok());
        assert_eq!(broker.send_attempts(), 3);
    }

    #[test]
    fn rewind_forces_redelivery() {
        let broker = InMemoryBroker::new();
        broker.send(&record("t", 0, "a")).unwrap();
        let d = broker.fetch("t", 0, "g", 1).unwrap();
        broker.commit("g", &d[0]).unwrap();
        assert_eq!(broker.committed("g", "t", 0), 1);

        broker.rewind("g", "t", 0, 0);
        assert_eq!(broker.fetch("t", 0, "g", 1).unwrap()[0].payload, b"a");
    }
}
