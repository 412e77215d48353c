//! Dead letter queue
//!
//! Entries that can no longer be delivered land here with the reason they
//! died. The DLQ is bounded; once full, the oldest dead letter is dropped to
//! make room. Dead letters can be inspected, replayed into the persistent
//! queue within the replay window, or purged by age.

use crate::config::DlqConfig;
use crate::error::DlqError;
use crate::queue::{EnqueueOutcome, PersistentQueue};
use crate::storage::{Storage, DLQ_PREFIX};
use crate::types::QueueEntry;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

type Result<T> = std::result::Result<T, DlqError>;

fn entry_key(seq: u64) -> String {
    format!("{}entry/{:020}", DLQ_PREFIX, seq)
}

/// Why an entry was dead-lettered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeadReason {
    /// Retryable failures reached `max_attempts`
    RetriesExhausted,
    /// The collector refused the batch with a non-retryable status
    Rejected { status: u16 },
    /// Evicted from a full persistent queue
    QueueOverflow,
    /// The batch could not be encoded
    Encoding { message: String },
}

impl fmt::Display for DeadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadReason::RetriesExhausted => f.write_str("retries exhausted"),
            DeadReason::Rejected { status } => write!(f, "rejected ({})", status),
            DeadReason::QueueOverflow => f.write_str("queue overflow"),
            DeadReason::Encoding { message } => write!(f, "encoding failed: {}", message),
        }
    }
}

/// One dead letter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqEntry {
    /// Position in the DLQ
    pub seq: u64,
    pub entry: QueueEntry,
    pub reason: DeadReason,
    pub dead_at: DateTime<Utc>,
}

impl DlqEntry {
    pub fn event_id(&self) -> Uuid {
        self.entry.event_id()
    }
}

#[derive(Debug, Default)]
struct DlqInner {
    entries: BTreeMap<u64, DlqEntry>,
    next_seq: u64,
}

pub struct DeadLetterQueue {
    storage: Arc<dyn Storage>,
    capacity: usize,
    replay_window: Duration,
    inner: Mutex<DlqInner>,
    size: AtomicUsize,
    evicted_total: AtomicU64,
}

impl DeadLetterQueue {
    pub fn open(storage: Arc<dyn Storage>, config: &DlqConfig) -> Result<Self> {
        let keys = storage
            .keys(&format!("{}entry/", DLQ_PREFIX))
            .map_err(|e| DlqError::Storage(e.to_string()))?;

        let mut inner = DlqInner::default();
        for key in keys {
            let Some(bytes) = storage
                .get(&key)
                .map_err(|e| DlqError::Storage(e.to_string()))?
            else {
                continue;
            };
            match serde_json::from_slice::<DlqEntry>(&bytes) {
                Ok(entry) => {
                    inner.next_seq = inner.next_seq.max(entry.seq + 1);
                    inner.entries.insert(entry.seq, entry);
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping unreadable dead letter");
                }
            }
        }

        let size = inner.entries.len();
        Ok(Self {
            storage,
            capacity: config.capacity.max(1),
            replay_window: Duration::hours(i64::from(config.replay_window_hours)),
            inner: Mutex::new(inner),
            size: AtomicUsize::new(size),
            evicted_total: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, DlqInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove_key(&self, seq: u64) -> Result<()> {
        self.storage
            .remove(&entry_key(seq))
            .map_err(|e| DlqError::Storage(e.to_string()))
    }

    /// Store a dead entry, dropping the oldest dead letter when full
    pub fn add(&self, entry: QueueEntry, reason: DeadReason, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock();

        let seq = inner.next_seq;
        tracing::warn!(
            event_id = %entry.event_id(),
            name = %entry.event.name,
            attempts = entry.attempt_count,
            reason = %reason,
            "Event dead-lettered"
        );
        let dead = DlqEntry {
            seq,
            entry,
            reason,
            dead_at: now,
        };
        let bytes = serde_json::to_vec(&dead)?;
        self.storage
            .set(&entry_key(seq), &bytes)
            .map_err(|e| DlqError::Storage(e.to_string()))?;
        inner.next_seq += 1;
        inner.entries.insert(seq, dead);

        while inner.entries.len() > self.capacity {
            let Some((&oldest, _)) = inner.entries.iter().next() else {
                break;
            };
            self.remove_key(oldest)?;
            inner.entries.remove(&oldest);
            self.evicted_total.fetch_add(1, Ordering::Relaxed);
        }

        self.size.store(inner.entries.len(), Ordering::Relaxed);
        Ok(())
    }

    /// Oldest dead letters first
    pub fn list(&self, limit: usize) -> Vec<DlqEntry> {
        self.lock()
            .entries
            .values()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Move a dead letter back into the queue with a fresh attempt count
    pub fn replay(
        &self,
        event_id: Uuid,
        queue: &PersistentQueue,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        let mut inner = self.lock();

        let Some(dead) = inner
            .entries
            .values()
            .find(|d| d.event_id() == event_id)
            .cloned()
        else {
            return Err(DlqError::NotFound(event_id));
        };

        if now - dead.dead_at > self.replay_window {
            return Err(DlqError::ReplayWindowExpired(event_id));
        }

        let outcome = queue.enqueue(dead.entry.event, now)?;
        self.remove_key(dead.seq)?;
        inner.entries.remove(&dead.seq);
        self.size.store(inner.entries.len(), Ordering::Relaxed);

        tracing::info!(event_id = %event_id, "Replayed dead letter");
        Ok(outcome)
    }

    /// Remove dead letters older than `age`; returns how many were removed
    pub fn purge_older_than(&self, age: Duration, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock();
        let expired: Vec<u64> = inner
            .entries
            .values()
            .filter(|d| now - d.dead_at > age)
            .map(|d| d.seq)
            .collect();

        for seq in &expired {
            self.remove_key(*seq)?;
            inner.entries.remove(seq);
        }

        self.size.store(inner.entries.len(), Ordering::Relaxed);
        if !expired.is_empty() {
            tracing::info!(purged = expired.len(), "Purged dead letters");
        }
        Ok(expired.len())
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Dead letters dropped because the DLQ was full
    pub fn evicted_total(&self) -> u64 {
        self.evicted_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props;
    use crate::storage::MemoryStorage;
    use crate::types::{EntryState, Event};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 15, 0).unwrap()
    }

    fn dead_entry(n: u64) -> QueueEntry {
        let event = Event {
            event_id: Uuid::new_v4(),
            name: "note_created".to_string(),
            properties: props! { "noteId" => format!("n{}", n) },
            timestamp: t0(),
            session_id: "s-1".to_string(),
            device_id: "d-1".to_string(),
            user_id: None,
            sequence_number: n,
            schema_unknown: false,
        };
        let mut entry = QueueEntry::new(n, event, t0());
        entry.attempt_count = 10;
        entry.state = EntryState::Dead;
        entry
    }

    fn config(capacity: usize) -> DlqConfig {
        DlqConfig {
            capacity,
            replay_window_hours: 72,
        }
    }

    #[test]
    fn test_add_and_list_oldest_first() {
        let storage = Arc::new(MemoryStorage::new());
        let dlq = DeadLetterQueue::open(storage.clone(), &config(10)).unwrap();
        dlq.add(dead_entry(1), DeadReason::RetriesExhausted, t0()).unwrap();
        dlq.add(dead_entry(2), DeadReason::Rejected { status: 400 }, t0())
            .unwrap();

        let listed = dlq.list(10);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].entry.event.sequence_number, 1);
        assert_eq!(listed[1].reason, DeadReason::Rejected { status: 400 });
        assert_eq!(dlq.list(1).len(), 1);

        // Persisted
        let reopened = DeadLetterQueue::open(storage, &config(10)).unwrap();
        assert_eq!(reopened.size(), 2);
        assert_eq!(reopened.list(10), listed);
    }

    #[test]
    fn test_fifo_eviction_at_capacity() {
        let storage = Arc::new(MemoryStorage::new());
        let dlq = DeadLetterQueue::open(storage, &config(2)).unwrap();
        for n in 1..=3 {
            dlq.add(dead_entry(n), DeadReason::QueueOverflow, t0()).unwrap();
        }

        let seqs: Vec<u64> = dlq
            .list(10)
            .iter()
            .map(|d| d.entry.event.sequence_number)
            .collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(dlq.evicted_total(), 1);
    }

    #[test]
    fn test_replay_resets_attempts() {
        let storage = Arc::new(MemoryStorage::new());
        let dlq = DeadLetterQueue::open(storage.clone(), &config(10)).unwrap();
        let queue = PersistentQueue::open(storage, 10, 3).unwrap();

        let entry = dead_entry(1);
        let event_id = entry.event_id();
        dlq.add(entry, DeadReason::RetriesExhausted, t0()).unwrap();

        dlq.replay(event_id, &queue, t0() + Duration::hours(1)).unwrap();
        assert_eq!(dlq.size(), 0);

        let queued = queue.snapshot();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].event_id(), event_id);
        assert_eq!(queued[0].attempt_count, 0);
        assert_eq!(queued[0].state, EntryState::Pending);
    }

    #[test]
    fn test_replay_errors() {
        let storage = Arc::new(MemoryStorage::new());
        let dlq = DeadLetterQueue::open(storage.clone(), &config(10)).unwrap();
        let queue = PersistentQueue::open(storage, 10, 3).unwrap();

        let missing = Uuid::new_v4();
        assert!(matches!(
            dlq.replay(missing, &queue, t0()),
            Err(DlqError::NotFound(id)) if id == missing
        ));

        let entry = dead_entry(1);
        let event_id = entry.event_id();
        dlq.add(entry, DeadReason::RetriesExhausted, t0()).unwrap();
        assert!(matches!(
            dlq.replay(event_id, &queue, t0() + Duration::hours(73)),
            Err(DlqError::ReplayWindowExpired(_))
        ));
        assert_eq!(dlq.size(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_purge_by_age() {
        let storage = Arc::new(MemoryStorage::new());
        let dlq = DeadLetterQueue::open(storage, &config(10)).unwrap();
        dlq.add(dead_entry(1), DeadReason::RetriesExhausted, t0()).unwrap();
        dlq.add(
            dead_entry(2),
            DeadReason::RetriesExhausted,
            t0() + Duration::hours(5),
        )
        .unwrap();

        let purged = dlq
            .purge_older_than(Duration::hours(3), t0() + Duration::hours(6))
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(dlq.list(10)[0].entry.event.sequence_number, 2);
    }

    #[test]
    fn test_reason_serialization() {
        let json = serde_json::to_value(DeadReason::Rejected { status: 413 }).unwrap();
        assert_eq!(json["kind"], "rejected");
        assert_eq!(json["status"], 413);
    }
}
