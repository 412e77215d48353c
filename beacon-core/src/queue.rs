//! Persistent event queue
//!
//! Every entry lives under its own storage key, `queue/entry/{seq:020}`, so
//! key order is queue order and each state change is one single-key write.
//! An in-memory mirror answers reads; storage is written through before any
//! call that promises durability returns.
//!
//! ## Entry lifecycle
//!
//! ```text
//! Pending --mark_in_flight--> InFlight --mark_acked--> (removed)
//!                                |
//!                                +--mark_failed--> Pending (attempt_count + 1)
//!                                |                 or Dead at max_attempts
//!                                +--mark_dead----> Dead (removed, handed to DLQ)
//! ```
//!
//! Entries found `InFlight` on open belonged to a cycle that never finished;
//! they go back to `Pending`.

use crate::error::QueueError;
use crate::storage::{Storage, QUEUE_PREFIX};
use crate::types::{EntryState, Event, QueueEntry};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

type Result<T> = std::result::Result<T, QueueError>;

fn entry_key(seq: u64) -> String {
    format!("{}entry/{:020}", QUEUE_PREFIX, seq)
}

/// Result of a successful enqueue
#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub seq: u64,
    /// Oldest pending entry pushed out to make room, now `Dead`
    pub evicted: Option<QueueEntry>,
}

/// Result of [`PersistentQueue::mark_failed`]
#[derive(Debug, Clone, Default)]
pub struct FailedOutcome {
    /// Entries returned to `Pending`
    pub requeued: usize,
    /// Entries that reached `max_attempts`, now `Dead`
    pub dead: Vec<QueueEntry>,
}

#[derive(Debug, Default)]
struct QueueInner {
    entries: BTreeMap<u64, QueueEntry>,
    by_event: HashMap<Uuid, u64>,
    next_seq: u64,
}

impl QueueInner {
    fn insert(&mut self, entry: QueueEntry) {
        self.by_event.insert(entry.event_id(), entry.seq);
        self.entries.insert(entry.seq, entry);
    }

    fn take(&mut self, seq: u64) -> Option<QueueEntry> {
        let entry = self.entries.remove(&seq)?;
        self.by_event.remove(&entry.event_id());
        Some(entry)
    }

    fn oldest_pending(&self) -> Option<u64> {
        self.entries
            .values()
            .find(|e| e.state == EntryState::Pending)
            .map(|e| e.seq)
    }
}

/// Durable FIFO of [`QueueEntry`]s
pub struct PersistentQueue {
    storage: Arc<dyn Storage>,
    capacity: usize,
    max_attempts: u32,
    inner: Mutex<QueueInner>,
    size: AtomicUsize,
    evicted_total: AtomicU64,
}

impl PersistentQueue {
    /// Load persisted entries, resetting interrupted ones to `Pending`
    pub fn open(storage: Arc<dyn Storage>, capacity: usize, max_attempts: u32) -> Result<Self> {
        let keys = storage
            .keys(&format!("{}entry/", QUEUE_PREFIX))
            .map_err(|e| QueueError::Storage(e.to_string()))?;

        let mut inner = QueueInner::default();
        let mut recovered = 0usize;

        for key in keys {
            let bytes = match storage.get(&key) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => return Err(QueueError::Storage(e.to_string())),
            };
            let mut entry: QueueEntry = match serde_json::from_slice(&bytes) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Dropping unreadable queue entry");
                    if let Err(e) = storage.remove(&key) {
                        tracing::warn!(key = %key, error = %e, "Failed to remove unreadable entry");
                    }
                    continue;
                }
            };

            if entry.state == EntryState::InFlight {
                entry.state = EntryState::Pending;
                let bytes = serde_json::to_vec(&entry)?;
                storage
                    .set(&key, &bytes)
                    .map_err(|e| QueueError::Storage(e.to_string()))?;
                recovered += 1;
            }

            inner.next_seq = inner.next_seq.max(entry.seq + 1);
            inner.insert(entry);
        }

        let size = inner.entries.len();
        tracing::info!(entries = size, recovered, "Opened persistent queue");

        Ok(Self {
            storage,
            capacity: capacity.max(1),
            max_attempts: max_attempts.max(1),
            inner: Mutex::new(inner),
            size: AtomicUsize::new(size),
            evicted_total: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, entry: &QueueEntry) -> Result<()> {
        let bytes = serde_json::to_vec(entry)?;
        self.storage
            .set(&entry_key(entry.seq), &bytes)
            .map_err(|e| QueueError::Storage(e.to_string()))
    }

    /// Best-effort write for bookkeeping the in-memory mirror already holds
    fn persist_quietly(&self, entry: &QueueEntry) {
        if let Err(e) = self.persist(entry) {
            tracing::warn!(seq = entry.seq, error = %e, "Failed to persist queue entry");
        }
    }

    fn remove_quietly(&self, seq: u64) {
        if let Err(e) = self.storage.remove(&entry_key(seq)) {
            tracing::warn!(seq, error = %e, "Failed to remove queue entry");
        }
    }

    /// Append an event. Durable once this returns `Ok`.
    ///
    /// At capacity the oldest `Pending` entry is evicted and returned so the
    /// caller can dead-letter it. An event whose id is already queued is
    /// ignored and the existing sequence number is returned.
    pub fn enqueue(&self, event: Event, now: DateTime<Utc>) -> Result<EnqueueOutcome> {
        let mut inner = self.lock();

        if let Some(&seq) = inner.by_event.get(&event.event_id) {
            tracing::debug!(event_id = %event.event_id, seq, "Ignoring duplicate enqueue");
            return Ok(EnqueueOutcome { seq, evicted: None });
        }

        let victim = if inner.entries.len() >= self.capacity {
            let Some(seq) = inner.oldest_pending() else {
                return Err(QueueError::Full { cap: self.capacity });
            };
            self.storage
                .remove(&entry_key(seq))
                .map_err(|e| QueueError::Storage(e.to_string()))?;
            inner.take(seq)
        } else {
            None
        };

        let seq = inner.next_seq;
        let entry = QueueEntry::new(seq, event, now);
        if let Err(e) = self.persist(&entry) {
            // Put the victim back so a failed enqueue changes nothing
            if let Some(victim) = victim {
                self.persist_quietly(&victim);
                inner.insert(victim);
            }
            return Err(e);
        }

        inner.next_seq += 1;
        inner.insert(entry);

        let evicted = victim.map(|mut victim| {
            victim.state = EntryState::Dead;
            self.evicted_total.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(seq = victim.seq, "Evicted oldest pending entry");
            victim
        });

        self.size.store(inner.entries.len(), Ordering::Relaxed);
        Ok(EnqueueOutcome { seq, evicted })
    }

    /// Oldest pending entries, up to `max_count` and `max_bytes` of encoded
    /// events. Returns at least one entry whenever any is pending.
    pub fn peek_batch(&self, max_count: usize, max_bytes: usize) -> Vec<QueueEntry> {
        let inner = self.lock();
        let mut batch = Vec::new();
        let mut bytes = 0usize;

        for entry in inner
            .entries
            .values()
            .filter(|e| e.state == EntryState::Pending)
        {
            if batch.len() >= max_count.max(1) {
                break;
            }
            let len = serde_json::to_vec(&entry.event)
                .map(|v| v.len())
                .unwrap_or(0);
            if !batch.is_empty() && bytes.saturating_add(len) > max_bytes {
                break;
            }
            bytes = bytes.saturating_add(len);
            batch.push(entry.clone());
        }

        batch
    }

    pub fn mark_in_flight(&self, ids: &[Uuid], now: DateTime<Utc>) {
        let mut inner = self.lock();
        for id in ids {
            let Some(&seq) = inner.by_event.get(id) else {
                continue;
            };
            if let Some(entry) = inner.entries.get_mut(&seq) {
                if entry.state == EntryState::Pending {
                    entry.state = EntryState::InFlight;
                    entry.last_attempt_at = Some(now);
                    self.persist_quietly(entry);
                }
            }
        }
    }

    /// Remove delivered entries, returning them in state `Acked`
    pub fn mark_acked(&self, ids: &[Uuid]) -> Vec<QueueEntry> {
        let mut inner = self.lock();
        let mut acked = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(&seq) = inner.by_event.get(id) else {
                continue;
            };
            if let Some(mut entry) = inner.take(seq) {
                self.remove_quietly(seq);
                entry.state = EntryState::Acked;
                acked.push(entry);
            }
        }
        self.size.store(inner.entries.len(), Ordering::Relaxed);
        acked
    }

    /// Record a retryable failure: back to `Pending`, or `Dead` once
    /// `attempt_count` reaches `max_attempts`
    pub fn mark_failed(&self, ids: &[Uuid], now: DateTime<Utc>) -> FailedOutcome {
        let mut inner = self.lock();
        let mut outcome = FailedOutcome::default();
        for id in ids {
            let Some(&seq) = inner.by_event.get(id) else {
                continue;
            };
            let Some(entry) = inner.entries.get_mut(&seq) else {
                continue;
            };
            entry.attempt_count = entry.attempt_count.saturating_add(1);
            entry.last_attempt_at = Some(now);

            if entry.attempt_count >= self.max_attempts {
                if let Some(mut dead) = inner.take(seq) {
                    self.remove_quietly(seq);
                    dead.state = EntryState::Dead;
                    outcome.dead.push(dead);
                }
            } else {
                entry.state = EntryState::Pending;
                self.persist_quietly(entry);
                outcome.requeued += 1;
            }
        }
        self.size.store(inner.entries.len(), Ordering::Relaxed);
        outcome
    }

    /// Record a non-retryable failure: every entry goes straight to `Dead`
    pub fn mark_dead(&self, ids: &[Uuid], now: DateTime<Utc>) -> Vec<QueueEntry> {
        let mut inner = self.lock();
        let mut dead = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(&seq) = inner.by_event.get(id) else {
                continue;
            };
            if let Some(mut entry) = inner.take(seq) {
                self.remove_quietly(seq);
                entry.attempt_count = entry.attempt_count.saturating_add(1);
                entry.last_attempt_at = Some(now);
                entry.state = EntryState::Dead;
                dead.push(entry);
            }
        }
        self.size.store(inner.entries.len(), Ordering::Relaxed);
        dead
    }

    /// Entries currently persisted (lock-free, may lag a concurrent write)
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| e.state == EntryState::Pending)
            .count()
    }

    /// Entries evicted at capacity since open
    pub fn evicted_total(&self) -> u64 {
        self.evicted_total.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy of every entry, oldest first
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.lock().entries.values().cloned().collect()
    }
}
