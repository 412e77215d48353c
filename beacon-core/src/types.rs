//! Core domain types for beacon
//!
//! These types describe an event from the moment `track()` accepts it until
//! the collector acknowledges it or it lands in the dead letter queue.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Event** | An immutable, fully stamped record created by `track()` |
//! | **Properties** | The closed-type key/value payload of an event |
//! | **QueueEntry** | An event plus its delivery bookkeeping inside the persistent queue |
//! | **Batch** | A short-lived group of entries sent in one transport attempt |
//! | **Dead letter** | An entry that can no longer be delivered, kept for diagnostics and replay |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ============================================
// Properties
// ============================================

/// Event properties, ordered by key so encoding and fingerprints are stable.
pub type Properties = BTreeMap<String, PropertyValue>;

/// A single property value.
///
/// Deliberately closed: anything that is not a scalar or a nested map of
/// the same has to be converted by the caller before it reaches `track()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Map(Properties),
}

impl PropertyValue {
    /// The type this value satisfies in a schema
    pub fn kind(&self) -> PropertyType {
        match self {
            PropertyValue::Bool(_) => PropertyType::Bool,
            PropertyValue::Int(_) | PropertyValue::Float(_) => PropertyType::Number,
            PropertyValue::String(_) => PropertyType::String,
            PropertyValue::Map(_) => PropertyType::Map,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(i64::from(value))
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<Properties> for PropertyValue {
    fn from(value: Properties) -> Self {
        PropertyValue::Map(value)
    }
}

/// Build a [`Properties`] map from `key => value` pairs.
///
/// ```
/// use beacon_core::props;
///
/// let p = props! { "noteId" => "n1", "words" => 12 };
/// assert_eq!(p.len(), 2);
/// ```
#[macro_export]
macro_rules! props {
    () => { $crate::types::Properties::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::types::Properties::new();
        $(map.insert(($key).to_string(), $crate::types::PropertyValue::from($value));)+
        map
    }};
}

/// Declared type of a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    String,
    Number,
    Bool,
    Map,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::String => "string",
            PropertyType::Number => "number",
            PropertyType::Bool => "bool",
            PropertyType::Map => "map",
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================
// Event
// ============================================

/// A captured, sanitized, validated and stamped event.
///
/// Serialized flat with camelCase keys; this is both the wire shape and the
/// persisted shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Generated at capture time, used for idempotency
    pub event_id: Uuid,
    /// Taxonomy name
    pub name: String,
    /// Sanitized properties
    pub properties: Properties,
    /// Capture time (never earlier than the previous event in this process)
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub device_id: String,
    pub user_id: Option<String>,
    /// Monotonic within a session, starting at 1
    pub sequence_number: u64,
    /// Set when a permissive registry let an unregistered name through
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub schema_unknown: bool,
}

// ============================================
// Queue entries
// ============================================

/// Delivery state of a queue entry.
///
/// Transitions only move forward: `Pending -> InFlight -> {Acked | Pending | Dead}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    InFlight,
    Acked,
    Dead,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            EntryState::InFlight => "in_flight",
            EntryState::Acked => "acked",
            EntryState::Dead => "dead",
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event plus its delivery bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// Queue position; also the storage key suffix
    pub seq: u64,
    pub event: Event,
    /// Failed delivery outcomes so far (requeues and dead-lettering)
    pub attempt_count: u32,
    pub first_enqueued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub state: EntryState,
}

impl QueueEntry {
    pub fn new(seq: u64, event: Event, now: DateTime<Utc>) -> Self {
        Self {
            seq,
            event,
            attempt_count: 0,
            first_enqueued_at: now,
            last_attempt_at: None,
            state: EntryState::Pending,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event.event_id
    }
}

// ============================================
// Batches
// ============================================

/// Entries grouped for one transport attempt. Never persisted.
#[derive(Debug, Clone)]
pub struct Batch {
    pub batch_id: Uuid,
    pub entries: Vec<QueueEntry>,
}

impl Batch {
    pub fn new(entries: Vec<QueueEntry>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            entries,
        }
    }

    pub fn event_ids(&self) -> Vec<Uuid> {
        self.entries.iter().map(QueueEntry::event_id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The JSON document sent to the collector (before compression)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEnvelope {
    pub batch_id: Uuid,
    /// Number of events, for server-side idempotency checks
    pub count: usize,
    pub events: Vec<Event>,
}

impl BatchEnvelope {
    pub fn from_batch(batch: &Batch) -> Self {
        Self {
            batch_id: batch.batch_id,
            count: batch.entries.len(),
            events: batch.entries.iter().map(|e| e.event.clone()).collect(),
        }
    }
}
