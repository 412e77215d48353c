//! Durable key-value storage capability
//!
//! The persistent queue, the dead letter queue and the identity manager only
//! ever talk to a [`Storage`]. The host application decides what backs it:
//!
//! - [`SqliteStorage`] - single-file SQLite store (WAL, `synchronous = FULL`)
//! - [`MemoryStorage`] - in-process map, for tests and ephemeral clients
//!
//! Implementations must make every single-key `set`/`remove` crash-consistent:
//! once the call returns `Ok`, a restart sees the new value.

pub mod schema;
mod sqlite;

pub use sqlite::SqliteStorage;

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Key prefix owned by the persistent queue
pub const QUEUE_PREFIX: &str = "queue/";
/// Key prefix owned by the dead letter queue
pub const DLQ_PREFIX: &str = "dlq/";
/// Key prefix owned by the identity manager
pub const IDENTITY_PREFIX: &str = "identity/";

/// Injected durable key-value store
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`, in ascending order
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory [`Storage`]
///
/// Survives "restarts" as long as the same instance (usually behind an
/// `Arc`) is handed to the next client, which is how the durability tests
/// simulate a process restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    read_only: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, to exercise storage-error paths
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(Error::Storage("storage is read-only".to_string()));
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
