//! # beacon-core
//!
//! Core library for beacon - an offline-first product telemetry pipeline.
//!
//! This library provides:
//! - A `track()` API that never fails and never blocks on the network
//! - PII sanitization and taxonomy validation before anything is stored
//! - A durable, bounded event queue over an injected key-value [`Storage`]
//! - Batched, zstd-compressed delivery with retries and a circuit breaker
//! - A dead letter queue with inspection and replay
//!
//! ## Architecture
//!
//! Events flow through two halves:
//! - **Capture (synchronous):** sanitize, validate, dedup, stamp identity,
//!   persist. Once `track()` returns `Enqueued`, the event survives a crash.
//! - **Delivery (background):** the flush scheduler drains the queue in
//!   batches, acking, requeueing or dead-lettering each one.
//!
//! The host supplies the capabilities: a [`Storage`] (SQLite or in-memory),
//! a [`Network`] (reqwest-backed by default) and optionally a [`Clock`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use beacon_core::{props, Config, HttpNetwork, SqliteStorage, TelemetryClient};
//!
//! # async fn run() -> beacon_core::Result<()> {
//! let config = Config::load()?;
//! let storage = Arc::new(SqliteStorage::open(&Config::database_path())?);
//! let network = Arc::new(HttpNetwork::new()?);
//!
//! let client = TelemetryClient::builder(storage, network).build();
//! client.initialize(config).await?;
//!
//! client.track("note_created", props! { "noteId" => "n1" });
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use breaker::{CircuitBreaker, CircuitState};
pub use client::{
    ClientStatus, Diagnostics, DropReason, TelemetryClient, TelemetryClientBuilder, TrackOutcome,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use dlq::{DeadReason, DlqEntry};
pub use error::{Error, Result};
pub use network::{HttpNetwork, HttpStatus, Network};
pub use scheduler::{CycleOutcome, FlushResult, Trigger};
pub use storage::{MemoryStorage, SqliteStorage, Storage};
pub use types::*;

// Public modules
pub mod backoff;
pub mod breaker;
pub mod client;
pub mod clock;
pub mod compression;
pub mod config;
pub mod dedup;
pub mod dlq;
pub mod error;
pub mod identity;
pub mod logging;
pub mod network;
pub mod queue;
pub mod sanitizer;
pub mod scheduler;
pub mod storage;
pub mod taxonomy;
pub mod transport;
pub mod types;
