//! Public client facade
//!
//! [`TelemetryClient`] is a cheap, cloneable handle. Construct it with the
//! host's storage and network capabilities, `initialize()` it with a
//! [`Config`], then `track()` from anywhere.
//!
//! ```text
//! track(name, props)
//!   -> sanitize -> validate -> dedup -> stamp identity -> enqueue (durable)
//!                                                            |
//!               FlushScheduler (background) <----------------+
//!                 -> breaker -> peek -> compress -> send -> ack | requeue | DLQ
//! ```
//!
//! `track()` never fails and never waits on the network. Events tracked
//! before `initialize()` finishes are held in a bounded in-memory buffer and
//! run through the pipeline, in order, once it is ready.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::clock::{Clock, SystemClock};
use crate::compression::Compressor;
use crate::config::{Config, SchedulerConfig};
use crate::dedup::Deduplicator;
use crate::dlq::{DeadLetterQueue, DeadReason, DlqEntry};
use crate::error::{Error, Result, SchemaError};
use crate::identity::IdentityManager;
use crate::network::Network;
use crate::queue::PersistentQueue;
use crate::sanitizer::Sanitizer;
use crate::scheduler::{FlushResult, FlushScheduler, Pipeline, Trigger};
use crate::storage::Storage;
use crate::taxonomy::Registry;
use crate::transport::Transport;
use crate::types::{Event, Properties};

/// Called with the event name and the reason whenever validation drops an event
pub type RejectionCallback = Arc<dyn Fn(&str, &SchemaError) + Send + Sync>;

/// What happened to one `track()` call
#[derive(Debug, Clone, PartialEq)]
pub enum TrackOutcome {
    /// Durably queued
    Enqueued(Uuid),
    /// Held until `initialize()` completes
    Buffered,
    /// Identical to an event seen within the dedup window
    Suppressed,
    Dropped(DropReason),
}

/// Why an event was not queued
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    Rejected(SchemaError),
    PreInitBufferFull,
    /// The queue could not persist the event
    Queue(String),
    ShutDown,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Rejected(e) => write!(f, "rejected: {}", e),
            DropReason::PreInitBufferFull => f.write_str("pre-init buffer full"),
            DropReason::Queue(e) => write!(f, "queue error: {}", e),
            DropReason::ShutDown => f.write_str("client shut down"),
        }
    }
}

/// Lifecycle phase of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Uninitialized,
    Running,
    ShutDown,
}

/// Point-in-time health counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub status: ClientStatus,
    pub queue_size: usize,
    pub dlq_size: usize,
    pub circuit_state: CircuitState,
    /// Failed sends since the last success while the circuit is closed
    pub circuit_failures: u32,
    /// Events waiting for `initialize()`
    pub pre_init_buffered: usize,
    pub enqueued_total: u64,
    pub suppressed_total: u64,
    pub rejected_total: u64,
    pub dropped_total: u64,
    /// Pending entries pushed out of a full queue
    pub queue_evicted_total: u64,
    /// Dead letters pushed out of a full DLQ
    pub dlq_evicted_total: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    suppressed: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// An event captured before the pipeline existed
struct Buffered {
    name: String,
    properties: Properties,
    captured_at: DateTime<Utc>,
}

/// Components alive between `initialize()` and `shutdown()`
struct Running {
    config: Config,
    sanitizer: Sanitizer,
    registry: Registry,
    identity: IdentityManager,
    dedup: Deduplicator,
    pipeline: Arc<Pipeline>,
    scheduler: FlushScheduler,
}

enum ClientState {
    Uninitialized { buffer: VecDeque<Buffered> },
    Running(Arc<Running>),
    ShutDown,
}

struct ClientInner {
    storage: Arc<dyn Storage>,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
    on_rejected: Option<RejectionCallback>,
    pre_init_capacity: usize,
    state: Mutex<ClientState>,
    counters: Counters,
}

/// Builder for [`TelemetryClient`]
pub struct TelemetryClientBuilder {
    storage: Arc<dyn Storage>,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
    on_rejected: Option<RejectionCallback>,
    pre_init_capacity: usize,
}

impl TelemetryClientBuilder {
    /// Time source (defaults to the system clock)
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Observe events dropped by validation
    pub fn on_rejected<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &SchemaError) + Send + Sync + 'static,
    {
        self.on_rejected = Some(Arc::new(callback));
        self
    }

    /// Events held before `initialize()`; further events are dropped.
    /// Usually `config.scheduler.pre_init_capacity`.
    pub fn pre_init_capacity(mut self, capacity: usize) -> Self {
        self.pre_init_capacity = capacity;
        self
    }

    pub fn build(self) -> TelemetryClient {
        TelemetryClient {
            inner: Arc::new(ClientInner {
                storage: self.storage,
                network: self.network,
                clock: self.clock,
                on_rejected: self.on_rejected,
                pre_init_capacity: self.pre_init_capacity,
                state: Mutex::new(ClientState::Uninitialized {
                    buffer: VecDeque::new(),
                }),
                counters: Counters::default(),
            }),
        }
    }
}

/// Handle to one telemetry pipeline
#[derive(Clone)]
pub struct TelemetryClient {
    inner: Arc<ClientInner>,
}

impl TelemetryClient {
    pub fn builder(storage: Arc<dyn Storage>, network: Arc<dyn Network>) -> TelemetryClientBuilder {
        TelemetryClientBuilder {
            storage,
            network,
            clock: Arc::new(SystemClock),
            on_rejected: None,
            pre_init_capacity: SchedulerConfig::default().pre_init_capacity,
        }
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn running(&self) -> Result<Arc<Running>> {
        match &*self.state() {
            ClientState::Running(running) => Ok(running.clone()),
            ClientState::Uninitialized { .. } => Err(Error::NotInitialized),
            ClientState::ShutDown => Err(Error::ShutDown),
        }
    }

    /// Wire every component, load persisted state and start the scheduler.
    ///
    /// Buffered events are processed before this returns. Calling it on a
    /// running client is a no-op; calling it after `shutdown()` starts a
    /// fresh pipeline over the same storage.
    pub async fn initialize(&self, config: Config) -> Result<()> {
        if matches!(&*self.state(), ClientState::Running(_)) {
            tracing::warn!("initialize() called on a running client");
            return Ok(());
        }

        config.validate()?;
        let running = Arc::new(self.build_running(config)?);

        let drained = {
            let mut state = self.state();
            let buffer = match std::mem::replace(&mut *state, ClientState::ShutDown) {
                ClientState::Uninitialized { buffer } => Some(buffer),
                ClientState::ShutDown => Some(VecDeque::new()),
                ClientState::Running(existing) => {
                    *state = ClientState::Running(existing);
                    None
                }
            };
            match buffer {
                Some(buffer) => {
                    let drained = buffer.len();
                    for event in buffer {
                        self.process(&running, &event.name, event.properties, event.captured_at);
                    }
                    *state = ClientState::Running(running.clone());
                    Some(drained)
                }
                None => None,
            }
        };

        let Some(drained) = drained else {
            // Lost a race with a concurrent initialize()
            running.pipeline.retire();
            let _ = running.scheduler.shutdown(std::time::Duration::ZERO).await;
            return Ok(());
        };

        tracing::info!(
            queue_size = running.pipeline.queue.size(),
            dlq_size = running.pipeline.dlq.size(),
            drained,
            "Telemetry client initialized"
        );
        Ok(())
    }

    fn build_running(&self, config: Config) -> Result<Running> {
        let storage = self.inner.storage.clone();

        let sanitizer = Sanitizer::new(&config.sanitizer)?;
        let registry = Registry::from_config(&config.taxonomy);
        let identity = IdentityManager::open(
            storage.clone(),
            chrono::Duration::minutes(i64::from(config.identity.session_idle_minutes)),
        )?;
        let dedup = Deduplicator::new(&config.dedup);

        let queue = Arc::new(PersistentQueue::open(
            storage.clone(),
            config.queue.capacity,
            config.queue.max_attempts,
        )?);
        let dlq = Arc::new(DeadLetterQueue::open(storage, &config.dlq)?);
        let breaker = Arc::new(CircuitBreaker::new(&config.breaker));
        let transport = Transport::new(
            self.inner.network.clone(),
            &config.collector,
            &config.transport,
        );
        if !transport.is_configured() {
            tracing::warn!("collector.server_url is not set; events will queue but not flush");
        }

        let pipeline = Arc::new(Pipeline::new(
            queue,
            dlq,
            breaker,
            transport,
            Compressor::from_config(&config.transport),
            self.inner.clock.clone(),
            config.queue.batch_max_events,
            config.queue.batch_max_bytes,
            config.scheduler.max_batches_per_cycle,
        ));
        let scheduler = FlushScheduler::start(pipeline.clone(), config.scheduler.flush_interval());

        Ok(Running {
            config,
            sanitizer,
            registry,
            identity,
            dedup,
            pipeline,
            scheduler,
        })
    }

    /// Record an event. Never fails and never blocks on the network.
    pub fn track(&self, name: &str, properties: Properties) -> TrackOutcome {
        let now = self.inner.clock.now();

        let running = {
            let mut state = self.state();
            match &mut *state {
                ClientState::Running(running) => running.clone(),
                ClientState::Uninitialized { buffer } => {
                    if buffer.len() >= self.inner.pre_init_capacity {
                        Counters::bump(&self.inner.counters.dropped);
                        tracing::debug!(name, "Pre-init buffer full, dropping event");
                        return TrackOutcome::Dropped(DropReason::PreInitBufferFull);
                    }
                    buffer.push_back(Buffered {
                        name: name.to_string(),
                        properties,
                        captured_at: now,
                    });
                    return TrackOutcome::Buffered;
                }
                ClientState::ShutDown => {
                    Counters::bump(&self.inner.counters.dropped);
                    return TrackOutcome::Dropped(DropReason::ShutDown);
                }
            }
        };

        self.process(&running, name, properties, now)
    }

    fn process(
        &self,
        running: &Running,
        name: &str,
        properties: Properties,
        now: DateTime<Utc>,
    ) -> TrackOutcome {
        let counters = &self.inner.counters;

        let properties = running.sanitizer.sanitize(properties);

        let validated = match running.registry.validate(name, properties) {
            Ok(validated) => validated,
            Err(e) => {
                Counters::bump(&counters.rejected);
                tracing::debug!(name, error = %e, "Event rejected");
                if let Some(callback) = &self.inner.on_rejected {
                    callback(name, &e);
                }
                return TrackOutcome::Dropped(DropReason::Rejected(e));
            }
        };

        let user_id = running.identity.current_user_id();
        if running.dedup.is_duplicate(
            &validated.name,
            &validated.properties,
            user_id.as_deref(),
            now,
        ) {
            Counters::bump(&counters.suppressed);
            return TrackOutcome::Suppressed;
        }

        let stamp = running.identity.stamp(now);
        let event = Event {
            event_id: Uuid::new_v4(),
            name: validated.name,
            properties: validated.properties,
            timestamp: stamp.timestamp,
            session_id: stamp.session_id,
            device_id: stamp.device_id,
            user_id: stamp.user_id,
            sequence_number: stamp.sequence_number,
            schema_unknown: validated.schema_unknown,
        };
        let event_id = event.event_id;

        let pipeline = &running.pipeline;
        match pipeline.queue.enqueue(event, now) {
            Ok(outcome) => {
                Counters::bump(&counters.enqueued);
                if let Some(evicted) = outcome.evicted {
                    if let Err(e) = pipeline.dlq.add(evicted, DeadReason::QueueOverflow, now) {
                        tracing::error!(error = %e, "Failed to dead-letter evicted entry");
                    }
                }
                TrackOutcome::Enqueued(event_id)
            }
            Err(e) => {
                Counters::bump(&counters.dropped);
                tracing::warn!(name = %name, error = %e, "Failed to enqueue event");
                TrackOutcome::Dropped(DropReason::Queue(e.to_string()))
            }
        }
    }

    /// Set or clear the user id stamped on subsequent events
    pub fn identify(&self, user_id: Option<String>) -> Result<()> {
        self.running()?.identity.set_user_id(user_id)
    }

    /// Run a flush cycle now and wait for it
    pub async fn flush(&self) -> Result<FlushResult> {
        let running = self.running()?;
        running
            .scheduler
            .flush(Trigger::Manual)
            .await
            .ok_or(Error::ShutDown)
    }

    /// The app came to the foreground: flush without waiting
    pub fn on_foreground(&self) {
        if let Ok(running) = self.running() {
            running.scheduler.trigger(Trigger::Foreground);
        }
    }

    /// The app is going to the background: flush, waiting at most the
    /// shutdown grace period
    pub async fn on_background(&self) -> Option<FlushResult> {
        let running = self.running().ok()?;
        let grace = running.config.scheduler.shutdown_grace();
        tokio::time::timeout(grace, running.scheduler.flush(Trigger::Background))
            .await
            .ok()
            .flatten()
    }

    /// Stop the scheduler after one best-effort final flush.
    ///
    /// Returns within the configured grace period whatever the network
    /// does. The final flush result is returned if it finished in time.
    pub async fn shutdown(&self) -> Option<FlushResult> {
        let running = {
            let mut state = self.state();
            match std::mem::replace(&mut *state, ClientState::ShutDown) {
                ClientState::Running(running) => running,
                ClientState::Uninitialized { buffer } => {
                    if !buffer.is_empty() {
                        tracing::warn!(
                            dropped = buffer.len(),
                            "Shut down before initialize; buffered events dropped"
                        );
                    }
                    return None;
                }
                ClientState::ShutDown => return None,
            }
        };

        let grace = running.config.scheduler.shutdown_grace();
        let result = running.scheduler.shutdown(grace).await;
        if result.is_none() {
            running.pipeline.retire();
            tracing::warn!(?grace, "Final flush did not finish within the grace period");
        }
        tracing::info!(
            queue_size = running.pipeline.queue.size(),
            "Telemetry client shut down"
        );
        result
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let counters = &self.inner.counters;
        let mut diagnostics = Diagnostics {
            status: ClientStatus::Uninitialized,
            queue_size: 0,
            dlq_size: 0,
            circuit_state: CircuitState::Closed,
            circuit_failures: 0,
            pre_init_buffered: 0,
            enqueued_total: counters.enqueued.load(Ordering::Relaxed),
            suppressed_total: counters.suppressed.load(Ordering::Relaxed),
            rejected_total: counters.rejected.load(Ordering::Relaxed),
            dropped_total: counters.dropped.load(Ordering::Relaxed),
            queue_evicted_total: 0,
            dlq_evicted_total: 0,
        };

        match &*self.state() {
            ClientState::Uninitialized { buffer } => {
                diagnostics.pre_init_buffered = buffer.len();
            }
            ClientState::Running(running) => {
                let pipeline = &running.pipeline;
                diagnostics.status = ClientStatus::Running;
                diagnostics.queue_size = pipeline.queue.size();
                diagnostics.dlq_size = pipeline.dlq.size();
                let breaker = pipeline.breaker.snapshot();
                diagnostics.circuit_state = breaker.state;
                diagnostics.circuit_failures = breaker.consecutive_failures;
                diagnostics.queue_evicted_total = pipeline.queue.evicted_total();
                diagnostics.dlq_evicted_total = pipeline.dlq.evicted_total();
            }
            ClientState::ShutDown => {
                diagnostics.status = ClientStatus::ShutDown;
            }
        }
        diagnostics
    }

    /// Oldest dead letters first
    pub fn dead_letters(&self, limit: usize) -> Result<Vec<DlqEntry>> {
        Ok(self.running()?.pipeline.dlq.list(limit))
    }

    /// Put a dead letter back in the queue with a fresh attempt count
    pub fn replay_dead_letter(&self, event_id: Uuid) -> Result<()> {
        let running = self.running()?;
        let pipeline = &running.pipeline;
        let now = self.inner.clock.now();
        let outcome = pipeline.dlq.replay(event_id, &pipeline.queue, now)?;
        if let Some(evicted) = outcome.evicted {
            pipeline.dlq.add(evicted, DeadReason::QueueOverflow, now)?;
        }
        Ok(())
    }

    /// Drop dead letters older than `age`; returns how many were removed
    pub fn purge_dead_letters(&self, age: chrono::Duration) -> Result<usize> {
        let running = self.running()?;
        Ok(running
            .pipeline
            .dlq
            .purge_older_than(age, self.inner.clock.now())?)
    }
}
