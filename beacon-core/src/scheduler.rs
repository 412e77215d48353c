//! Flush scheduling
//!
//! One background task owns the flush loop. It wakes on a fixed interval and
//! on commands (explicit flush, lifecycle signals, shutdown). Commands that
//! pile up while a cycle runs are drained together and answered by a single
//! follow-up cycle, so concurrent `flush()` calls coalesce.
//!
//! A cycle:
//!
//! 1. skips if nothing is pending or the circuit breaker refuses;
//! 2. peeks a batch, marks it in flight, compresses and sends it;
//! 3. acks on success, requeues on a retryable failure (and stops the
//!    cycle), dead-letters on a rejection;
//! 4. repeats while batches keep succeeding, up to `max_batches_per_cycle`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::compression::Compressor;
use crate::dlq::{DeadLetterQueue, DeadReason};
use crate::error::TransportError;
use crate::queue::PersistentQueue;
use crate::transport::Transport;
use crate::types::{Batch, QueueEntry};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// What woke the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Interval,
    Manual,
    Foreground,
    Background,
    Shutdown,
}

/// How a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// At least one batch was attempted
    Completed,
    /// Nothing was pending
    Idle,
    /// The circuit breaker refused the cycle
    SkippedCircuitOpen,
    /// No collector endpoint is configured
    NotConfigured,
    /// Another cycle held the guard
    Coalesced,
    /// The pipeline was retired by a shutdown that ran out of time
    Retired,
}

/// Summary of one flush cycle
#[derive(Debug, Clone)]
pub struct FlushResult {
    pub outcome: CycleOutcome,
    pub trigger: Trigger,
    /// Batches attempted
    pub batches: usize,
    pub acked: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Delivered entries, in state `Acked`
    pub acked_entries: Vec<QueueEntry>,
}

impl FlushResult {
    fn new(outcome: CycleOutcome, trigger: Trigger) -> Self {
        Self {
            outcome,
            trigger,
            batches: 0,
            acked: 0,
            requeued: 0,
            dead_lettered: 0,
            acked_entries: Vec::new(),
        }
    }
}

/// Everything a flush cycle touches
pub(crate) struct Pipeline {
    pub queue: Arc<PersistentQueue>,
    pub dlq: Arc<DeadLetterQueue>,
    pub breaker: Arc<CircuitBreaker>,
    pub transport: Transport,
    pub compressor: Compressor,
    pub clock: Arc<dyn Clock>,
    pub batch_max_events: usize,
    pub batch_max_bytes: usize,
    pub max_batches_per_cycle: usize,
    cycle_guard: tokio::sync::Mutex<()>,
    retired: AtomicBool,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<PersistentQueue>,
        dlq: Arc<DeadLetterQueue>,
        breaker: Arc<CircuitBreaker>,
        transport: Transport,
        compressor: Compressor,
        clock: Arc<dyn Clock>,
        batch_max_events: usize,
        batch_max_bytes: usize,
        max_batches_per_cycle: usize,
    ) -> Self {
        Self {
            queue,
            dlq,
            breaker,
            transport,
            compressor,
            clock,
            batch_max_events,
            batch_max_bytes,
            max_batches_per_cycle: max_batches_per_cycle.max(1),
            cycle_guard: tokio::sync::Mutex::new(()),
            retired: AtomicBool::new(false),
        }
    }

    /// Stop touching the queue; results of sends still in flight are dropped
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    fn dead_letter(&self, entries: Vec<QueueEntry>, reason: &DeadReason) -> usize {
        let now = self.clock.now();
        let count = entries.len();
        for entry in entries {
            if let Err(e) = self.dlq.add(entry, reason.clone(), now) {
                tracing::error!(error = %e, "Failed to write dead letter");
            }
        }
        count
    }

    pub async fn run_cycle(&self, trigger: Trigger) -> FlushResult {
        let Ok(_guard) = self.cycle_guard.try_lock() else {
            return FlushResult::new(CycleOutcome::Coalesced, trigger);
        };
        if self.is_retired() {
            return FlushResult::new(CycleOutcome::Retired, trigger);
        }
        if !self.transport.is_configured() {
            return FlushResult::new(CycleOutcome::NotConfigured, trigger);
        }
        if self.queue.pending_count() == 0 {
            return FlushResult::new(CycleOutcome::Idle, trigger);
        }
        if !self.breaker.allow(self.clock.now()) {
            tracing::debug!(?trigger, "Circuit open, skipping flush");
            return FlushResult::new(CycleOutcome::SkippedCircuitOpen, trigger);
        }

        let mut result = FlushResult::new(CycleOutcome::Completed, trigger);
        let mut sent_any = false;

        while result.batches < self.max_batches_per_cycle {
            let entries = self
                .queue
                .peek_batch(self.batch_max_events, self.batch_max_bytes);
            if entries.is_empty() {
                break;
            }

            let batch = Batch::new(entries);
            let ids = batch.event_ids();
            self.queue.mark_in_flight(&ids, self.clock.now());
            result.batches += 1;

            let payload = match self.compressor.compress(&batch) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(batch_id = %batch.batch_id, error = %e, "Failed to encode batch");
                    let dead = self.queue.mark_dead(&ids, self.clock.now());
                    result.dead_lettered += self.dead_letter(
                        dead,
                        &DeadReason::Encoding {
                            message: e.to_string(),
                        },
                    );
                    continue;
                }
            };

            let sent = self.transport.send(&payload).await;
            if self.is_retired() {
                tracing::debug!(batch_id = %batch.batch_id, "Discarding send result after shutdown");
                result.outcome = CycleOutcome::Retired;
                break;
            }

            sent_any = true;
            match sent {
                Ok(ack) => {
                    let acked = self.queue.mark_acked(&ids);
                    self.breaker.record_success();
                    tracing::info!(
                        batch_id = %ack.batch_id,
                        events = acked.len(),
                        attempts = ack.attempts,
                        "Flushed batch"
                    );
                    result.acked += acked.len();
                    result.acked_entries.extend(acked);
                }
                Err(TransportError::ServerRejected(status)) if !is_retryable(status) => {
                    let dead = self.queue.mark_dead(&ids, self.clock.now());
                    result.dead_lettered +=
                        self.dead_letter(dead, &DeadReason::Rejected { status });
                    // The collector answered; the endpoint itself is healthy
                    self.breaker.record_success();
                }
                Err(e) => {
                    let now = self.clock.now();
                    let failed = self.queue.mark_failed(&ids, now);
                    result.requeued += failed.requeued;
                    result.dead_lettered +=
                        self.dead_letter(failed.dead, &DeadReason::RetriesExhausted);
                    self.breaker.record_failure(now);
                    tracing::warn!(
                        batch_id = %batch.batch_id,
                        error = %e,
                        requeued = failed.requeued,
                        "Flush failed"
                    );
                    break;
                }
            }
        }

        if !sent_any {
            // No send reached the breaker, so free the half-open trial slot
            self.breaker.release_probe();
        }

        result
    }
}

fn is_retryable(status: u16) -> bool {
    TransportError::ServerRejected(status).is_retryable()
}

enum Command {
    Flush {
        trigger: Trigger,
        reply: Option<oneshot::Sender<FlushResult>>,
    },
    Shutdown {
        reply: oneshot::Sender<FlushResult>,
    },
}

/// Handle to the background flush task
pub struct FlushScheduler {
    commands: mpsc::Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FlushScheduler {
    /// Spawn the worker. The first interval tick fires one `interval` from now.
    pub(crate) fn start(pipeline: Arc<Pipeline>, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let worker = tokio::spawn(run_worker(pipeline, rx, interval));
        Self {
            commands: tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Request a cycle and wait for its result.
    ///
    /// Returns `None` once the worker has stopped.
    pub async fn flush(&self, trigger: Trigger) -> Option<FlushResult> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Flush {
                trigger,
                reply: Some(reply),
            })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Request a cycle without waiting. Dropped if the command queue is full,
    /// since a queued cycle will pick up the same entries.
    pub fn trigger(&self, trigger: Trigger) {
        let command = Command::Flush {
            trigger,
            reply: None,
        };
        if let Err(e) = self.commands.try_send(command) {
            tracing::debug!(?trigger, error = %e, "Flush trigger not queued");
        }
    }

    /// Stop the loop after one final cycle, waiting at most `grace`.
    ///
    /// Returns the final cycle's result, or `None` if it did not finish in
    /// time. The worker is never aborted; a send already in flight runs to
    /// its own deadline.
    pub async fn shutdown(&self, grace: Duration) -> Option<FlushResult> {
        let (reply, rx) = oneshot::channel();
        let commands = self.commands.clone();
        let result = tokio::time::timeout(grace, async move {
            commands
                .send(Command::Shutdown { reply })
                .await
                .ok()?;
            rx.await.ok()
        })
        .await
        .ok()
        .flatten();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        // On timeout the worker is detached; it exits when its current send finishes
        if let (Some(worker), true) = (worker, result.is_some()) {
            let _ = worker.await;
        }
        result
    }
}

async fn run_worker(pipeline: Arc<Pipeline>, mut rx: mpsc::Receiver<Command>, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(?period, "Flush scheduler started");

    loop {
        let command = tokio::select! {
            _ = interval.tick() => {
                pipeline.run_cycle(Trigger::Interval).await;
                continue;
            }
            command = rx.recv() => command,
        };

        match command {
            None => break,
            Some(Command::Shutdown { reply }) => {
                let result = pipeline.run_cycle(Trigger::Shutdown).await;
                let _ = reply.send(result);
                break;
            }
            Some(Command::Flush { trigger, reply }) => {
                let mut waiters: Vec<oneshot::Sender<FlushResult>> = reply.into_iter().collect();
                let mut shutdown = None;

                // Coalesce everything already queued into this cycle
                while let Ok(next) = rx.try_recv() {
                    match next {
                        Command::Flush { reply, .. } => waiters.extend(reply),
                        Command::Shutdown { reply } => {
                            shutdown = Some(reply);
                            break;
                        }
                    }
                }

                let result = pipeline.run_cycle(trigger).await;
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }

                if let Some(reply) = shutdown {
                    let result = pipeline.run_cycle(Trigger::Shutdown).await;
                    let _ = reply.send(result);
                    break;
                }
            }
        }
    }

    tracing::debug!("Flush scheduler stopped");
}
