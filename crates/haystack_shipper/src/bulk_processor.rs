//! Bulk Processor - concurrent batch workers
//!
//! `workers` identical tasks share one receiver of the dispatch channel. Each
//! owns its own [`BatchProcessor`] and flush timer and commits independently:
//!
//! - envelope received: append, commit if count or size limit reached
//! - timer tick: commit whatever is pending
//! - channel disconnected: commit the trailing partial batch, then exit
//!
//! Commits are single attempts. A failed batch is logged, counted and dropped,
//! and the worker goes back to accumulating.

use crate::batch_processor::{BatchConfig, BatchMetrics, BatchProcessor, PendingBatch};
use crate::codec::WireEnvelope;
use crate::sink::{BatchSinkBoxed, SinkError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Roughly 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Commit outcomes shared by all workers (uses atomics)
///
/// Every commit attempt records exactly one outcome and one duration sample.
#[derive(Debug, Default)]
pub struct WriteMetrics {
    pub commits_succeeded: AtomicU64,
    pub commits_failed: AtomicU64,
    /// Envelopes delivered in successful commits
    pub events_committed: AtomicU64,
    /// Envelopes lost to failed commits
    pub events_dropped: AtomicU64,
    /// Sum of commit durations in nanoseconds
    pub commit_nanos: AtomicU64,
}

// Statistical counters only; nothing synchronizes on them, so Relaxed throughout.
impl WriteMetrics {
    pub fn commits_succeeded(&self) -> u64 {
        self.commits_succeeded.load(Ordering::Relaxed)
    }

    pub fn commits_failed(&self) -> u64 {
        self.commits_failed.load(Ordering::Relaxed)
    }

    pub fn commit_attempts(&self) -> u64 {
        self.commits_succeeded() + self.commits_failed()
    }

    pub fn events_committed(&self) -> u64 {
        self.events_committed.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    pub fn mean_commit_duration(&self) -> Duration {
        let attempts = self.commit_attempts();
        if attempts == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.commit_nanos.load(Ordering::Relaxed) / attempts)
    }

    fn record(&self, result: &Result<(), SinkError>, event_count: u64, elapsed: Duration) {
        self.commit_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        if result.is_ok() {
            self.commits_succeeded.fetch_add(1, Ordering::Relaxed);
            self.events_committed.fetch_add(event_count, Ordering::Relaxed);
        } else {
            self.commits_failed.fetch_add(1, Ordering::Relaxed);
            self.events_dropped.fetch_add(event_count, Ordering::Relaxed);
        }
    }
}

/// Running pool of batch workers.
///
/// Dropping the pool detaches the workers instead of aborting them; they still
/// drain and exit once the dispatch channel disconnects.
pub struct BulkProcessor {
    workers: JoinSet<BatchMetrics>,
    worker_count: usize,
    /// Panicked workers seen so far, kept across cancelled `stop` calls
    failed: usize,
}

impl BulkProcessor {
    /// Spawns `worker_count` workers on the current tokio runtime and returns immediately.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn start(
        worker_count: usize,
        config: BatchConfig,
        receiver: flume::Receiver<WireEnvelope>,
        sink: Arc<dyn BatchSinkBoxed>,
        metrics: Arc<WriteMetrics>,
    ) -> Self {
        info!(worker_count, sink = sink.name(), "starting bulk processor workers");
        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            workers.spawn(run_worker(
                worker_id,
                config.clone(),
                receiver.clone(),
                Arc::clone(&sink),
                Arc::clone(&metrics),
            ));
            debug!(worker_id, "started bulk worker");
        }
        Self {
            workers,
            worker_count,
            failed: 0,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Waits until every worker has drained and exited.
    ///
    /// Workers only exit once every sender of the dispatch channel is dropped;
    /// stopping with a live sender waits forever. Returns the number of workers
    /// that panicked.
    ///
    /// Cancel safe: a dropped `stop` future leaves the remaining workers
    /// running, and the next call resumes waiting for them.
    pub async fn stop(&mut self) -> usize {
        while let Some(result) = self.workers.join_next().await {
            match result {
                Ok(totals) => debug!(
                    batches_committed = totals.batches_committed,
                    events_committed = totals.events_committed,
                    batches_dropped = totals.batches_dropped,
                    "bulk worker drained"
                ),
                Err(e) => {
                    self.failed += 1;
                    error!(error = %e, "bulk worker task failed");
                }
            }
        }
        self.failed
    }
}

impl Drop for BulkProcessor {
    fn drop(&mut self) {
        self.workers.detach_all();
    }
}

async fn run_worker(
    worker_id: usize,
    config: BatchConfig,
    receiver: flume::Receiver<WireEnvelope>,
    sink: Arc<dyn BatchSinkBoxed>,
    metrics: Arc<WriteMetrics>,
) -> BatchMetrics {
    let period = config.flush_interval;
    let mut processor = BatchProcessor::new(config);
    let mut totals = BatchMetrics::default();
    // first tick one full period after start, not immediately; an interval
    // past the clock's range never ticks
    let first_tick = Instant::now()
        .checked_add(period)
        .unwrap_or_else(|| Instant::now() + FAR_FUTURE);
    let mut ticker = tokio::time::interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = receiver.recv_async() => match received {
                Ok(envelope) => {
                    if processor.add(envelope) {
                        if let Some(batch) = processor.take_batch() {
                            commit(worker_id, batch, sink.as_ref(), &metrics, &mut totals).await;
                        }
                    }
                }
                Err(flume::RecvError::Disconnected) => {
                    if let Some(batch) = processor.take_batch() {
                        commit(worker_id, batch, sink.as_ref(), &metrics, &mut totals).await;
                    }
                    info!(worker_id, "exiting bulk worker");
                    return totals;
                }
            },
            _ = ticker.tick() => {
                if let Some(batch) = processor.take_batch() {
                    commit(worker_id, batch, sink.as_ref(), &metrics, &mut totals).await;
                }
            }
        }
    }
}

async fn commit(
    worker_id: usize,
    batch: PendingBatch,
    sink: &dyn BatchSinkBoxed,
    metrics: &WriteMetrics,
    totals: &mut BatchMetrics,
) {
    let start = Instant::now();
    let batch_len = batch.event.len();

    let result = match serde_json::to_vec(&batch.event) {
        Ok(payload) => sink.post_boxed(payload).await,
        Err(e) => {
            error!(worker_id, batch_len, error = %e, "failed to marshal span batch");
            Err(SinkError::Serialization(e.to_string()))
        }
    };

    let elapsed = start.elapsed();
    metrics.record(&result, batch_len as u64, elapsed);
    debug!(
        worker_id,
        batch_len,
        batch_bytes = batch.byte_size,
        duration_ms = elapsed.as_secs_f64() * 1000.0,
        "commit finished"
    );

    match result {
        Ok(()) => {
            totals.record_success(batch_len as u64);
            debug!(worker_id, batch_len, "batch written to proxy");
        }
        Err(e) => {
            totals.record_drop();
            warn!(
                worker_id,
                batch_len,
                sink = sink.name(),
                error = %e,
                "failed to write batch to proxy, dropping"
            );
        }
    }
}
