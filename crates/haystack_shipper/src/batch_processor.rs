//! Batch Processor - Pure Batching Abstraction
//!
//! A [`BatchProcessor`] accumulates envelopes for exactly one worker and
//! decides when the batch must be committed. It owns no channel, no timer and
//! no sink, so it is testable without any async machinery; the worker loop in
//! [`bulk_processor`](crate::bulk_processor) supplies those.
//!
//! # Flush rules
//!
//! After every [`add`](BatchProcessor::add) the item count and the cumulative
//! byte size are checked together. Reaching either limit requests a commit;
//! there is no priority between them.
//!
//! ```rust,ignore
//! let mut processor = BatchProcessor::new(BatchConfig::default());
//! if processor.add(envelope) {
//!     let batch = processor.take_batch().unwrap();
//!     commit(batch).await;
//! }
//! ```
//!
//! # Metrics: BatchMetrics vs WriteMetrics
//!
//! | Type | Location | Fields | Use Case |
//! |------|----------|--------|----------|
//! | `BatchMetrics` | `batch_processor.rs` | Plain `u64` | One worker's own totals |
//! | `WriteMetrics` | `bulk_processor.rs` | `AtomicU64` | Shared across all workers |

use crate::codec::{BatchEvent, WireEnvelope};
use std::time::Duration;

/// Configuration for batch processing
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum number of envelopes per batch
    pub max_items: usize,
    /// Maximum cumulative envelope `byte_size` per batch
    pub max_bytes: usize,
    /// Period of each worker's flush timer
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_items: crate::config::DEFAULT_BULK_ACTIONS,
            max_bytes: crate::config::DEFAULT_BULK_SIZE,
            flush_interval: Duration::from_secs(crate::config::DEFAULT_FLUSH_INTERVAL_SECS),
        }
    }
}

impl From<&crate::config::ShipperConfig> for BatchConfig {
    fn from(config: &crate::config::ShipperConfig) -> Self {
        Self {
            max_items: config.bulk_actions,
            max_bytes: config.bulk_size,
            flush_interval: config.flush_interval(),
        }
    }
}

/// Per-worker totals (plain u64 - the worker owns them exclusively)
#[derive(Debug, Default, Clone)]
pub struct BatchMetrics {
    /// Batches committed successfully
    pub batches_committed: u64,
    /// Envelopes in successful batches
    pub events_committed: u64,
    /// Batches dropped after a failed commit
    pub batches_dropped: u64,
}

impl BatchMetrics {
    pub fn record_success(&mut self, event_count: u64) {
        self.batches_committed += 1;
        self.events_committed += event_count;
    }

    pub fn record_drop(&mut self) {
        self.batches_dropped += 1;
    }
}

/// A batch taken from the processor, ready to commit.
#[derive(Debug)]
pub struct PendingBatch {
    pub event: BatchEvent,
    /// Sum of the envelopes' `byte_size`
    pub byte_size: usize,
}

/// Accumulates envelopes for one worker.
pub struct BatchProcessor {
    pending: Vec<WireEnvelope>,
    byte_size: usize,
    config: BatchConfig,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            pending: Vec::new(),
            byte_size: 0,
            config,
        }
    }

    /// Appends an envelope. Returns `true` when the batch must be committed now.
    pub fn add(&mut self, envelope: WireEnvelope) -> bool {
        self.byte_size += envelope.byte_size();
        self.pending.push(envelope);
        self.should_flush()
    }

    /// Count or size limit reached
    pub fn should_flush(&self) -> bool {
        !self.pending.is_empty()
            && (self.pending.len() >= self.config.max_items
                || self.byte_size >= self.config.max_bytes)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Takes all pending envelopes, resetting count and size.
    ///
    /// Returns `None` if nothing is pending.
    pub fn take_batch(&mut self) -> Option<PendingBatch> {
        if self.pending.is_empty() {
            return None;
        }
        let events = std::mem::take(&mut self.pending);
        let byte_size = std::mem::replace(&mut self.byte_size, 0);
        Some(PendingBatch {
            event: BatchEvent::new(events),
            byte_size,
        })
    }
}
