//! Span writer: the producer-facing side of the pipeline.
//!
//! Each call converts the span, hands its envelope to a worker over the
//! zero-capacity dispatch channel and, the first time a service/operation pair
//! is seen, a service envelope after it. The hand-off waits for a worker, so a
//! slow proxy slows producers down instead of growing memory.

use crate::batch_processor::BatchConfig;
use crate::bulk_processor::{BulkProcessor, WriteMetrics};
use crate::codec::{encode_service, encode_span, EncodeError, Service, WireEnvelope};
use crate::config::{ConfigError, MessageFormat, ShipperConfig};
use crate::dbmodel::FromDomain;
use crate::model::Span;
use crate::service_cache::ServiceCache;
use crate::sink::{BatchSinkBoxed, HttpSink, HttpSinkConfig, SinkError};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// Errors returned to span producers.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The span could not be encoded; it is dropped.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The writer has been closed.
    #[error("span writer is closed")]
    Closed,

    /// Workers panicked while draining.
    #[error("{count} bulk worker(s) failed during shutdown")]
    WorkerFailed { count: usize },
}

/// Errors raised while building a writer.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build http sink: {0}")]
    Sink(#[from] SinkError),
}

/// Accepts finished spans and feeds the bulk workers.
pub struct SpanWriter {
    converter: FromDomain,
    format: MessageFormat,
    service_cache: ServiceCache,
    /// `None` once closed
    sender: Mutex<Option<flume::Sender<WireEnvelope>>>,
    /// `None` once every worker has been joined; held across the join so
    /// concurrent closers wait for the drain
    processor: tokio::sync::Mutex<Option<BulkProcessor>>,
    metrics: Arc<WriteMetrics>,
}

impl SpanWriter {
    /// Validates the config and starts the workers, delivering to `sink`.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: ShipperConfig, sink: Arc<dyn BatchSinkBoxed>) -> Result<Self, SetupError> {
        info!(config = ?config, "haystack configuration");
        if let Err(e) = config.validate() {
            error!(error = %e, "invalid haystack configuration");
            return Err(e.into());
        }
        let converter = FromDomain::from_config(&config.tags_as_fields)?;

        let (sender, receiver) = flume::bounded(0);
        let metrics = Arc::new(WriteMetrics::default());
        let processor = BulkProcessor::start(
            config.workers,
            BatchConfig::from(&config),
            receiver,
            sink,
            Arc::clone(&metrics),
        );

        Ok(Self {
            converter,
            format: config.message_format(),
            service_cache: ServiceCache::new(config.service_cache_size, config.service_cache_ttl()),
            sender: Mutex::new(Some(sender)),
            processor: tokio::sync::Mutex::new(Some(processor)),
            metrics,
        })
    }

    /// Like [`SpanWriter::new`], delivering to the configured proxy over HTTP.
    pub fn from_config(config: ShipperConfig) -> Result<Self, SetupError> {
        config.validate()?;
        let sink = HttpSink::new(HttpSinkConfig::from(&config))?;
        Self::new(config, Arc::new(sink))
    }

    /// Converts and enqueues a span, waiting until a worker accepts it.
    ///
    /// Only encode failures and use after [`close`](Self::close) are reported;
    /// delivery failures surface in [`metrics`](Self::metrics) and logs.
    pub async fn write_span(&self, span: &Span) -> Result<(), WriteError> {
        let (sender, span_envelope, service_envelope) = self.prepare(span)?;
        sender
            .send_async(span_envelope)
            .await
            .map_err(|_| WriteError::Closed)?;
        if let Some(envelope) = service_envelope {
            sender.send_async(envelope).await.map_err(|_| WriteError::Closed)?;
        }
        Ok(())
    }

    /// Blocking variant of [`write_span`](Self::write_span) for plain threads.
    ///
    /// Blocks the calling thread; do not call from async code.
    pub fn write_span_blocking(&self, span: &Span) -> Result<(), WriteError> {
        let (sender, span_envelope, service_envelope) = self.prepare(span)?;
        sender.send(span_envelope).map_err(|_| WriteError::Closed)?;
        if let Some(envelope) = service_envelope {
            sender.send(envelope).map_err(|_| WriteError::Closed)?;
        }
        Ok(())
    }

    /// Closes the dispatch channel and waits for every worker to flush and exit.
    ///
    /// Writes already past the closed check still complete. Concurrent calls all
    /// wait for the drain; calls after it return `Ok` at once. If the returned
    /// future is dropped early the workers keep draining and the next call
    /// waits for them again.
    pub async fn close(&self) -> Result<(), WriteError> {
        if let Some(sender) = self.sender.lock().take() {
            info!("closing span writer dispatch channel");
            drop(sender);
        }

        let mut processor = self.processor.lock().await;
        let Some(running) = processor.as_mut() else {
            return Ok(());
        };
        let failed = running.stop().await;
        *processor = None;
        info!(
            commits_succeeded = self.metrics.commits_succeeded(),
            commits_failed = self.metrics.commits_failed(),
            events_committed = self.metrics.events_committed(),
            "stopped span writer"
        );

        if failed > 0 {
            return Err(WriteError::WorkerFailed { count: failed });
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub fn metrics(&self) -> &Arc<WriteMetrics> {
        &self.metrics
    }

    /// Encodes the span and, if its service/operation pair is not cached, the
    /// service descriptor. Both are encoded before anything is sent.
    fn prepare(
        &self,
        span: &Span,
    ) -> Result<(flume::Sender<WireEnvelope>, WireEnvelope, Option<WireEnvelope>), WriteError> {
        let sender = self.sender.lock().as_ref().cloned().ok_or(WriteError::Closed)?;

        let db_span = self.converter.convert(span);
        let span_envelope = encode_span(&db_span, self.format).map_err(|e| {
            error!(error = %e, "failed to transform span to haystack span model");
            e
        })?;

        let service = Service::from_span(span);
        let key = service.hash_code();
        let service_envelope = if self.service_cache.get(key) {
            None
        } else {
            let envelope = encode_service(&service, self.format).map_err(|e| {
                error!(error = %e, "failed to transform service to haystack span model");
                e
            })?;
            self.service_cache.put(key);
            Some(envelope)
        };

        Ok((sender, span_envelope, service_envelope))
    }
}
