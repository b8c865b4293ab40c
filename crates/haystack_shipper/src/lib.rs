//! Haystack Span Shipper
//!
//! Ships finished tracing spans to a Haystack proxy over HTTP. Producers hand
//! spans to a [`SpanWriter`]; a pool of bulk workers batches the encoded
//! envelopes by count, size and time and POSTs each batch as one JSON document.
//! A service descriptor is emitted alongside the first span of every
//! service/operation pair, then suppressed by a bounded TTL cache.
//!
//! ```rust,ignore
//! let writer = SpanWriter::from_config(ShipperConfig::from_env()?)?;
//! writer.write_span(&span).await?;
//! writer.close().await?;
//! ```
//!
//! Delivery is at most once: a failed batch is logged, counted in
//! [`WriteMetrics`] and dropped.

pub mod batch_processor;
pub mod bulk_processor;
pub mod codec;
pub mod config;
pub mod dbmodel;
pub mod model;
pub mod service_cache;
pub mod sink;
pub mod writer;

// Re-export main types
pub use batch_processor::{BatchConfig, BatchMetrics, BatchProcessor};
pub use bulk_processor::{BulkProcessor, WriteMetrics};
pub use codec::{
    encode_service, encode_span, BatchEvent, EncodeError, EnvelopeType, Service, WireEnvelope,
};
pub use config::{ConfigError, MessageFormat, ShipperConfig, TagsAsFieldsConfig};
pub use dbmodel::{DbSpan, FromDomain};
pub use model::{KeyValue, Log, Process, RefType, Span, SpanId, SpanRef, TagValue, TraceId};
pub use service_cache::ServiceCache;
pub use sink::{BatchSink, BatchSinkBoxed, HttpSink, HttpSinkConfig, SinkError, StdoutSink};
pub use writer::{SetupError, SpanWriter, WriteError};
