//! Domain span model handed to the writer by the instrumented application.

use std::fmt;
use std::time::{Duration, SystemTime};

/// 128-bit trace identifier split into high and low halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TraceId {
    pub high: u64,
    pub low: u64,
}

impl TraceId {
    pub fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.high == 0 {
            write!(f, "{:x}", self.low)
        } else {
            write!(f, "{:x}{:016x}", self.high, self.low)
        }
    }
}

/// 64-bit span identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SpanId(pub u64);

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Typed tag value
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    String(String),
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Binary(Vec<u8>),
}

impl TagValue {
    /// Lowercase type name used on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            TagValue::String(_) => "string",
            TagValue::Bool(_) => "bool",
            TagValue::Int64(_) => "int64",
            TagValue::Float64(_) => "float64",
            TagValue::Binary(_) => "binary",
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::String(s) => f.write_str(s),
            TagValue::Bool(b) => write!(f, "{b}"),
            TagValue::Int64(i) => write!(f, "{i}"),
            TagValue::Float64(v) => write!(f, "{v}"),
            TagValue::Binary(bytes) => f.write_str(&hex::encode(bytes)),
        }
    }
}

/// A single key/value tag.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: TagValue,
}

impl KeyValue {
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: TagValue::String(value.into()),
        }
    }

    pub fn bool(key: impl Into<String>, value: bool) -> Self {
        Self {
            key: key.into(),
            value: TagValue::Bool(value),
        }
    }

    pub fn int64(key: impl Into<String>, value: i64) -> Self {
        Self {
            key: key.into(),
            value: TagValue::Int64(value),
        }
    }

    pub fn float64(key: impl Into<String>, value: f64) -> Self {
        Self {
            key: key.into(),
            value: TagValue::Float64(value),
        }
    }

    pub fn binary(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value: TagValue::Binary(value),
        }
    }
}

/// Relationship between a span and another span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefType {
    ChildOf,
    FollowsFrom,
}

/// Reference to another span
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanRef {
    pub ref_type: RefType,
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

/// Timestamped structured log attached to a span.
#[derive(Debug, Clone, PartialEq)]
pub struct Log {
    pub timestamp: SystemTime,
    pub fields: Vec<KeyValue>,
}

/// The emitting process.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Process {
    pub service_name: String,
    pub tags: Vec<KeyValue>,
}

impl Process {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            tags: Vec::new(),
        }
    }
}

/// A finished span as reported by the tracing library.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub operation_name: String,
    pub references: Vec<SpanRef>,
    pub flags: u32,
    pub start_time: SystemTime,
    pub duration: Duration,
    pub tags: Vec<KeyValue>,
    pub logs: Vec<Log>,
    pub process: Process,
    pub warnings: Vec<String>,
}

impl Span {
    /// Creates a root span with no tags, logs or references.
    pub fn new(
        trace_id: TraceId,
        span_id: SpanId,
        operation_name: impl Into<String>,
        process: Process,
    ) -> Self {
        Self {
            trace_id,
            span_id,
            operation_name: operation_name.into(),
            references: Vec::new(),
            flags: 0,
            start_time: SystemTime::now(),
            duration: Duration::ZERO,
            tags: Vec::new(),
            logs: Vec::new(),
            process,
            warnings: Vec::new(),
        }
    }

    /// Span id of the first `ChildOf` reference within the same trace, or zero.
    pub fn parent_span_id(&self) -> SpanId {
        self.references
            .iter()
            .find(|r| r.ref_type == RefType::ChildOf && r.trace_id == self.trace_id)
            .map_or(SpanId(0), |r| r.span_id)
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_tag(mut self, tag: KeyValue) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn with_reference(mut self, reference: SpanRef) -> Self {
        self.references.push(reference);
        self
    }
}
