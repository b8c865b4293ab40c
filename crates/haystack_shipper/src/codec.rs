//! Wire codec: domain spans and service descriptors into shippable envelopes.
//!
//! Every envelope carries a precomputed `byte_size`: the length of the
//! serialized message text, before the envelope's own JSON framing. Batch size
//! accounting uses it as-is.

use crate::config::MessageFormat;
use crate::dbmodel::DbSpan;
use crate::model::Span;
use serde::Serialize;
use serde_json::value::RawValue;
use thiserror::Error;
use xxhash_rust::xxh3::Xxh3;

/// Errors produced while encoding an envelope.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The span's process has no service name.
    #[error("span {span_id} has an empty service name")]
    MissingServiceName { span_id: String },

    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Kind of payload an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    Span,
    Service,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub service_name: String,
}

/// Envelope payload in the configured [`MessageFormat`].
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Message {
    /// JSON text carried as a string
    Encoded(String),
    /// JSON object embedded verbatim
    Object(Box<RawValue>),
}

impl Message {
    /// The message's JSON text.
    pub fn as_json(&self) -> &str {
        match self {
            Message::Encoded(text) => text,
            Message::Object(raw) => raw.get(),
        }
    }
}

/// One unit of shippable data.
#[derive(Debug, Clone, Serialize)]
pub struct WireEnvelope {
    pub meta: Meta,
    #[serde(rename = "msg")]
    pub message: Message,
    #[serde(skip)]
    byte_size: usize,
}

impl WireEnvelope {
    /// Size of the serialized message, fixed at creation.
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn kind(&self) -> EnvelopeType {
        self.meta.kind
    }

    pub fn service_name(&self) -> &str {
        &self.meta.service_name
    }
}

/// Body of one POST to the proxy.
#[derive(Debug, Clone, Serialize)]
pub struct BatchEvent {
    pub events: Vec<WireEnvelope>,
    pub size: usize,
}

impl BatchEvent {
    pub fn new(events: Vec<WireEnvelope>) -> Self {
        let size = events.len();
        Self { events, size }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Service/operation descriptor emitted alongside spans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub operation_name: String,
    pub service_name: String,
}

impl Service {
    pub fn from_span(span: &Span) -> Self {
        Self {
            operation_name: span.operation_name.clone(),
            service_name: span.process.service_name.clone(),
        }
    }

    /// 64-bit hash of the service name followed by the operation name.
    pub fn hash_code(&self) -> u64 {
        let mut hasher = Xxh3::new();
        hasher.update(self.service_name.as_bytes());
        hasher.update(self.operation_name.as_bytes());
        hasher.digest()
    }
}

/// Wraps a converted span.
pub fn encode_span(span: &DbSpan, format: MessageFormat) -> Result<WireEnvelope, EncodeError> {
    if span.process.service_name.is_empty() {
        return Err(EncodeError::MissingServiceName {
            span_id: span.span_id.clone(),
        });
    }
    envelope(EnvelopeType::Span, &span.process.service_name, span, format)
}

/// Wraps a service descriptor.
pub fn encode_service(
    service: &Service,
    format: MessageFormat,
) -> Result<WireEnvelope, EncodeError> {
    envelope(EnvelopeType::Service, &service.service_name, service, format)
}

fn envelope<T: Serialize>(
    kind: EnvelopeType,
    service_name: &str,
    body: &T,
    format: MessageFormat,
) -> Result<WireEnvelope, EncodeError> {
    let text = serde_json::to_string(body)?;
    let byte_size = text.len();
    let message = match format {
        MessageFormat::Encoded => Message::Encoded(text),
        MessageFormat::Json => Message::Object(RawValue::from_string(text)?),
    };
    Ok(WireEnvelope {
        meta: Meta {
            kind,
            service_name: service_name.to_string(),
        },
        message,
        byte_size,
    })
}
