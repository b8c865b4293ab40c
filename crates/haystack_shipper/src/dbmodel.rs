//! Wire span model and the conversion from the domain model.
//!
//! The wire span is the JSON document the Haystack proxy stores: ids rendered as
//! hex, times in microseconds, the process embedded in every span. Tags can be
//! lifted out of the `tags` list into a flat `tag` object ("tags as fields") so
//! the backend can index them directly.

use crate::config::{ConfigError, TagsAsFieldsConfig};
use crate::model::{KeyValue, Log, RefType, Span, SpanRef, TagValue};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Span as serialized into an envelope message.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DbSpan {
    #[serde(rename = "traceID")]
    pub trace_id: String,
    #[serde(rename = "spanID")]
    pub span_id: String,
    #[serde(rename = "parentSpanID", skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub flags: u32,
    pub operation_name: String,
    pub references: Vec<DbReference>,
    /// Microseconds since the epoch
    pub start_time: u64,
    pub start_time_millis: u64,
    /// Microseconds
    pub duration: u64,
    pub tags: Vec<DbKeyValue>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub tag: Map<String, Value>,
    pub logs: Vec<DbLog>,
    pub process: DbProcess,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DbReference {
    pub ref_type: &'static str,
    #[serde(rename = "traceID")]
    pub trace_id: String,
    #[serde(rename = "spanID")]
    pub span_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DbKeyValue {
    pub key: String,
    #[serde(rename = "type")]
    pub value_type: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DbLog {
    pub timestamp: u64,
    pub fields: Vec<DbKeyValue>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DbProcess {
    pub service_name: String,
    pub tags: Vec<DbKeyValue>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub tag: Map<String, Value>,
}

/// Converts domain spans into [`DbSpan`]s.
#[derive(Debug, Clone)]
pub struct FromDomain {
    all_tags_as_fields: bool,
    tag_keys_as_fields: HashSet<String>,
    dot_replacement: String,
}

impl Default for FromDomain {
    fn default() -> Self {
        Self::new(false, Vec::new(), "@")
    }
}

impl FromDomain {
    pub fn new(
        all_tags_as_fields: bool,
        tag_keys_as_fields: impl IntoIterator<Item = String>,
        dot_replacement: impl Into<String>,
    ) -> Self {
        Self {
            all_tags_as_fields,
            tag_keys_as_fields: tag_keys_as_fields.into_iter().collect(),
            dot_replacement: dot_replacement.into(),
        }
    }

    /// Builds a converter, reading the tag key file when one is configured.
    pub fn from_config(config: &TagsAsFieldsConfig) -> Result<Self, ConfigError> {
        let keys = match &config.config_file {
            Some(path) => load_tag_keys(path)?,
            None => Vec::new(),
        };
        Ok(Self::new(config.all, keys, config.dot_replacement.clone()))
    }

    /// Converts a span, embedding its process.
    pub fn convert(&self, span: &Span) -> DbSpan {
        let parent = span.parent_span_id();
        let (tags, tag) = self.split_tags(&span.tags);
        let (process_tags, process_tag) = self.split_tags(&span.process.tags);
        let start_time = micros_since_epoch(span.start_time);

        DbSpan {
            trace_id: span.trace_id.to_string(),
            span_id: span.span_id.to_string(),
            parent_span_id: (parent.0 != 0).then(|| parent.to_string()),
            flags: span.flags,
            operation_name: span.operation_name.clone(),
            references: span.references.iter().map(convert_reference).collect(),
            start_time,
            start_time_millis: start_time / 1000,
            duration: duration_micros(span.duration),
            tags,
            tag,
            logs: span.logs.iter().map(convert_log).collect(),
            process: DbProcess {
                service_name: span.process.service_name.clone(),
                tags: process_tags,
                tag: process_tag,
            },
            warnings: span.warnings.clone(),
        }
    }

    fn is_field(&self, key: &str) -> bool {
        self.all_tags_as_fields || self.tag_keys_as_fields.contains(key)
    }

    fn split_tags(&self, tags: &[KeyValue]) -> (Vec<DbKeyValue>, Map<String, Value>) {
        let mut list = Vec::new();
        let mut fields = Map::new();
        for kv in tags {
            if self.is_field(&kv.key) {
                let key = kv.key.replace('.', &self.dot_replacement);
                fields.insert(key, typed_value(&kv.value));
            } else {
                list.push(convert_key_value(kv));
            }
        }
        (list, fields)
    }
}

/// Reads tag keys from a file, one per line.
pub fn load_tag_keys(path: &Path) -> Result<Vec<String>, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::TagsFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn convert_key_value(kv: &KeyValue) -> DbKeyValue {
    DbKeyValue {
        key: kv.key.clone(),
        value_type: kv.value.type_name(),
        value: kv.value.to_string(),
    }
}

fn convert_reference(reference: &SpanRef) -> DbReference {
    DbReference {
        ref_type: match reference.ref_type {
            RefType::ChildOf => "CHILD_OF",
            RefType::FollowsFrom => "FOLLOWS_FROM",
        },
        trace_id: reference.trace_id.to_string(),
        span_id: reference.span_id.to_string(),
    }
}

fn convert_log(log: &Log) -> DbLog {
    DbLog {
        timestamp: micros_since_epoch(log.timestamp),
        fields: log.fields.iter().map(convert_key_value).collect(),
    }
}

fn typed_value(value: &TagValue) -> Value {
    match value {
        TagValue::String(s) => Value::String(s.clone()),
        TagValue::Bool(b) => Value::Bool(*b),
        TagValue::Int64(i) => Value::from(*i),
        // NaN and infinities have no JSON form
        TagValue::Float64(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
        TagValue::Binary(bytes) => Value::String(hex::encode(bytes)),
    }
}

fn micros_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, duration_micros)
}

fn duration_micros(duration: Duration) -> u64 {
    duration.as_micros() as u64
}
