//! Shipper configuration.
//!
//! Values come from a YAML file ([`ShipperConfig::from_yaml_file`]) or from
//! `HAYSTACK_*` / `ES_*` environment variables ([`ShipperConfig::from_env`]).
//! Everything except the proxy URL and auth token has a default. The config is
//! immutable once the writer is built.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BULK_SIZE: usize = 2 << 20;
pub const DEFAULT_BULK_ACTIONS: usize = 1000;
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_WORKERS: usize = 1;
pub const DEFAULT_SERVICE_CACHE_SIZE: usize = 100_000;
pub const DEFAULT_SERVICE_CACHE_TTL_SECS: u64 = 86_400;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 1;
pub const DEFAULT_MAX_IDLE_CONNS: usize = 100;
pub const DEFAULT_MAX_IDLE_CONNS_PER_HOST: usize = 100;
pub const DEFAULT_DOT_REPLACEMENT: &str = "@";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// One or more mandatory fields are empty.
    #[error("missing required config: {}", .fields.join(", "))]
    Missing { fields: Vec<&'static str> },

    /// The proxy URL does not parse.
    #[error("invalid proxy url {url:?}: {reason}")]
    InvalidProxyUrl { url: String, reason: String },

    /// A numeric field is out of range.
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The tags-as-fields key file could not be read.
    #[error("failed to read tags file {path}: {source}")]
    TagsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How the span or service object is carried in an envelope's `msg` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageFormat {
    /// Pre-serialized JSON text carried as a JSON string.
    #[default]
    Encoded,
    /// The object embedded as nested JSON.
    Json,
}

/// Lifting of selected tags into a flat `tag` object on the wire span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagsAsFieldsConfig {
    /// Lift every tag.
    pub all: bool,
    /// File listing tag keys to lift, one per line.
    pub config_file: Option<PathBuf>,
    /// Replacement for `.` in lifted keys.
    pub dot_replacement: String,
}

impl Default for TagsAsFieldsConfig {
    fn default() -> Self {
        Self {
            all: false,
            config_file: None,
            dot_replacement: DEFAULT_DOT_REPLACEMENT.to_string(),
        }
    }
}

/// Configuration for the span writer, its worker pool and HTTP sink.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShipperConfig {
    /// Haystack proxy endpoint batches are POSTed to
    pub proxy_url: String,
    /// Sent as the `x-auth-token` header
    pub auth_token: String,
    pub request_timeout_secs: u64,
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
    /// Maximum events per batch
    pub bulk_actions: usize,
    /// Maximum cumulative message bytes per batch
    pub bulk_size: usize,
    pub flush_interval_secs: u64,
    pub workers: usize,
    pub service_cache_size: usize,
    pub service_cache_ttl_secs: u64,
    /// Embed messages as JSON objects instead of JSON strings
    pub enable_json_msg_format: bool,
    pub tags_as_fields: TagsAsFieldsConfig,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            proxy_url: String::new(),
            auth_token: String::new(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            max_idle_conns_per_host: DEFAULT_MAX_IDLE_CONNS_PER_HOST,
            bulk_actions: DEFAULT_BULK_ACTIONS,
            bulk_size: DEFAULT_BULK_SIZE,
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
            workers: DEFAULT_WORKERS,
            service_cache_size: DEFAULT_SERVICE_CACHE_SIZE,
            service_cache_ttl_secs: DEFAULT_SERVICE_CACHE_TTL_SECS,
            enable_json_msg_format: false,
            tags_as_fields: TagsAsFieldsConfig::default(),
        }
    }
}

// The auth token never appears in logs.
impl fmt::Debug for ShipperConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShipperConfig")
            .field("proxy_url", &self.proxy_url)
            .field("auth_token", &if self.auth_token.is_empty() { "" } else { "***" })
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_idle_conns", &self.max_idle_conns)
            .field("max_idle_conns_per_host", &self.max_idle_conns_per_host)
            .field("bulk_actions", &self.bulk_actions)
            .field("bulk_size", &self.bulk_size)
            .field("flush_interval_secs", &self.flush_interval_secs)
            .field("workers", &self.workers)
            .field("service_cache_size", &self.service_cache_size)
            .field("service_cache_ttl_secs", &self.service_cache_ttl_secs)
            .field("enable_json_msg_format", &self.enable_json_msg_format)
            .field("tags_as_fields", &self.tags_as_fields)
            .finish()
    }
}

impl ShipperConfig {
    /// Creates a config with defaults and the two mandatory fields set.
    pub fn new(proxy_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            proxy_url: proxy_url.into(),
            auth_token: auth_token.into(),
            ..Self::default()
        }
    }

    /// Loads and validates a YAML config file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_vars(std::env::vars())
    }

    /// Loads and validates config from the given variables. Unknown names are ignored.
    pub fn from_env_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let mut config = Self::default();

        if let Some(v) = vars.get("HAYSTACK_PROXY_URL") {
            config.proxy_url.clone_from(v);
        }
        if let Some(v) = vars.get("HAYSTACK_PROXY_AUTH_TOKEN") {
            config.auth_token.clone_from(v);
        }
        parse_var(
            &vars,
            "HAYSTACK_PROXY_CLIENT_REQUEST_TIMEOUT",
            &mut config.request_timeout_secs,
        )?;
        parse_var(&vars, "HAYSTACK_PROXY_CLIENT_MAX_IDLE_CONNS", &mut config.max_idle_conns)?;
        parse_var(
            &vars,
            "HAYSTACK_PROXY_CLIENT_MAX_IDLE_CONNS_PER_HOST",
            &mut config.max_idle_conns_per_host,
        )?;
        parse_var(&vars, "HAYSTACK_BULK_ACTIONS", &mut config.bulk_actions)?;
        parse_var(&vars, "HAYSTACK_BULK_SIZE", &mut config.bulk_size)?;
        parse_var(&vars, "HAYSTACK_BULK_FLUSH_INTERVAL", &mut config.flush_interval_secs)?;
        parse_var(&vars, "HAYSTACK_BULK_WORKERS", &mut config.workers)?;
        parse_var(&vars, "HAYSTACK_SERVICE_CACHE_SIZE", &mut config.service_cache_size)?;
        parse_var(&vars, "HAYSTACK_SERVICE_CACHE_TTL", &mut config.service_cache_ttl_secs)?;
        parse_var(&vars, "HAYSTACK_ENABLE_JSON_MSG_FORMAT", &mut config.enable_json_msg_format)?;
        parse_var(&vars, "ES_TAGS_AS_FIELDS_ALL", &mut config.tags_as_fields.all)?;
        if let Some(v) = vars.get("ES_TAGS_AS_FIELDS_CONFIG_FILE").filter(|v| !v.is_empty()) {
            config.tags_as_fields.config_file = Some(PathBuf::from(v));
        }
        if let Some(v) = vars.get("ES_TAGS_AS_FIELDS_DOT_REPLACEMENT") {
            config.tags_as_fields.dot_replacement.clone_from(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks mandatory fields and ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.proxy_url.is_empty() {
            missing.push("proxy url");
        }
        if self.auth_token.is_empty() {
            missing.push("auth token");
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing { fields: missing });
        }

        if let Err(e) = reqwest::Url::parse(&self.proxy_url) {
            return Err(ConfigError::InvalidProxyUrl {
                url: self.proxy_url.clone(),
                reason: e.to_string(),
            });
        }

        for (field, value) in [
            ("workers", self.workers),
            ("bulk_actions", self.bulk_actions),
            ("bulk_size", self.bulk_size),
            ("service_cache_size", self.service_cache_size),
            ("flush_interval_secs", self.flush_interval_secs as usize),
            ("request_timeout_secs", self.request_timeout_secs as usize),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn message_format(&self) -> MessageFormat {
        if self.enable_json_msg_format {
            MessageFormat::Json
        } else {
            MessageFormat::Encoded
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn service_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.service_cache_ttl_secs)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_bulk_actions(mut self, bulk_actions: usize) -> Self {
        self.bulk_actions = bulk_actions;
        self
    }

    pub fn with_bulk_size(mut self, bulk_size: usize) -> Self {
        self.bulk_size = bulk_size;
        self
    }

    pub fn with_flush_interval_secs(mut self, secs: u64) -> Self {
        self.flush_interval_secs = secs;
        self
    }

    pub fn with_json_msg_format(mut self, enabled: bool) -> Self {
        self.enable_json_msg_format = enabled;
        self
    }

    pub fn with_service_cache(mut self, size: usize, ttl_secs: u64) -> Self {
        self.service_cache_size = size;
        self.service_cache_ttl_secs = ttl_secs;
        self
    }
}

fn parse_var<T>(
    vars: &HashMap<String, String>,
    name: &'static str,
    target: &mut T,
) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    if let Some(raw) = vars.get(name) {
        *target = raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            field: name,
            reason: e.to_string(),
        })?;
    }
    Ok(())
}
