use crate::config::ShipperConfig;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

pub const AUTH_TOKEN_HEADER: &str = "x-auth-token";

/// Error types for batch delivery
#[derive(Debug, Error, Clone)]
pub enum SinkError {
    /// The request could not be built
    #[error("failed to build request: {0}")]
    Request(String),
    /// Transport-layer error (DNS, connect, reset)
    #[error("transport error: {0}")]
    Transport(String),
    /// No response within the request timeout
    #[error("request timed out")]
    Timeout,
    /// The proxy answered with something other than 204
    #[error("received non 204 success code: {status}")]
    UnexpectedStatus { status: u16 },
    /// The batch could not be serialized
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Destination for serialized batches.
///
/// Uses native async fn in traits; for dynamic dispatch use
/// `Arc<dyn BatchSinkBoxed>`, implemented for every `BatchSink`.
pub trait BatchSink: Send + Sync {
    /// Delivers one serialized `BatchEvent`. Exactly one attempt.
    fn post(&self, payload: Vec<u8>) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Returns the sink name for logging.
    fn name(&self) -> &str;
}

/// Object-safe version of [`BatchSink`].
pub trait BatchSinkBoxed: Send + Sync {
    fn post_boxed(
        &self,
        payload: Vec<u8>,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>>;

    fn name(&self) -> &str;
}

impl<T: BatchSink> BatchSinkBoxed for T {
    fn post_boxed(
        &self,
        payload: Vec<u8>,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>> {
        Box::pin(self.post(payload))
    }

    fn name(&self) -> &str {
        BatchSink::name(self)
    }
}

/// Connection and request settings for [`HttpSink`].
#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    pub endpoint: String,
    pub auth_token: String,
    pub request_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
}

impl From<&ShipperConfig> for HttpSinkConfig {
    fn from(config: &ShipperConfig) -> Self {
        Self {
            endpoint: config.proxy_url.clone(),
            auth_token: config.auth_token.clone(),
            request_timeout: config.request_timeout(),
            // reqwest only bounds idle connections per host
            pool_max_idle_per_host: config.max_idle_conns.min(config.max_idle_conns_per_host),
            pool_idle_timeout: config.request_timeout(),
        }
    }
}

/// POSTs batches to the Haystack proxy over a pooled keep-alive client.
pub struct HttpSink {
    http: reqwest::Client,
    endpoint: String,
    auth_token: String,
}

impl HttpSink {
    pub fn new(config: HttpSinkConfig) -> Result<Self, SinkError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .build()
            .map_err(|e| SinkError::Request(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: config.endpoint,
            auth_token: config.auth_token,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl BatchSink for HttpSink {
    async fn post(&self, payload: Vec<u8>) -> Result<(), SinkError> {
        let request = self
            .http
            .post(&self.endpoint)
            .header(AUTH_TOKEN_HEADER, &self.auth_token)
            .header(CONTENT_TYPE, "application/json")
            .body(payload)
            .build()
            .map_err(|e| {
                error!(error = %e, "failed to create new batch request");
                SinkError::Request(e.to_string())
            })?;

        let response = self.http.execute(request).await.map_err(|e| {
            error!(error = %e, "failed to send request");
            if e.is_timeout() {
                SinkError::Timeout
            } else {
                SinkError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(());
        }

        let body = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                warn!(status = status.as_u16(), error = %e, "failed to read response body");
                String::new()
            }
        };
        warn!(status = status.as_u16(), response = %body, "received non 204 response status code");
        Err(SinkError::UnexpectedStatus {
            status: status.as_u16(),
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Stdout sink for dry runs
pub struct StdoutSink {
    verbose: bool,
}

impl StdoutSink {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl BatchSink for StdoutSink {
    async fn post(&self, payload: Vec<u8>) -> Result<(), SinkError> {
        if self.verbose {
            println!("{}", String::from_utf8_lossy(&payload));
        } else {
            println!("=== batch of {} bytes ===", payload.len());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

/// Test sink that records every payload as parsed JSON
#[cfg(test)]
#[derive(Default)]
pub struct RecordingSink {
    batches: parking_lot::Mutex<Vec<serde_json::Value>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<serde_json::Value> {
        self.batches.lock().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches
            .lock()
            .iter()
            .map(|b| b["size"].as_u64().unwrap() as usize)
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.batch_sizes().iter().sum()
    }
}

#[cfg(test)]
impl BatchSink for RecordingSink {
    async fn post(&self, payload: Vec<u8>) -> Result<(), SinkError> {
        let batch = serde_json::from_slice(&payload).unwrap();
        self.batches.lock().push(batch);
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Test sink that records batches after a fixed delay
#[cfg(test)]
pub struct SlowSink {
    delay: Duration,
    inner: RecordingSink,
}

#[cfg(test)]
impl SlowSink {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: RecordingSink::new(),
        }
    }

    pub fn event_count(&self) -> usize {
        self.inner.event_count()
    }
}

#[cfg(test)]
impl BatchSink for SlowSink {
    async fn post(&self, payload: Vec<u8>) -> Result<(), SinkError> {
        tokio::time::sleep(self.delay).await;
        self.inner.post(payload).await
    }

    fn name(&self) -> &str {
        "slow"
    }
}

/// Test sink that rejects every batch and counts attempts
#[cfg(test)]
#[derive(Default)]
pub struct FailingSink {
    attempts: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FailingSink {
    pub fn attempts(&self) -> usize {
        self.attempts.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl BatchSink for FailingSink {
    async fn post(&self, _payload: Vec<u8>) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Err(SinkError::UnexpectedStatus { status: 503 })
    }

    fn name(&self) -> &str {
        "failing"
    }
}
