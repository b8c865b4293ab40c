use haystack_shipper::{
    BatchSink, KeyValue, Process, ShipperConfig, SinkError, Span, SpanId, SpanWriter, TraceId,
    WriteError,
};
use httpmock::Method::POST;
use httpmock::MockServer;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct TestSink {
    batches: std::sync::Mutex<Vec<Value>>,
}

impl TestSink {
    fn new() -> Self {
        Self {
            batches: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn batch_sizes(&self) -> Vec<u64> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .map(|b| b["size"].as_u64().unwrap())
            .collect()
    }

    fn events(&self) -> Vec<Value> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| b["events"].as_array().unwrap().clone())
            .collect()
    }

    fn span_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| e["meta"]["type"] == "span")
            .count()
    }
}

impl BatchSink for TestSink {
    async fn post(&self, payload: Vec<u8>) -> Result<(), SinkError> {
        let batch: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(
            batch["size"].as_u64().unwrap() as usize,
            batch["events"].as_array().unwrap().len()
        );
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }

    fn name(&self) -> &str {
        "test"
    }
}

// Slow sink for backpressure testing
struct SlowSink {
    delay: Duration,
    inner: TestSink,
}

impl BatchSink for SlowSink {
    async fn post(&self, payload: Vec<u8>) -> Result<(), SinkError> {
        tokio::time::sleep(self.delay).await;
        self.inner.post(payload).await
    }

    fn name(&self) -> &str {
        "slow"
    }
}

// Rejects every batch
struct RejectingSink {
    attempts: AtomicUsize,
}

impl BatchSink for RejectingSink {
    async fn post(&self, _payload: Vec<u8>) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::UnexpectedStatus { status: 500 })
    }

    fn name(&self) -> &str {
        "rejecting"
    }
}

fn config() -> ShipperConfig {
    ShipperConfig::new("http://localhost:9411/spans", "secret")
}

fn create_test_span(service: &str, operation: &str, id: u64) -> Span {
    Span::new(TraceId::new(0, 42), SpanId(id), operation, Process::new(service))
        .with_duration(Duration::from_millis(5))
        .with_tag(KeyValue::string("http.method", "GET"))
}

#[tokio::test]
async fn test_bulk_actions_bound_first_post() {
    let sink = Arc::new(TestSink::new());
    let writer = SpanWriter::new(config().with_bulk_actions(1000), sink.clone()).unwrap();

    for i in 0..1500 {
        writer
            .write_span(&create_test_span("frontend", "/cart", i))
            .await
            .unwrap();
    }
    writer.close().await.unwrap();

    // 1500 spans plus one service descriptor
    assert_eq!(sink.batch_sizes(), vec![1000, 501]);
    assert_eq!(writer.metrics().events_committed(), 1501);
    assert_eq!(writer.metrics().commits_succeeded(), 2);
}

#[tokio::test]
async fn test_bulk_size_bound() {
    let sink = Arc::new(TestSink::new());
    let writer = SpanWriter::new(config().with_bulk_size(1), sink.clone()).unwrap();

    for i in 0..5 {
        writer
            .write_span(&create_test_span("frontend", "/cart", i))
            .await
            .unwrap();
    }
    writer.close().await.unwrap();

    // every envelope alone reaches the size limit
    assert_eq!(sink.batch_sizes(), vec![1; 6]);
}

#[tokio::test]
async fn test_span_precedes_its_service() {
    let sink = Arc::new(TestSink::new());
    let writer = SpanWriter::new(config(), sink.clone()).unwrap();

    writer
        .write_span(&create_test_span("frontend", "/cart", 1))
        .await
        .unwrap();
    writer.close().await.unwrap();

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["meta"]["type"], "span");
    assert_eq!(events[0]["meta"]["serviceName"], "frontend");
    assert_eq!(events[1]["meta"]["type"], "service");

    // default format carries the message as an encoded string
    let msg: Value = serde_json::from_str(events[1]["msg"].as_str().unwrap()).unwrap();
    assert_eq!(msg["serviceName"], "frontend");
    assert_eq!(msg["operationName"], "/cart");
}

#[tokio::test(start_paused = true)]
async fn test_flush_interval_commits_partial_batch() {
    let sink = Arc::new(TestSink::new());
    let writer = SpanWriter::new(config().with_flush_interval_secs(1), sink.clone()).unwrap();

    writer
        .write_span(&create_test_span("frontend", "/cart", 1))
        .await
        .unwrap();
    assert!(sink.batch_sizes().is_empty());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(sink.batch_sizes(), vec![2]);

    writer.close().await.unwrap();
    assert_eq!(sink.batch_sizes(), vec![2]);
}

#[tokio::test]
async fn test_close_drains_pending_events() {
    let sink = Arc::new(TestSink::new());
    let writer = SpanWriter::new(config().with_workers(4), sink.clone()).unwrap();

    for i in 0..250 {
        writer
            .write_span(&create_test_span("frontend", "/cart", i))
            .await
            .unwrap();
    }
    writer.close().await.unwrap();

    assert_eq!(sink.span_count(), 250);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers() {
    let sink = Arc::new(TestSink::new());
    let writer = Arc::new(
        SpanWriter::new(config().with_workers(4).with_bulk_actions(100), sink.clone()).unwrap(),
    );

    let mut tasks = vec![];
    for producer_id in 0..8u64 {
        let writer = Arc::clone(&writer);
        tasks.push(tokio::spawn(async move {
            for seq in 0..500u64 {
                let operation = format!("op-{}", producer_id);
                let span = create_test_span("svc", &operation, producer_id << 32 | seq);
                writer.write_span(&span).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    writer.close().await.unwrap();

    let events = sink.events();
    let span_ids: HashSet<String> = events
        .iter()
        .filter(|e| e["meta"]["type"] == "span")
        .map(|e| e["msg"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(span_ids.len(), 4000);

    let services = events.iter().filter(|e| e["meta"]["type"] == "service").count();
    // one per operation, racing producers may emit a duplicate
    assert!(services >= 8);
    assert!(sink.batch_sizes().iter().all(|&size| size <= 100));
}

#[tokio::test]
async fn test_backpressure_with_slow_sink() {
    let sink = Arc::new(SlowSink {
        delay: Duration::from_millis(20),
        inner: TestSink::new(),
    });
    let writer = SpanWriter::new(config().with_bulk_actions(10), sink.clone()).unwrap();

    for i in 0..200 {
        writer
            .write_span(&create_test_span("frontend", "/cart", i))
            .await
            .unwrap();
    }
    writer.close().await.unwrap();

    assert_eq!(sink.inner.span_count(), 200);
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_close_still_delivers() {
    let sink = Arc::new(SlowSink {
        delay: Duration::from_millis(300),
        inner: TestSink::new(),
    });
    let writer = SpanWriter::new(config(), sink.clone()).unwrap();

    for i in 0..5 {
        writer
            .write_span(&create_test_span("frontend", "/cart", i))
            .await
            .unwrap();
    }

    let first = tokio::time::timeout(Duration::from_millis(50), writer.close()).await;
    assert!(first.is_err());
    assert!(writer.is_closed());

    writer.close().await.unwrap();
    assert_eq!(sink.inner.span_count(), 5);
    assert_eq!(sink.inner.events().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_close_waits_for_drain() {
    let sink = Arc::new(SlowSink {
        delay: Duration::from_millis(300),
        inner: TestSink::new(),
    });
    let writer = Arc::new(SpanWriter::new(config(), sink.clone()).unwrap());

    writer
        .write_span(&create_test_span("frontend", "/cart", 1))
        .await
        .unwrap();

    let first = tokio::spawn({
        let writer = Arc::clone(&writer);
        async move { writer.close().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    writer.close().await.unwrap();
    assert_eq!(sink.inner.events().len(), 2);
    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_huge_flush_interval() {
    let sink = Arc::new(TestSink::new());
    let config = config().with_flush_interval_secs(u64::MAX);
    let writer = SpanWriter::new(config, sink.clone()).unwrap();

    writer
        .write_span(&create_test_span("frontend", "/cart", 1))
        .await
        .unwrap();
    writer.close().await.unwrap();

    assert_eq!(sink.batch_sizes(), vec![2]);
}

#[tokio::test]
async fn test_delivery_failure_is_not_reported_to_producers() {
    let sink = Arc::new(RejectingSink {
        attempts: AtomicUsize::new(0),
    });
    let writer = SpanWriter::new(config().with_bulk_actions(10), sink.clone()).unwrap();

    for i in 0..50 {
        writer
            .write_span(&create_test_span("frontend", "/cart", i))
            .await
            .unwrap();
    }
    writer.close().await.unwrap();

    let metrics = writer.metrics();
    assert_eq!(sink.attempts.load(Ordering::SeqCst), 6);
    assert_eq!(metrics.commits_failed(), 6);
    assert_eq!(metrics.commits_succeeded(), 0);
    assert_eq!(metrics.events_dropped(), 51);
}

#[tokio::test]
async fn test_write_after_close() {
    let sink = Arc::new(TestSink::new());
    let writer = SpanWriter::new(config(), sink.clone()).unwrap();
    writer.close().await.unwrap();

    let result = writer.write_span(&create_test_span("frontend", "/cart", 1)).await;
    assert!(matches!(result, Err(WriteError::Closed)));
    assert!(sink.batch_sizes().is_empty());
}

#[tokio::test]
async fn test_end_to_end_http() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/spans")
                .header("x-auth-token", "e2e-token")
                .header("content-type", "application/json")
                .body_contains(r#""type":"service""#)
                .body_contains(r#""size":3"#);
            then.status(204);
        })
        .await;

    let config = ShipperConfig::new(server.url("/spans"), "e2e-token").with_json_msg_format(true);
    let writer = SpanWriter::from_config(config).unwrap();

    writer
        .write_span(&create_test_span("frontend", "/cart", 1))
        .await
        .unwrap();
    writer
        .write_span(&create_test_span("frontend", "/cart", 2))
        .await
        .unwrap();
    writer.close().await.unwrap();

    mock.assert_hits_async(1).await;
    assert_eq!(writer.metrics().commits_succeeded(), 1);
    assert_eq!(writer.metrics().events_committed(), 3);
}

#[tokio::test]
async fn test_end_to_end_http_rejected() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/spans");
            then.status(400).body("bad batch");
        })
        .await;

    let config = ShipperConfig::new(server.url("/spans"), "token");
    let writer = SpanWriter::from_config(config).unwrap();
    writer
        .write_span(&create_test_span("frontend", "/cart", 1))
        .await
        .unwrap();
    writer.close().await.unwrap();

    mock.assert_hits_async(1).await;
    assert_eq!(writer.metrics().commits_failed(), 1);
    assert_eq!(writer.metrics().events_dropped(), 2);
}
