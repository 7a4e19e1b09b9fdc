//! Integration tests for the tail pipeline.
//!
//! These tests drive `TailCycle` against real files on disk with in-memory
//! sinks standing in for WebSocket subscribers: growth, rotation, partial
//! lines, failure isolation and the detector-driven loop.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.
//! We test the panic-free behavior of production code through assertions.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use logcast_core::{FileChange, Line, MonitoredFile, TailError};
use logcastd::broadcast::Broadcaster;
use logcastd::detector::ChangeDetector;
use logcastd::registry::{LineSink, SendError, Subscriber, SubscriberId, SubscriberRegistry};
use logcastd::stats::TailStats;
use logcastd::tail::{spawn_tail, CycleError, TailCycle};
use tempfile::TempDir;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound for the detector-driven tests
const DELIVERY_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Helpers
// ============================================================================

/// Sink that records every line it receives.
#[derive(Default)]
struct RecordingSink {
    received: Mutex<Vec<Vec<u8>>>,
}

impl RecordingSink {
    fn received(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }
}

#[async_trait]
impl LineSink for RecordingSink {
    async fn send(&self, line: &Line) -> Result<(), SendError> {
        self.received.lock().unwrap().push(line.as_bytes().to_vec());
        Ok(())
    }
}

/// Sink whose connection is already gone.
struct FailingSink;

#[async_trait]
impl LineSink for FailingSink {
    async fn send(&self, _line: &Line) -> Result<(), SendError> {
        Err(SendError::Closed)
    }
}

/// Sink that takes `delay` to accept each line, keeping a cycle busy.
struct SlowSink {
    delay: Duration,
    inner: RecordingSink,
}

impl SlowSink {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: RecordingSink::default(),
        }
    }
}

#[async_trait]
impl LineSink for SlowSink {
    async fn send(&self, line: &Line) -> Result<(), SendError> {
        sleep(self.delay).await;
        self.inner.send(line).await
    }
}

/// A log file in a temp dir plus the pipeline tailing it.
struct TestTail {
    _dir: TempDir, // Keep alive for RAII cleanup
    path: PathBuf,
    registry: SubscriberRegistry,
    stats: Arc<TailStats>,
}

impl TestTail {
    fn new(initial: &[u8]) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("app.log");
        fs::write(&path, initial).expect("write initial content");

        Self {
            _dir: dir,
            path,
            registry: SubscriberRegistry::default(),
            stats: TailStats::new(),
        }
    }

    fn cycle(&self) -> TailCycle {
        let file = MonitoredFile::open(&self.path).expect("open monitored file");
        let broadcaster = Broadcaster::new(self.registry.clone(), SEND_TIMEOUT, 8, self.stats.clone());
        TailCycle::new(file, broadcaster, self.stats.clone())
    }

    async fn subscribe(&self, id: u64, sink: Arc<dyn LineSink>) {
        self.registry
            .add(Subscriber::new(SubscriberId::new(id), sink))
            .await
            .expect("add subscriber");
    }

    async fn recorder(&self, id: u64) -> Arc<RecordingSink> {
        let sink = Arc::new(RecordingSink::default());
        self.subscribe(id, sink.clone()).await;
        sink
    }

    fn append(&self, data: &[u8]) {
        append(&self.path, data);
    }
}

fn append(path: &Path, data: &[u8]) {
    let mut file = OpenOptions::new().append(true).open(path).expect("open for append");
    file.write_all(data).expect("append");
    file.flush().expect("flush");
}

/// Polls `sink` until it holds `count` lines or the wait times out.
async fn wait_for_lines(sink: &RecordingSink, count: usize) -> Vec<String> {
    let deadline = Instant::now() + DELIVERY_WAIT_TIMEOUT;
    loop {
        let received = sink.received();
        if received.len() >= count || Instant::now() >= deadline {
            return received;
        }
        sleep(Duration::from_millis(20)).await;
    }
}

// ============================================================================
// Growth Tests
// ============================================================================

#[tokio::test]
async fn test_appended_lines_reach_every_subscriber_once() {
    let tail = TestTail::new(b"history\n");
    let first = tail.recorder(1).await;
    let second = tail.recorder(2).await;
    let mut cycle = tail.cycle();

    tail.append(b"a\n");
    let report = cycle.run_once().await.unwrap();
    assert_eq!(report.change, FileChange::Grown);
    assert_eq!(report.lines, 1);

    tail.append(b"b\n");
    cycle.run_once().await.unwrap();

    // Content present before startup is never sent.
    assert_eq!(first.received(), vec!["a\n", "b\n"]);
    assert_eq!(second.received(), vec!["a\n", "b\n"]);
    assert_eq!(cycle.file().last_offset(), 12);
}

#[tokio::test]
async fn test_multiple_lines_keep_file_order() {
    let tail = TestTail::new(b"");
    let sink = tail.recorder(1).await;
    let mut cycle = tail.cycle();

    tail.append(b"one\ntwo\nthree\n");
    let report = cycle.run_once().await.unwrap();

    assert_eq!(report.lines, 3);
    assert_eq!(sink.received(), vec!["one\n", "two\n", "three\n"]);
}

#[tokio::test]
async fn test_unchanged_file_sends_nothing() {
    let tail = TestTail::new(b"existing\n");
    let sink = tail.recorder(1).await;
    let mut cycle = tail.cycle();

    let report = cycle.run_once().await.unwrap();

    assert_eq!(report.change, FileChange::Unchanged);
    assert_eq!(report.lines, 0);
    assert!(sink.received().is_empty());
    assert_eq!(cycle.file().last_offset(), 9);
}

#[tokio::test]
async fn test_partial_line_is_held_until_completed() {
    let tail = TestTail::new(b"");
    let sink = tail.recorder(1).await;
    let mut cycle = tail.cycle();

    tail.append(b"abc");
    let report = cycle.run_once().await.unwrap();
    assert_eq!(report.lines, 0);
    assert_eq!(cycle.file().last_offset(), 0);

    tail.append(b"def\n");
    cycle.run_once().await.unwrap();

    assert_eq!(sink.received(), vec!["abcdef\n"]);
    assert_eq!(cycle.file().last_offset(), 7);
}

#[tokio::test]
async fn test_large_growth_is_read_in_windows() {
    let tail = TestTail::new(b"");
    let sink = tail.recorder(1).await;
    let mut cycle = tail.cycle().with_max_read_bytes(16);

    let lines: Vec<String> = (0..20).map(|i| format!("line-{i:02}\n")).collect();
    tail.append(lines.concat().as_bytes());
    let report = cycle.run_once().await.unwrap();

    assert_eq!(report.lines, 20);
    assert!(report.windows > 1);
    assert_eq!(sink.received(), lines);
    assert_eq!(cycle.file().last_offset(), 160);
}

// ============================================================================
// Rotation Tests
// ============================================================================

#[tokio::test]
async fn test_replaced_file_is_read_from_the_start() {
    let initial = format!("{}\n", ".".repeat(999));
    let tail = TestTail::new(initial.as_bytes());
    let sink = tail.recorder(1).await;
    let mut cycle = tail.cycle();
    assert_eq!(cycle.file().last_offset(), 1000);

    fs::write(&tail.path, "x\n".repeat(100)).unwrap();
    let report = cycle.run_once().await.unwrap();

    assert_eq!(report.change, FileChange::Rotated);
    assert_eq!(report.lines, 100);
    let received = sink.received();
    assert_eq!(received.first().map(String::as_str), Some("x\n"));
    assert_eq!(cycle.file().last_offset(), 200);
    assert_eq!(cycle.file().last_known_size(), 200);
    assert_eq!(tail.stats.snapshot().rotations, 1);
}

#[tokio::test]
async fn test_truncated_file_then_grows_normally() {
    let tail = TestTail::new(b"old old old\n");
    let sink = tail.recorder(1).await;
    let mut cycle = tail.cycle();

    fs::write(&tail.path, b"").unwrap();
    let report = cycle.run_once().await.unwrap();
    assert_eq!(report.change, FileChange::Rotated);
    assert_eq!(report.lines, 0);

    tail.append(b"fresh\n");
    let report = cycle.run_once().await.unwrap();

    assert_eq!(report.change, FileChange::Grown);
    assert_eq!(sink.received(), vec!["fresh\n"]);
}

// ============================================================================
// Failure Tests
// ============================================================================

#[tokio::test]
async fn test_failing_subscriber_does_not_block_others() {
    let tail = TestTail::new(b"");
    tail.subscribe(1, Arc::new(FailingSink)).await;
    let healthy = tail.recorder(2).await;
    let mut cycle = tail.cycle();

    tail.append(b"a\nb\n");
    let report = cycle.run_once().await.unwrap();

    assert_eq!(report.lines, 2);
    assert_eq!(report.failed_deliveries, 2);
    assert_eq!(healthy.received(), vec!["a\n", "b\n"]);
    // Removal is the connection handler's job, not the broadcaster's.
    assert!(tail.registry.contains(SubscriberId::new(1)).await);
    assert_eq!(cycle.file().last_offset(), 4);

    let stats = tail.stats.snapshot();
    assert_eq!(stats.deliveries, 2);
    assert_eq!(stats.delivery_failures, 2);
}

#[tokio::test]
async fn test_removed_file_fails_cycle_and_keeps_state() {
    let tail = TestTail::new(b"start\n");
    let sink = tail.recorder(1).await;
    let mut cycle = tail.cycle();

    fs::remove_file(&tail.path).unwrap();
    let err = cycle.run_once().await.unwrap_err();

    assert!(matches!(err, CycleError::Tail(TailError::Open { .. })));
    assert!(sink.received().is_empty());
    assert_eq!(cycle.file().last_offset(), 6);
    assert_eq!(cycle.file().last_known_size(), 6);
}

#[tokio::test]
async fn test_recreated_file_after_failure_is_picked_up() {
    let tail = TestTail::new(b"0123456789\n");
    let sink = tail.recorder(1).await;
    let mut cycle = tail.cycle();

    fs::remove_file(&tail.path).unwrap();
    assert!(cycle.run_once().await.is_err());

    fs::write(&tail.path, b"back\n").unwrap();
    let report = cycle.run_once().await.unwrap();

    assert_eq!(report.change, FileChange::Rotated);
    assert_eq!(sink.received(), vec!["back\n"]);
}

// ============================================================================
// Concurrency Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_membership_churn_during_broadcast() {
    let tail = TestTail::new(b"");
    let steady = tail.recorder(1).await;
    let mut cycle = tail.cycle().with_max_read_bytes(64);

    let registry = tail.registry.clone();
    let churn = tokio::spawn(async move {
        for round in 0..200u64 {
            let id = SubscriberId::new(1_000 + round);
            let sink: Arc<dyn LineSink> = Arc::new(RecordingSink::default());
            let _ = registry.add(Subscriber::new(id, sink)).await;
            tokio::task::yield_now().await;
            registry.remove(id).await;
        }
    });

    let lines: Vec<String> = (0..200).map(|i| format!("{i}\n")).collect();
    tail.append(lines.concat().as_bytes());
    let report = cycle.run_once().await.unwrap();
    churn.await.unwrap();

    assert_eq!(report.lines, 200);
    assert_eq!(steady.received(), lines);
    assert_eq!(tail.registry.len().await, 1);
}

// ============================================================================
// Tail Loop Tests
// ============================================================================

#[tokio::test]
async fn test_tail_loop_delivers_on_poll_signals() {
    let tail = TestTail::new(b"before\n");
    let sink = tail.recorder(1).await;
    let cancel_token = CancellationToken::new();

    let detector = ChangeDetector::poll(Duration::from_millis(25), cancel_token.clone());
    let handle = spawn_tail(tail.cycle(), detector, cancel_token.clone());

    tail.append(b"first\n");
    assert_eq!(wait_for_lines(&sink, 1).await, vec!["first\n"]);

    tail.append(b"second\nthird\n");
    assert_eq!(
        wait_for_lines(&sink, 3).await,
        vec!["first\n", "second\n", "third\n"]
    );

    cancel_token.cancel();
    timeout(Duration::from_secs(1), handle)
        .await
        .expect("tail loop should stop on cancel")
        .unwrap();
}

#[tokio::test]
async fn test_tail_loop_survives_missing_file() {
    let tail = TestTail::new(b"");
    let sink = tail.recorder(1).await;
    let cancel_token = CancellationToken::new();

    let detector = ChangeDetector::poll(Duration::from_millis(25), cancel_token.clone());
    let handle = spawn_tail(tail.cycle(), detector, cancel_token.clone());

    fs::remove_file(&tail.path).unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished());
    assert!(tail.stats.snapshot().failed_cycles > 0);

    fs::write(&tail.path, b"again\n").unwrap();
    assert_eq!(wait_for_lines(&sink, 1).await, vec!["again\n"]);

    cancel_token.cancel();
    timeout(Duration::from_secs(1), handle)
        .await
        .expect("tail loop should stop on cancel")
        .unwrap();
}

#[tokio::test]
async fn test_event_loop_delivers_write_during_broadcast() {
    let tail = TestTail::new(b"");
    let sink = Arc::new(SlowSink::new(Duration::from_millis(400)));
    tail.subscribe(1, sink.clone()).await;
    let cancel_token = CancellationToken::new();

    let cycle = tail.cycle();
    let detector = ChangeDetector::watch(
        cycle.file().path(),
        Duration::from_millis(50),
        cancel_token.clone(),
    )
    .expect("watch log directory");
    let handle = spawn_tail(cycle, detector, cancel_token.clone());

    tail.append(b"a\n");
    // Lands while "a" is still being delivered.
    sleep(Duration::from_millis(200)).await;
    tail.append(b"b\n");

    assert_eq!(wait_for_lines(&sink.inner, 2).await, vec!["a\n", "b\n"]);

    cancel_token.cancel();
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("tail loop should stop on cancel")
        .unwrap();
}

#[tokio::test]
async fn test_event_loop_delivers_every_burst() {
    let tail = TestTail::new(b"");
    let sink = tail.recorder(1).await;
    let cancel_token = CancellationToken::new();

    let cycle = tail.cycle();
    let detector = ChangeDetector::watch(
        cycle.file().path(),
        Duration::from_millis(50),
        cancel_token.clone(),
    )
    .expect("watch log directory");
    let handle = spawn_tail(cycle, detector, cancel_token.clone());

    let mut expected = Vec::new();
    for burst in 0..5 {
        let lines: Vec<String> = (0..3).map(|i| format!("burst-{burst}-{i}\n")).collect();
        tail.append(lines.concat().as_bytes());
        expected.extend(lines);
        sleep(Duration::from_millis(30)).await;
    }

    assert_eq!(wait_for_lines(&sink, expected.len()).await, expected);

    cancel_token.cancel();
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("tail loop should stop on cancel")
        .unwrap();
}
