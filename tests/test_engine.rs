/// Engine tests against an in-memory feed and scripted snapshots

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use book_feed::{
    BookEngine, BookError, BookHandle, FeedConfig, FeedError, FeedHealth, FeedTransport, ResyncPolicy,
    Snapshot, SnapshotEntry, SnapshotError, SnapshotSource, TransportError,
};
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tracing_subscriber::EnvFilter;

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Frames pushed by the test through a channel; survives reconnects
struct ChannelTransport {
    rx: mpsc::UnboundedReceiver<String>,
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl FeedTransport for ChannelTransport {
    async fn connect(&mut self, _url: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn next_text(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
struct Snapshots(Arc<Mutex<VecDeque<Result<Snapshot, SnapshotError>>>>);

impl Snapshots {
    fn push(&self, snapshot: Snapshot) {
        self.0.lock().unwrap().push_back(Ok(snapshot));
    }

    fn push_failure(&self, status: u16) {
        self.0.lock().unwrap().push_back(Err(SnapshotError::Status { status }));
    }
}

#[async_trait]
impl SnapshotSource for Snapshots {
    async fn fetch(&self, _product_id: &str) -> Result<Snapshot, SnapshotError> {
        self.0
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(SnapshotError::Status { status: 503 }))
    }
}

fn entries(list: &[(&str, &str, &str)]) -> Vec<SnapshotEntry> {
    list.iter()
        .map(|(price, size, id)| SnapshotEntry::new(dec(price), dec(size), *id))
        .collect()
}

fn snapshot(sequence: u64, bids: &[(&str, &str, &str)], asks: &[(&str, &str, &str)]) -> Snapshot {
    Snapshot {
        sequence,
        bids: entries(bids),
        asks: entries(asks),
    }
}

struct Harness {
    engine: BookEngine<ChannelTransport, Snapshots>,
    handle: BookHandle,
    feed: mpsc::UnboundedSender<String>,
    snapshots: Snapshots,
    sent: Arc<Mutex<Vec<String>>>,
}

fn test_config(max_attempts: u32) -> FeedConfig {
    FeedConfig {
        product_id: "ETH-USD".to_string(),
        reconnect_delay_ms: 10,
        resync: ResyncPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
        ..FeedConfig::default()
    }
}

impl Harness {
    fn new(max_attempts: u32) -> Self {
        init_tracing();
        let (feed, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let snapshots = Snapshots::default();
        let transport = ChannelTransport {
            rx,
            sent: Arc::clone(&sent),
        };
        let engine =
            BookEngine::new(test_config(max_attempts), transport, snapshots.clone()).unwrap();
        let handle = engine.handle();
        Harness {
            engine,
            handle,
            feed,
            snapshots,
            sent,
        }
    }

    fn send(&self, value: serde_json::Value) {
        self.feed.send(value.to_string()).unwrap();
    }

    fn send_raw(&self, line: &str) {
        self.feed.send(line.to_string()).unwrap();
    }

    fn ack(&self) {
        self.send(json!({"type": "subscriptions", "channels": [{"name": "full", "product_ids": ["ETH-USD"]}]}));
    }

    fn open(&self, sequence: u64, id: &str, side: &str, price: &str, size: &str) {
        self.send(json!({
            "type": "open", "sequence": sequence, "order_id": id,
            "side": side, "price": price, "remaining_size": size,
        }));
    }

    async fn eventually(&self, what: &str, check: impl Fn(&BookHandle) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check(&self.handle) {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Start, acknowledge the subscription and wait for the initial resync
    async fn start_live(&mut self, first: Snapshot) {
        let sequence = first.sequence;
        self.snapshots.push(first);
        self.engine.start().unwrap();
        self.ack();
        self.eventually("initial resync", |h| {
            h.health() == FeedHealth::Live && h.sequence() == sequence
        })
        .await;
    }
}

#[tokio::test]
async fn test_initial_resync_then_in_order_updates() {
    let mut h = Harness::new(3);
    h.start_live(snapshot(10, &[("100.00", "5", "o1")], &[("101.00", "2", "o9")]))
        .await;

    let sent: serde_json::Value = serde_json::from_str(&h.sent.lock().unwrap()[0]).unwrap();
    assert_eq!(
        sent,
        json!({"type": "subscribe", "product_ids": ["ETH-USD"], "channels": ["full"]})
    );

    // queued from before the snapshot
    h.open(9, "old", "buy", "100.00", "7");
    h.open(11, "o2", "buy", "100.00", "3");
    h.eventually("in-order open", |h| h.sequence() == 11).await;

    let view = h.handle.view().unwrap();
    assert_eq!(view.bids, vec![(dec("100.00"), dec("8"))]);
    assert_eq!(view.asks, vec![(dec("101.00"), dec("2"))]);
    assert!(h.handle.read(|book| !book.bids().contains("old")));

    let stats = h.handle.stats();
    assert_eq!(stats.resyncs(), 1);
    assert_eq!(stats.stale(), 1);
    assert_eq!(stats.applied(), 1);

    h.engine.stop().await;
    assert_eq!(h.handle.health(), FeedHealth::Stopped);
}

#[tokio::test]
async fn test_gap_triggers_resync() {
    let mut h = Harness::new(3);
    h.start_live(snapshot(10, &[], &[])).await;
    h.snapshots.push(snapshot(20, &[("99.5", "1", "s1")], &[]));

    // 11 is lost
    h.open(12, "never", "sell", "105", "1");
    h.eventually("gap resync", |h| h.sequence() == 20).await;
    h.eventually("live after resync", |h| h.health() == FeedHealth::Live).await;

    assert!(h.handle.read(|book| !book.asks().contains("never")));
    let view = h.handle.view().unwrap();
    assert_eq!(view.bids, vec![(dec("99.5"), dec("1"))]);

    let stats = h.handle.stats();
    assert_eq!(stats.gap_events(), 1);
    assert_eq!(stats.missing_sequences(), 1);
    assert_eq!(stats.resyncs(), 2);

    h.open(21, "n1", "sell", "101", "4");
    h.eventually("post-resync update", |h| h.sequence() == 21).await;
    assert_eq!(h.handle.view().unwrap().asks, vec![(dec("101"), dec("4"))]);

    h.engine.stop().await;
}

#[tokio::test]
async fn test_failed_resync_leaves_book_stale_until_next_message() {
    let mut h = Harness::new(1);
    h.start_live(snapshot(5, &[("10", "1", "keep")], &[])).await;
    h.snapshots.push_failure(502);

    h.open(7, "x", "buy", "11", "1");
    h.eventually("stale after failed resync", |h| {
        h.health() == FeedHealth::Stale && h.stats().failed_resyncs() == 1
    })
    .await;
    // old book stays readable, sequence sits at the gap marker
    assert_eq!(h.handle.sequence(), 7);
    assert!(h.handle.read(|book| book.bids().contains("keep")));

    h.snapshots.push(snapshot(30, &[("12", "2", "fresh")], &[]));
    h.send(json!({"type": "heartbeat", "sequence": 8}));
    h.eventually("forced resync", |h| h.sequence() == 30).await;
    h.eventually("live again", |h| h.health() == FeedHealth::Live).await;
    assert!(h.handle.read(|book| book.bids().contains("fresh") && !book.bids().contains("keep")));

    h.engine.stop().await;
}

#[tokio::test]
async fn test_protocol_violation_triggers_resync() {
    let mut h = Harness::new(3);
    h.start_live(snapshot(1, &[("10", "1", "a")], &[])).await;
    h.snapshots.push(snapshot(50, &[("10", "3", "a")], &[]));

    h.send(json!({
        "type": "change", "reason": "STP", "sequence": 2, "order_id": "a",
        "side": "buy", "old_size": "2", "new_size": "1", "price": "10",
    }));
    h.eventually("resync after violation", |h| h.sequence() == 50).await;

    let stats = h.handle.stats();
    assert_eq!(stats.violations(), 1);
    assert_eq!(h.handle.view().unwrap().bids, vec![(dec("10"), dec("3"))]);

    h.engine.stop().await;
}

#[tokio::test]
async fn test_crossing_update_is_caught() {
    let mut h = Harness::new(3);
    h.start_live(snapshot(1, &[("10", "1", "b")], &[("11", "1", "s")])).await;
    h.snapshots.push(snapshot(9, &[("10", "1", "b")], &[("11", "1", "s")]));

    h.open(2, "x", "sell", "9", "1");
    h.eventually("resync after crossed book", |h| h.sequence() == 9).await;
    assert_eq!(h.handle.stats().violations(), 1);
    assert!(h.handle.view().is_ok());

    h.engine.stop().await;
}

#[tokio::test]
async fn test_crossed_snapshot_is_rejected() {
    let mut h = Harness::new(1);
    h.snapshots.push(snapshot(10, &[("101", "1", "b")], &[("100", "1", "s")]));
    h.engine.start().unwrap();
    h.ack();

    h.eventually("failed initial resync", |h| h.stats().failed_resyncs() == 1)
        .await;
    assert_eq!(h.handle.health(), FeedHealth::Stale);
    assert_eq!(h.handle.stats().resyncs(), 0);
    // the empty book was kept, so readers still get a valid view
    assert_eq!(h.handle.sequence(), 0);
    assert!(h.handle.view().unwrap().is_empty());

    h.snapshots.push(snapshot(20, &[("99", "1", "b")], &[("100", "1", "s")]));
    h.send(json!({"type": "heartbeat", "sequence": 12}));
    h.eventually("forced resync", |h| {
        h.health() == FeedHealth::Live && h.sequence() == 20
    })
    .await;
    assert_eq!(h.handle.view().unwrap().bids, vec![(dec("99"), dec("1"))]);

    h.engine.stop().await;
}

/// Hands out the first snapshot at once and holds every later fetch
/// until `release` is notified
struct HeldSnapshots {
    first: Mutex<Option<Snapshot>>,
    later: Mutex<Option<Snapshot>>,
    release: Arc<Notify>,
}

#[async_trait]
impl SnapshotSource for HeldSnapshots {
    async fn fetch(&self, _product_id: &str) -> Result<Snapshot, SnapshotError> {
        let first = self.first.lock().unwrap().take();
        if let Some(snapshot) = first {
            return Ok(snapshot);
        }
        self.release.notified().await;
        let later = self.later.lock().unwrap().take();
        later.ok_or(SnapshotError::Status { status: 503 })
    }
}

#[tokio::test]
async fn test_crossed_book_is_never_live() {
    init_tracing();
    let (feed, rx) = mpsc::unbounded_channel();
    let transport = ChannelTransport {
        rx,
        sent: Arc::default(),
    };
    let release = Arc::new(Notify::new());
    let source = HeldSnapshots {
        first: Mutex::new(Some(snapshot(1, &[("10", "1", "b")], &[("11", "1", "s")]))),
        later: Mutex::new(Some(snapshot(5, &[("10", "2", "b")], &[("11", "1", "s")]))),
        release: Arc::clone(&release),
    };
    let mut engine = BookEngine::new(test_config(1), transport, source).unwrap();
    let handle = engine.handle();
    engine.start().unwrap();

    let send = |value: serde_json::Value| feed.send(value.to_string()).unwrap();
    send(json!({"type": "subscriptions", "channels": []}));
    let deadline = Instant::now() + Duration::from_secs(5);
    while !(handle.health() == FeedHealth::Live && handle.sequence() == 1) {
        assert!(Instant::now() < deadline, "timed out waiting for initial resync");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // crossing open; the writer is then parked in the held resync
    send(json!({
        "type": "open", "sequence": 2, "order_id": "x",
        "side": "sell", "price": "9", "remaining_size": "1",
    }));
    while handle.stats().violations() == 0 {
        assert!(Instant::now() < deadline, "timed out waiting for the violation");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(handle.health(), FeedHealth::Stale);
    assert!(matches!(handle.view(), Err(BookError::Crossed { .. })));

    release.notify_one();
    while !(handle.health() == FeedHealth::Live && handle.sequence() == 5) {
        assert!(Instant::now() < deadline, "timed out waiting for the resync");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(handle.view().unwrap().bids, vec![(dec("10"), dec("2"))]);

    engine.stop().await;
}

/// Never answers
struct StuckSnapshots;

#[async_trait]
impl SnapshotSource for StuckSnapshots {
    async fn fetch(&self, _product_id: &str) -> Result<Snapshot, SnapshotError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_stop_during_snapshot_fetch() {
    init_tracing();
    let (feed, rx) = mpsc::unbounded_channel();
    let transport = ChannelTransport {
        rx,
        sent: Arc::default(),
    };
    let mut engine = BookEngine::new(test_config(3), transport, StuckSnapshots).unwrap();
    let handle = engine.handle();
    engine.start().unwrap();
    feed.send(json!({"type": "subscriptions", "channels": []}).to_string())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.health(), FeedHealth::Starting);

    tokio::time::timeout(Duration::from_secs(1), engine.stop())
        .await
        .expect("stop hung on a pending snapshot fetch");
    assert_eq!(handle.health(), FeedHealth::Stopped);
    assert!(!engine.is_running());
}

#[tokio::test]
async fn test_stop_during_subscribe_handshake() {
    let mut h = Harness::new(3);
    h.engine.start().unwrap();
    // no acknowledgment ever arrives
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.sent.lock().unwrap().len(), 1);

    tokio::time::timeout(Duration::from_secs(1), h.engine.stop())
        .await
        .expect("stop hung on the subscribe handshake");
    assert_eq!(h.handle.health(), FeedHealth::Stopped);
    assert_eq!(h.handle.stats().resyncs(), 0);
}

#[tokio::test]
async fn test_malformed_and_unknown_messages_are_skipped() {
    let mut h = Harness::new(3);
    h.start_live(snapshot(3, &[], &[])).await;

    h.send_raw("{not json");
    h.send(json!({"type": "received", "sequence": 4, "order_id": "r"}));
    h.send(json!({"type": "done", "sequence": 5, "order_id": "ghost", "side": "buy", "reason": "canceled"}));
    h.open(6, "a", "buy", "10", "1");
    h.eventually("open applied", |h| h.sequence() == 6).await;

    let stats = h.handle.stats();
    assert_eq!(stats.malformed(), 1);
    assert_eq!(stats.ignored(), 1);
    assert_eq!(stats.misses(), 1);
    assert_eq!(stats.applied(), 1);
    assert_eq!(stats.gap_events(), 0);
    assert_eq!(h.handle.health(), FeedHealth::Live);

    h.engine.stop().await;
}

#[tokio::test]
async fn test_rejected_subscription_reconnects() {
    let mut h = Harness::new(3);
    h.snapshots.push(snapshot(4, &[], &[]));
    h.engine.start().unwrap();

    h.send(json!({"type": "error", "message": "Failed to subscribe", "reason": "product not found"}));
    h.eventually("reconnect", |h| h.stats().reconnects() == 1).await;

    h.ack();
    h.eventually("live after reconnect", |h| {
        h.health() == FeedHealth::Live && h.sequence() == 4
    })
    .await;
    assert_eq!(h.sent.lock().unwrap().len(), 2);

    h.engine.stop().await;
}

#[tokio::test]
async fn test_start_twice_and_stop() {
    let mut h = Harness::new(3);
    h.start_live(snapshot(1, &[], &[])).await;
    assert!(h.engine.is_running());
    assert!(matches!(h.engine.start(), Err(FeedError::AlreadyStarted)));

    h.engine.stop().await;
    assert!(!h.engine.is_running());
    assert_eq!(h.handle.health(), FeedHealth::Stopped);
}

#[test]
fn test_invalid_config_is_rejected() {
    let (_feed, rx) = mpsc::unbounded_channel();
    let transport = ChannelTransport {
        rx,
        sent: Arc::default(),
    };
    let config = FeedConfig::default().with_product("");
    assert!(matches!(
        BookEngine::new(config, transport, Snapshots::default()),
        Err(FeedError::Config(_))
    ));
}
