/// Book engine
///
/// One writer task owns the stream and the snapshot loader and is the only
/// code that mutates the book. Readers go through a cloneable `BookHandle`
/// and only ever see the book between whole messages: each message is gated
/// and applied under a single write lock, and a rebuilt book is swapped in
/// under the same lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::book_builder::{BookError, BookResult, BookState};
use crate::config::FeedConfig;
use crate::decoder::{FeedMessage, MessageBody};
use crate::error::{FeedError, FeedResult, Severity};
use crate::gap_detector::{Admission, SequenceGate};
use crate::recovery::{RecoveryManager, RestSnapshotLoader, SnapshotSource};
use crate::stats::FeedStats;
use crate::transport::{FeedTransport, Frame, StreamClient, WsTransport};
use crate::view::{top_n, BookView};

/// Ingestion status as seen by readers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedHealth {
    /// Connecting or waiting for the first snapshot
    Starting,
    /// Book is tracking the feed
    Live,
    /// Book may have diverged; a resync is pending or failed
    Stale,
    /// Transport failed; waiting to reconnect
    Reconnecting,
    Stopped,
}

struct Shared {
    book: RwLock<BookState>,
    health: Mutex<FeedHealth>,
    stats: Mutex<FeedStats>,
    view_depth: usize,
}

impl Shared {
    fn new(view_depth: usize) -> Self {
        Shared {
            book: RwLock::new(BookState::new()),
            health: Mutex::new(FeedHealth::Starting),
            stats: Mutex::new(FeedStats::new()),
            view_depth,
        }
    }

    fn book(&self) -> RwLockReadGuard<'_, BookState> {
        self.book.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn book_mut(&self) -> RwLockWriteGuard<'_, BookState> {
        self.book.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> MutexGuard<'_, FeedStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn health(&self) -> FeedHealth {
        *self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_health(&self, health: FeedHealth) {
        let mut current = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != health {
            debug!(from = ?*current, to = ?health, "feed health changed");
            *current = health;
        }
    }
}

/// Read-only access to the mirrored book
#[derive(Clone)]
pub struct BookHandle {
    shared: Arc<Shared>,
}

impl BookHandle {
    /// Top of book at the configured depth
    pub fn view(&self) -> BookResult<BookView> {
        self.view_depth(self.shared.view_depth)
    }

    /// A crossed book is only visible while the writer owes a resync,
    /// so health is never `Live` when this fails.
    pub fn view_depth(&self, depth: usize) -> BookResult<BookView> {
        let book = self.shared.book();
        let result = top_n(&book, depth);
        if let Err(e) = &result {
            let health = self.shared.health();
            debug_assert_ne!(health, FeedHealth::Live, "crossed book published as live");
            error!(error = %e, ?health, sequence = book.sequence(), "book failed the no-cross check");
        }
        result
    }

    /// Last applied sequence number
    pub fn sequence(&self) -> u64 {
        self.shared.book().sequence()
    }

    pub fn health(&self) -> FeedHealth {
        self.shared.health()
    }

    pub fn stats(&self) -> FeedStats {
        self.shared.stats().clone()
    }

    /// Run `f` against the book under the read lock
    pub fn read<R>(&self, f: impl FnOnce(&BookState) -> R) -> R {
        f(&self.shared.book())
    }
}

pub struct BookEngine<T, S> {
    config: FeedConfig,
    shared: Arc<Shared>,
    parts: Option<(StreamClient<T>, RecoveryManager<S>)>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl BookEngine<WsTransport, RestSnapshotLoader> {
    /// Engine over the WebSocket feed and REST snapshots named in `config`
    pub fn connect(config: FeedConfig) -> FeedResult<Self> {
        let loader = RestSnapshotLoader::new(&config.rest_url, config.snapshot_timeout())?;
        Self::new(config, WsTransport::new(), loader)
    }
}

impl<T, S> BookEngine<T, S>
where
    T: FeedTransport + 'static,
    S: SnapshotSource + 'static,
{
    pub fn new(config: FeedConfig, transport: T, source: S) -> FeedResult<Self> {
        config.validate()?;
        let client = StreamClient::new(transport, &config);
        let recovery = RecoveryManager::new(source, config.resync.clone());
        let (shutdown, _) = watch::channel(false);
        Ok(BookEngine {
            shared: Arc::new(Shared::new(config.view_depth)),
            config,
            parts: Some((client, recovery)),
            shutdown,
            task: None,
        })
    }

    pub fn handle(&self) -> BookHandle {
        BookHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Spawn the writer task. Must be called from within a tokio runtime.
    pub fn start(&mut self) -> FeedResult<()> {
        let (client, recovery) = self.parts.take().ok_or(FeedError::AlreadyStarted)?;
        let ingestor = Ingestor {
            client,
            recovery,
            gate: SequenceGate::new(),
            shared: Arc::clone(&self.shared),
            shutdown: self.shutdown.subscribe(),
            product_id: self.config.product_id.clone(),
            reconnect_delay: self.config.reconnect_delay(),
        };
        info!(product_id = %self.config.product_id, url = %self.config.ws_url, "starting book engine");
        self.task = Some(tokio::spawn(ingestor.run()));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Signal the writer task and wait for it to finish
    pub async fn stop(&mut self) {
        // send only fails when the task already exited
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "ingestion task ended abnormally");
            }
        }
        self.shared.set_health(FeedHealth::Stopped);
        self.shared.stats().log_summary();
    }
}

/// Resolves once shutdown is signalled or the engine is gone
async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// What the writer decided for one message, applied after the book lock is released
enum Outcome {
    Applied { sequence: u64, kind: &'static str },
    Ignored,
    Stale,
    Miss { sequence: u64, error: BookError },
    Violation { sequence: u64, error: BookError },
    Gap { missing: u64 },
    Forced,
}

/// The writer task: on_open / on_message / on_error / on_close
struct Ingestor<T, S> {
    client: StreamClient<T>,
    recovery: RecoveryManager<S>,
    gate: SequenceGate,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
    product_id: String,
    reconnect_delay: Duration,
}

impl<T: FeedTransport, S: SnapshotSource> Ingestor<T, S> {
    async fn run(mut self) {
        info!(product_id = %self.product_id, "ingestion task started");
        loop {
            match self.session().await {
                Ok(()) => break,
                Err(e) => self.on_error(&e),
            }
            self.on_close().await;
            if self.stopping() {
                break;
            }

            self.shared.set_health(FeedHealth::Reconnecting);
            self.shared.stats().record_reconnect();
            info!(delay = ?self.reconnect_delay, "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = wait_shutdown(&mut self.shutdown) => break,
            }
        }
        self.on_close().await;
        self.shared.set_health(FeedHealth::Stopped);
        info!(product_id = %self.product_id, "ingestion task stopped");
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// One connection's lifetime. `Ok` means shutdown was requested.
    async fn session(&mut self) -> FeedResult<()> {
        let subscribed = tokio::select! {
            result = self.client.subscribe() => result,
            _ = wait_shutdown(&mut self.shutdown) => return Ok(()),
        };
        subscribed?;
        self.on_open().await;

        loop {
            let frame = tokio::select! {
                result = self.client.receive() => result?,
                _ = wait_shutdown(&mut self.shutdown) => return Ok(()),
            };
            self.on_message(frame).await;
        }
    }

    async fn on_open(&mut self) {
        self.resync("subscribed").await;
    }

    async fn on_message(&mut self, frame: Frame) {
        self.shared.stats().record_message(frame.raw_len);
        let message = match frame.decoded {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, bytes = frame.raw_len, "dropping malformed message");
                self.shared.stats().record_malformed();
                return;
            }
        };

        let started = Instant::now();
        let outcome = self.process(message);
        let reason = self.record(outcome, started.elapsed());
        if let Some(reason) = reason {
            self.resync(reason).await;
        }
    }

    /// Gate and apply one message under a single write lock
    fn process(&mut self, message: FeedMessage) -> Outcome {
        let event = match message.body {
            MessageBody::Event(event) => Some(event),
            MessageBody::Error { message: text } => {
                error!(reason = %text, "feed reported an error");
                None
            }
            MessageBody::Other(kind) => {
                debug!(%kind, sequence = ?message.sequence, "message kind has no book effect");
                None
            }
            MessageBody::Subscriptions | MessageBody::Heartbeat => None,
        };

        let mut book = self.shared.book_mut();
        match self.gate.admit(&mut book, message.sequence) {
            Admission::Unsequenced => Outcome::Ignored,
            Admission::Stale { .. } => Outcome::Stale,
            Admission::Gap { expected, received } => Outcome::Gap {
                missing: received - expected,
            },
            Admission::Forced(_) => Outcome::Forced,
            Admission::InOrder(sequence) => {
                let Some(event) = event else {
                    return Outcome::Ignored;
                };
                match book.apply(&event).and_then(|()| book.check_no_cross()) {
                    Ok(()) => Outcome::Applied {
                        sequence,
                        kind: event.message_type().as_str(),
                    },
                    Err(error) if error.severity() == Severity::Recoverable => {
                        Outcome::Miss { sequence, error }
                    }
                    Err(error) => {
                        // readers must not see the diverged book as live
                        self.shared.set_health(FeedHealth::Stale);
                        Outcome::Violation { sequence, error }
                    }
                }
            }
        }
    }

    /// Update stats and health; returns a resync reason when one is due
    fn record(&self, outcome: Outcome, latency: Duration) -> Option<&'static str> {
        let mut stats = self.shared.stats();
        match outcome {
            Outcome::Applied { sequence, kind } => {
                debug!(sequence, kind, "applied");
                stats.record_applied(latency);
                None
            }
            Outcome::Ignored => {
                stats.record_ignored();
                None
            }
            Outcome::Stale => {
                stats.record_stale();
                None
            }
            Outcome::Miss { sequence, error } => {
                debug!(sequence, error = %error, "event references nothing on the book");
                stats.record_miss();
                None
            }
            Outcome::Violation { sequence, error } => {
                error!(sequence, error = %error, "protocol violation, book diverged");
                stats.record_violation();
                Some("protocol violation")
            }
            Outcome::Gap { missing } => {
                stats.record_gap(missing);
                drop(stats);
                self.shared.set_health(FeedHealth::Stale);
                Some("sequence gap")
            }
            Outcome::Forced => Some("previous resync failed"),
        }
    }

    /// Rebuild the book from a snapshot and swap it in.
    /// On failure the old book stays in place and the next sequenced
    /// message forces another attempt.
    async fn resync(&mut self, reason: &'static str) {
        info!(reason, sequence = self.shared.book().sequence(), "resyncing book from snapshot");
        let fetched = tokio::select! {
            result = self.recovery.fetch_book(&self.product_id) => result,
            _ = wait_shutdown(&mut self.shutdown) => return,
        };

        match fetched {
            Ok(book) => {
                let sequence = book.sequence();
                *self.shared.book_mut() = book;
                self.gate.cancel_resync();
                self.shared.stats().record_resync(true);
                self.shared.set_health(FeedHealth::Live);
                info!(reason, sequence, "book resynced");
            }
            Err(e) => {
                self.gate.request_resync();
                self.shared.stats().record_resync(false);
                self.shared.set_health(FeedHealth::Stale);
                warn!(
                    reason,
                    failed_attempts = self.recovery.failed_attempts(),
                    "resync failed, next sequenced message retries"
                );
                self.on_error(&FeedError::from(e));
            }
        }
    }

    fn on_error(&self, error: &FeedError) {
        match error.severity() {
            Severity::Recoverable => warn!(error = %error, "recoverable feed error"),
            Severity::Escalate => error!(
                error = %error,
                health = ?self.shared.health(),
                "feed error, book may be stale"
            ),
        }
    }

    async fn on_close(&mut self) {
        if let Err(e) = self.client.close().await {
            debug!(error = %e, "error while closing transport");
        }
    }
}
