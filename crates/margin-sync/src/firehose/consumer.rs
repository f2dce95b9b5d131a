//! The firehose consumer: hot path of the index.
//!
//! Frames are applied one at a time in arrival order. A frame that cannot be used is
//! logged, counted and skipped; nothing short of shutdown stops the loop. After each
//! frame the stream position advances to the frame's timestamp and is persisted, so a
//! restart resumes where the previous run stopped. The position never moves backwards.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use margin_config::FirehoseConfig;
use margin_index::{CursorStore, RecordIndex};
use margin_lexicon::{DecodeError, DecoderRegistry, RecordContext};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::event::{parse_frame, CommitEvent, FirehoseEvent, Operation};
use super::source::EventSource;
use crate::backoff::{Backoff, FixedBackoff};
use crate::error::IngestFailure;
use crate::limiter::{SyncLimiter, DEFAULT_SYNC_COOLDOWN};
use crate::scheduler::SyncTrigger;

/// Connection lifecycle of a [`FirehoseConsumer`], published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Subscribed,
    Processing,
}

#[derive(Debug, Default)]
struct ConsumerStats {
    applied: AtomicU64,
    deleted: AtomicU64,
    ignored: AtomicU64,
    malformed: AtomicU64,
    decode_failures: AtomicU64,
    index_failures: AtomicU64,
    cursor_failures: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of the consumer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub applied: u64,
    pub deleted: u64,
    pub ignored: u64,
    pub malformed: u64,
    pub decode_failures: u64,
    pub index_failures: u64,
    pub cursor_failures: u64,
    pub reconnects: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Configuration for the firehose consumer
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Key under which the stream position is persisted.
    pub subscription: String,
    /// Minimum time between two reconciliation requests for one identity.
    pub sync_cooldown: Duration,
    pub reconnect_delay: Duration,
    pub reconnect_jitter: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            subscription: margin_config::DEFAULT_SUBSCRIPTION.to_string(),
            sync_cooldown: DEFAULT_SYNC_COOLDOWN,
            reconnect_delay: Duration::from_secs(5),
            reconnect_jitter: Duration::ZERO,
        }
    }
}

impl From<&FirehoseConfig> for ConsumerConfig {
    fn from(config: &FirehoseConfig) -> Self {
        Self {
            subscription: config.subscription.clone(),
            sync_cooldown: Duration::from_secs(config.sync_cooldown_secs),
            reconnect_delay: Duration::from_secs(config.reconnect_delay_secs),
            reconnect_jitter: Duration::from_millis(config.reconnect_jitter_ms),
        }
    }
}

/// Applies firehose commits to the index and persists the stream position.
pub struct FirehoseConsumer {
    source: Arc<dyn EventSource>,
    index: Arc<dyn RecordIndex>,
    cursors: Arc<dyn CursorStore>,
    registry: Arc<DecoderRegistry>,
    collections: Vec<String>,
    subscription: String,
    trigger: Option<Arc<dyn SyncTrigger>>,
    limiter: SyncLimiter,
    backoff: Arc<dyn Backoff>,
    failures: Option<mpsc::UnboundedSender<IngestFailure>>,
    position: AtomicI64,
    state: watch::Sender<ConsumerState>,
    stats: ConsumerStats,
}

impl FirehoseConsumer {
    /// Create a new consumer reading `source` and writing into `index`.
    ///
    /// Only collections known to `registry` are requested from the stream.
    pub fn new(
        source: Arc<dyn EventSource>,
        index: Arc<dyn RecordIndex>,
        cursors: Arc<dyn CursorStore>,
        registry: Arc<DecoderRegistry>,
        config: ConsumerConfig,
    ) -> Self {
        let collections = registry.collections().map(str::to_string).collect();
        let backoff =
            FixedBackoff::new(config.reconnect_delay).with_jitter(config.reconnect_jitter);
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        Self {
            source,
            index,
            cursors,
            registry,
            collections,
            subscription: config.subscription,
            trigger: None,
            limiter: SyncLimiter::new(config.sync_cooldown),
            backoff: Arc::new(backoff),
            failures: None,
            position: AtomicI64::new(0),
            state,
            stats: ConsumerStats::default(),
        }
    }

    /// Hand identities seen on the stream to a reconciliation scheduler.
    pub fn with_sync_trigger(mut self, trigger: Arc<dyn SyncTrigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Replace the reconnect delay strategy built from the configuration.
    pub fn with_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Receive every non-fatal failure in addition to the log line.
    pub fn with_failure_channel(mut self, failures: mpsc::UnboundedSender<IngestFailure>) -> Self {
        self.failures = Some(failures);
        self
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Current connection state.
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Last stream position applied, if any.
    pub fn position(&self) -> Option<i64> {
        match self.position.load(Ordering::SeqCst) {
            0 => None,
            position => Some(position),
        }
    }

    /// Snapshot of the ingestion counters.
    pub fn stats(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            applied: load(&self.stats.applied),
            deleted: load(&self.stats.deleted),
            ignored: load(&self.stats.ignored),
            malformed: load(&self.stats.malformed),
            decode_failures: load(&self.stats.decode_failures),
            index_failures: load(&self.stats.index_failures),
            cursor_failures: load(&self.stats.cursor_failures),
            reconnects: load(&self.stats.reconnects),
        }
    }

    /// Consume the stream until `shutdown` fires, reconnecting after every failure.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.restore_position();
        let mut attempt: u32 = 0;

        while !shutdown.is_cancelled() {
            self.state.send_replace(ConsumerState::Connecting);
            let cursor = self.position();
            let subscribe = self.source.subscribe(&self.collections, cursor);
            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                connected = subscribe => connected,
            };

            match connected {
                Ok(mut frames) => {
                    info!(cursor, subscription = %self.subscription, "subscribed to firehose");
                    self.state.send_replace(ConsumerState::Subscribed);
                    attempt = 0;
                    loop {
                        let next = tokio::select! {
                            _ = shutdown.cancelled() => None,
                            next = frames.next() => next,
                        };
                        match next {
                            Some(Ok(text)) => {
                                self.state.send_replace(ConsumerState::Processing);
                                self.handle_frame(&text);
                                self.state.send_replace(ConsumerState::Subscribed);
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "firehose stream failed");
                                self.report(IngestFailure::Connect { error: e });
                                break;
                            }
                            None => {
                                debug!("firehose stream ended");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to connect to firehose");
                    self.report(IngestFailure::Connect { error: e });
                }
            }

            self.state.send_replace(ConsumerState::Disconnected);
            if shutdown.is_cancelled() {
                break;
            }
            bump(&self.stats.reconnects);
            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(?delay, attempt, "reconnecting to firehose");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.send_replace(ConsumerState::Disconnected);
        info!(position = self.position(), "firehose consumer stopped");
    }

    fn restore_position(&self) {
        match self.cursors.load_cursor(&self.subscription) {
            Ok(Some(cursor)) => {
                self.position.fetch_max(cursor, Ordering::SeqCst);
                info!(cursor, "resuming firehose from stored cursor");
            }
            Ok(None) => info!("no stored cursor, starting from live"),
            Err(e) => warn!(error = %e, "failed to load cursor, starting from live"),
        }
    }

    /// Apply one raw frame. Never fails; problems are logged and counted.
    pub fn handle_frame(&self, text: &str) {
        let event = match parse_frame(text) {
            Ok(event) => event,
            Err(e) => {
                bump(&self.stats.malformed);
                debug!(error = %e, "skipping malformed frame");
                self.report(IngestFailure::MalformedFrame {
                    reason: e.to_string(),
                });
                return;
            }
        };

        match &event {
            FirehoseEvent::Commit(commit) => self.apply_commit(commit),
            FirehoseEvent::Other { .. } => bump(&self.stats.ignored),
        }
        self.advance(event.time_us());
    }

    fn apply_commit(&self, commit: &CommitEvent) {
        if !self.registry.handles(&commit.collection) {
            bump(&self.stats.ignored);
            return;
        }
        let uri = commit.uri();

        match commit.operation {
            Operation::Delete => match self.index.delete(&uri) {
                Ok(existed) => {
                    bump(&self.stats.deleted);
                    debug!(uri = %uri, existed, "deleted record");
                }
                Err(e) => {
                    bump(&self.stats.index_failures);
                    warn!(uri = %uri, error = %e, "failed to delete record");
                    self.report(IngestFailure::Index {
                        uri,
                        message: e.to_string(),
                    });
                }
            },
            Operation::Create | Operation::Update => {
                self.request_sync(&commit.did);
                self.apply_write(commit, uri);
            }
        }
    }

    fn apply_write(&self, commit: &CommitEvent, uri: String) {
        let Some(value) = &commit.record else {
            self.decode_failed(
                uri,
                DecodeError::MissingRecord {
                    operation: commit.operation.as_str().to_string(),
                },
            );
            return;
        };

        let ctx = RecordContext::new(&commit.did, &commit.collection, &commit.rkey, commit.cid.as_deref());
        match self.registry.decode(&ctx, value) {
            Ok(Some(record)) => match self.index.upsert(&record) {
                Ok(()) => {
                    bump(&self.stats.applied);
                    debug!(uri = %uri, kind = record.kind().as_str(), "indexed record");
                }
                Err(e) => {
                    bump(&self.stats.index_failures);
                    warn!(uri = %uri, error = %e, "failed to index record");
                    self.report(IngestFailure::Index {
                        uri,
                        message: e.to_string(),
                    });
                }
            },
            Ok(None) => bump(&self.stats.ignored),
            Err(e) => self.decode_failed(uri, e),
        }
    }

    fn decode_failed(&self, uri: String, error: DecodeError) {
        bump(&self.stats.decode_failures);
        warn!(uri = %uri, error = %error, "skipping undecodable record");
        self.report(IngestFailure::Decode { uri, error });
    }

    fn request_sync(&self, did: &str) {
        if let Some(trigger) = &self.trigger {
            if self.limiter.should_sync(did) {
                debug!(did, "requesting reconciliation");
                trigger.request_sync(did);
            }
        }
    }

    fn advance(&self, time_us: i64) {
        if time_us <= 0 {
            return;
        }
        let previous = self.position.fetch_max(time_us, Ordering::SeqCst);
        if time_us <= previous {
            return;
        }
        if let Err(e) = self.cursors.save_cursor(&self.subscription, time_us) {
            bump(&self.stats.cursor_failures);
            warn!(cursor = time_us, error = %e, "failed to persist cursor");
            self.report(IngestFailure::Cursor {
                cursor: time_us,
                message: e.to_string(),
            });
        }
    }

    fn report(&self, failure: IngestFailure) {
        if let Some(failures) = &self.failures {
            let _ = failures.send(failure);
        }
    }
}
