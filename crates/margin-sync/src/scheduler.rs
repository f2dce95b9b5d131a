//! Background scheduling of reconciliation passes.
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use margin_config::SyncConfig;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::crawler::{Crawler, SyncResult};
use crate::error::SyncError;
use crate::xrpc::RepoClientFactory;

/// Receives "this identity changed" hints from the firehose.
pub trait SyncTrigger: Send + Sync {
    /// Request a reconciliation pass for `did`. Must not block.
    fn request_sync(&self, did: &str);
}

/// Configuration for the sync scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of concurrent sync operations
    pub max_concurrent_syncs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_syncs: 3,
        }
    }
}

impl From<&SyncConfig> for SchedulerConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_concurrent_syncs: config.max_concurrent_syncs.max(1),
        }
    }
}

/// Runs crawler passes in the background, at most `max_concurrent_syncs` at a time and
/// at most one per identity.
pub struct SyncScheduler {
    crawler: Arc<Crawler>,
    clients: Arc<dyn RepoClientFactory>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl SyncScheduler {
    /// Create a new scheduler driving `crawler`. Shutting it down cancels the
    /// crawler's token.
    pub fn new(
        crawler: Arc<Crawler>,
        clients: Arc<dyn RepoClientFactory>,
        config: SchedulerConfig,
    ) -> Self {
        let cancel = crawler.cancellation().clone();
        Self {
            crawler,
            clients,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_syncs.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Queue a pass for `did`. Returns `false` when one is already queued or running,
    /// or the scheduler is shutting down.
    pub fn spawn_sync(&self, did: &str) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if !self.in_flight.lock().insert(did.to_string()) {
            debug!(did, "sync already in flight");
            return false;
        }

        let crawler = self.crawler.clone();
        let clients = self.clients.clone();
        let semaphore = self.semaphore.clone();
        let in_flight = self.in_flight.clone();
        let cancel = self.cancel.clone();
        let did = did.to_string();

        self.tracker.spawn(async move {
            let permit = tokio::select! {
                _ = cancel.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };
            if let Some(_permit) = permit {
                match crawler.perform_sync(&did, clients.as_ref()).await {
                    Ok(results) => log_results(&did, &results),
                    Err(e) => error!("Failed to sync {}: {}", did, e),
                }
            }
            in_flight.lock().remove(&did);
        });
        true
    }

    /// Run a pass for `did` on the caller's task, still bounded by the concurrency limit.
    pub async fn sync_now(&self, did: &str) -> Result<BTreeMap<String, SyncResult>, SyncError> {
        let _permit = self.semaphore.acquire().await.ok();
        self.crawler.perform_sync(did, self.clients.as_ref()).await
    }

    /// Number of identities with a queued or running pass.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Cancel running passes and wait for every spawned task to finish.
    pub async fn shutdown(&self) {
        info!("Stopping sync scheduler");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl SyncTrigger for SyncScheduler {
    fn request_sync(&self, did: &str) {
        self.spawn_sync(did);
    }
}

fn log_results(did: &str, results: &BTreeMap<String, SyncResult>) {
    for (collection, result) in results {
        if !result.is_ok() {
            warn!(
                did,
                collection = collection.as_str(),
                error = result.error.as_deref().unwrap_or_default(),
                "collection left unreconciled"
            );
        } else if result.index_failures > 0 {
            warn!(
                did,
                collection = collection.as_str(),
                failures = result.index_failures,
                "collection reconciled with index failures"
            );
        }
    }
}
