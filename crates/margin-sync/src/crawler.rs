//! Reconciliation crawler.
//!
//! A pass walks every tracked collection of one identity's repository, verifies each
//! listed record against its CID, upserts whatever changed, then deletes local records
//! the listing no longer contains. Collections are reconciled independently: a failure
//! in one is reported in its [`SyncResult`] and never blocks the others.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use margin_config::{SyncConfig, UnverifiedPolicy, MAX_PAGE_LIMIT};
use margin_index::{IndexError, RecordIndex};
use margin_lexicon::{AtUri, DecoderRegistry, RecordContext};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ListingError, SyncError};
use crate::xrpc::{ListedRecord, RepoClientFactory, RepoLister};

/// Outcome of reconciling one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub upserted: usize,
    pub deleted: usize,
    /// Listed records that failed verification or decoding.
    pub skipped: usize,
    /// Local upserts or deletions the index rejected.
    pub index_failures: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResult {
    fn failed(error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    /// Whether the collection was fully listed. Index failures do not clear this.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, thiserror::Error)]
enum CollectionError {
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Listing(#[from] ListingError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlerConfig {
    /// Records requested per `listRecords` page.
    pub page_limit: u32,
    /// What to do with a listed record whose CID does not match.
    pub unverified_policy: UnverifiedPolicy,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            page_limit: MAX_PAGE_LIMIT,
            unverified_policy: UnverifiedPolicy::Exclude,
        }
    }
}

impl From<&SyncConfig> for CrawlerConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            page_limit: config.page_limit.clamp(1, MAX_PAGE_LIMIT),
            unverified_policy: config.unverified_policy,
        }
    }
}

/// Brings the local index in line with what each repository actually holds.
pub struct Crawler {
    index: Arc<dyn RecordIndex>,
    registry: Arc<DecoderRegistry>,
    config: CrawlerConfig,
    cancel: CancellationToken,
}

/// Per-collection bookkeeping for one pass.
#[derive(Default)]
struct Pass {
    fetched: HashSet<String>,
    upserted: usize,
    skipped: usize,
    index_failures: usize,
}

impl Crawler {
    /// Create a new crawler writing into `index`, reconciling every collection `registry` knows.
    pub fn new(
        index: Arc<dyn RecordIndex>,
        registry: Arc<DecoderRegistry>,
        config: CrawlerConfig,
    ) -> Self {
        Self {
            index,
            registry,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the token that aborts in-flight passes.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts in-flight passes when cancelled.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Reconcile every tracked collection of `did`, keyed by collection NSID.
    pub async fn perform_sync(
        &self,
        did: &str,
        clients: &dyn RepoClientFactory,
    ) -> Result<BTreeMap<String, SyncResult>, SyncError> {
        let client = clients
            .client_for(did)
            .await
            .map_err(|source| SyncError::Client {
                did: did.to_string(),
                source,
            })?;

        info!(did, collections = self.registry.len(), "starting reconciliation");
        let mut results = BTreeMap::new();
        for collection in self.registry.collections() {
            let result = match self.sync_collection(did, collection, client.as_ref()).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(did, collection, error = %e, "collection reconciliation failed");
                    SyncResult::failed(e)
                }
            };
            results.insert(collection.to_string(), result);
        }

        let upserted: usize = results.values().map(|r| r.upserted).sum();
        let deleted: usize = results.values().map(|r| r.deleted).sum();
        let failed = results.values().filter(|r| !r.is_ok()).count();
        info!(did, upserted, deleted, failed, "reconciliation finished");
        Ok(results)
    }

    async fn sync_collection(
        &self,
        did: &str,
        collection: &str,
        client: &dyn RepoLister,
    ) -> Result<SyncResult, CollectionError> {
        // Snapshot before listing so records the firehose adds mid-pass are never
        // candidates for deletion.
        let known = self.index.records_for_author(did, collection)?;
        let mut pass = Pass::default();
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();

        loop {
            if self.cancel.is_cancelled() {
                return Err(CollectionError::Cancelled);
            }
            let page = tokio::select! {
                _ = self.cancel.cancelled() => return Err(CollectionError::Cancelled),
                page = client.list_records(did, collection, self.config.page_limit, cursor.as_deref()) => page?,
            };
            debug!(did, collection, records = page.records.len(), "fetched page");

            for record in &page.records {
                self.apply_listed(did, collection, record, &known, &mut pass);
            }

            let Some(next) = page.cursor.filter(|next| !next.is_empty()) else {
                break;
            };
            if !seen.insert(next.clone()) {
                return Err(ListingError::CursorCycle {
                    collection: collection.to_string(),
                    cursor: next,
                }
                .into());
            }
            cursor = Some(next);
        }

        if self.cancel.is_cancelled() {
            return Err(CollectionError::Cancelled);
        }

        let mut deleted = 0;
        for uri in known.keys().filter(|uri| !pass.fetched.contains(*uri)) {
            match self.index.delete(uri) {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(uri = %uri, error = %e, "failed to delete stale record");
                    pass.index_failures += 1;
                }
            }
        }

        Ok(SyncResult {
            upserted: pass.upserted,
            deleted,
            skipped: pass.skipped,
            index_failures: pass.index_failures,
            error: None,
        })
    }

    fn apply_listed(
        &self,
        did: &str,
        collection: &str,
        listed: &ListedRecord,
        known: &HashMap<String, Option<String>>,
        pass: &mut Pass,
    ) {
        let uri = match AtUri::parse(&listed.uri) {
            Some(uri) if uri.did == did && uri.collection == collection => uri,
            _ => {
                warn!(uri = %listed.uri, did, collection, "listing returned a foreign record uri");
                pass.skipped += 1;
                return;
            }
        };
        let key = uri.to_string();
        let claimed = listed.cid.as_deref().unwrap_or_default();

        if let Err(e) = margin_cid::verify_value(&listed.value, claimed, &key) {
            warn!(uri = %key, error = %e, "integrity check failed, not indexing");
            self.reject(key, pass);
            return;
        }

        if !claimed.is_empty() && known.get(&key).and_then(|c| c.as_deref()) == Some(claimed) {
            pass.fetched.insert(key);
            return;
        }

        let ctx = RecordContext::new(&uri.did, &uri.collection, &uri.rkey, listed.cid.as_deref());
        match self.registry.decode(&ctx, &listed.value) {
            Ok(Some(record)) => {
                match self.index.upsert(&record) {
                    Ok(()) => pass.upserted += 1,
                    Err(e) => {
                        warn!(uri = %key, error = %e, "failed to index listed record");
                        pass.index_failures += 1;
                    }
                }
                // A failed local write must not turn into a deletion.
                pass.fetched.insert(key);
            }
            Ok(None) => {
                pass.fetched.insert(key);
            }
            Err(e) => {
                warn!(uri = %key, error = %e, "failed to decode listed record");
                self.reject(key, pass);
            }
        }
    }

    fn reject(&self, uri: String, pass: &mut Pass) {
        pass.skipped += 1;
        if self.config.unverified_policy == UnverifiedPolicy::Retain {
            pass.fetched.insert(uri);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::xrpc::ListRecordsPage;
    use async_trait::async_trait;
    use margin_index::MemoryStore;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    pub const ALICE: &str = "did:plc:alice";
    pub const BOOKMARKS: &str = "at.margin.bookmark";

    pub fn bookmark(source: &str) -> Value {
        json!({
            "$type": BOOKMARKS,
            "source": source,
            "createdAt": "2024-05-01T10:00:00.000Z"
        })
    }

    pub fn listed(did: &str, collection: &str, rkey: &str, value: Value) -> ListedRecord {
        let cid = margin_cid::compute_cid(&value).expect("cid").to_string();
        ListedRecord {
            uri: AtUri::new(did, collection, rkey).to_string(),
            cid: Some(cid),
            value,
        }
    }

    /// Serves fixed pages per collection, split by `page_size`.
    #[derive(Default)]
    pub struct FakeRepo {
        records: Mutex<HashMap<String, Vec<ListedRecord>>>,
        failing: Mutex<HashSet<String>>,
        page_size: usize,
        pub calls: Mutex<Vec<(String, Option<String>)>>,
        cancel_after_first_page: Mutex<Option<CancellationToken>>,
    }

    impl FakeRepo {
        pub fn new(page_size: usize) -> Self {
            Self {
                page_size,
                ..Self::default()
            }
        }

        pub fn put(&self, collection: &str, record: ListedRecord) {
            self.records
                .lock()
                .entry(collection.to_string())
                .or_default()
                .push(record);
        }

        pub fn fail(&self, collection: &str) {
            self.failing.lock().insert(collection.to_string());
        }

        pub fn cancel_after_first_page(&self, token: CancellationToken) {
            *self.cancel_after_first_page.lock() = Some(token);
        }
    }

    #[async_trait]
    impl RepoLister for FakeRepo {
        async fn list_records(
            &self,
            _repo: &str,
            collection: &str,
            _limit: u32,
            cursor: Option<&str>,
        ) -> Result<ListRecordsPage, ListingError> {
            self.calls
                .lock()
                .push((collection.to_string(), cursor.map(str::to_string)));
            if self.failing.lock().contains(collection) {
                return Err(ListingError::Status {
                    url: "fake".into(),
                    status: 502,
                    body: "bad gateway".into(),
                });
            }
            if let Some(token) = self.cancel_after_first_page.lock().as_ref() {
                token.cancel();
            }

            let all = self.records.lock().get(collection).cloned().unwrap_or_default();
            let start: usize = cursor.map(|c| c.parse().expect("cursor")).unwrap_or(0);
            let end = (start + self.page_size).min(all.len());
            let records = all[start.min(all.len())..end].to_vec();
            let cursor = (end < all.len()).then(|| end.to_string());
            Ok(ListRecordsPage { records, cursor })
        }
    }

    pub struct FakeFactory(pub Arc<FakeRepo>);

    #[async_trait]
    impl RepoClientFactory for FakeFactory {
        async fn client_for(&self, _did: &str) -> Result<Arc<dyn RepoLister>, ListingError> {
            Ok(self.0.clone())
        }
    }

    fn seed(store: &MemoryStore, rkey: &str, source: &str) {
        let value = bookmark(source);
        let cid = margin_cid::compute_cid(&value).expect("cid").to_string();
        let ctx = RecordContext::new(ALICE, BOOKMARKS, rkey, Some(&cid));
        let record = DecoderRegistry::standard()
            .decode(&ctx, &value)
            .expect("decode")
            .expect("known collection");
        store.upsert(&record).expect("seed");
    }

    fn uri(rkey: &str) -> String {
        AtUri::new(ALICE, BOOKMARKS, rkey).to_string()
    }

    fn crawler(store: Arc<MemoryStore>, policy: UnverifiedPolicy) -> Crawler {
        Crawler::new(
            store,
            Arc::new(DecoderRegistry::standard()),
            CrawlerConfig {
                page_limit: 2,
                unverified_policy: policy,
            },
        )
    }

    #[tokio::test]
    async fn reconciles_additions_and_removals() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "a", "https://example.com/a");
        seed(&store, "b", "https://example.com/b");
        seed(&store, "c", "https://example.com/c");

        let repo = Arc::new(FakeRepo::new(2));
        repo.put(BOOKMARKS, listed(ALICE, BOOKMARKS, "b", bookmark("https://example.com/b")));
        repo.put(BOOKMARKS, listed(ALICE, BOOKMARKS, "c", bookmark("https://example.com/c")));
        repo.put(BOOKMARKS, listed(ALICE, BOOKMARKS, "d", bookmark("https://example.com/d")));

        let results = crawler(store.clone(), UnverifiedPolicy::Exclude)
            .perform_sync(ALICE, &FakeFactory(repo.clone()))
            .await
            .expect("sync");

        let bookmarks = &results[BOOKMARKS];
        assert_eq!(bookmarks.upserted, 1);
        assert_eq!(bookmarks.deleted, 1);
        assert!(bookmarks.is_ok());
        assert_eq!(store.uris(), vec![uri("b"), uri("c"), uri("d")]);

        // Two pages for bookmarks, following the returned cursor.
        let calls: Vec<_> = repo
            .calls
            .lock()
            .iter()
            .filter(|(c, _)| c == BOOKMARKS)
            .cloned()
            .collect();
        assert_eq!(
            calls,
            vec![
                (BOOKMARKS.to_string(), None),
                (BOOKMARKS.to_string(), Some("2".to_string()))
            ]
        );
    }

    #[tokio::test]
    async fn empty_remote_deletes_everything_local() {
        let store = Arc::new(MemoryStore::new());
        for rkey in ["a", "b", "c"] {
            seed(&store, rkey, &format!("https://example.com/{rkey}"));
        }

        let results = crawler(store.clone(), UnverifiedPolicy::Exclude)
            .perform_sync(ALICE, &FakeFactory(Arc::new(FakeRepo::new(2))))
            .await
            .expect("sync");

        assert_eq!(
            results[BOOKMARKS],
            SyncResult {
                upserted: 0,
                deleted: 3,
                skipped: 0,
                index_failures: 0,
                error: None
            }
        );
        assert!(store.uris().is_empty());
    }

    #[tokio::test]
    async fn second_pass_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let repo = Arc::new(FakeRepo::new(10));
        repo.put(BOOKMARKS, listed(ALICE, BOOKMARKS, "a", bookmark("https://example.com/a")));
        let crawler = crawler(store.clone(), UnverifiedPolicy::Exclude);

        let first = crawler
            .perform_sync(ALICE, &FakeFactory(repo.clone()))
            .await
            .expect("first");
        assert_eq!(first[BOOKMARKS].upserted, 1);

        let second = crawler
            .perform_sync(ALICE, &FakeFactory(repo))
            .await
            .expect("second");
        assert_eq!(second[BOOKMARKS], SyncResult::default());
        assert_eq!(store.uris(), vec![uri("a")]);
    }

    #[tokio::test]
    async fn failing_collection_does_not_block_others() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "a", "https://example.com/a");

        let repo = Arc::new(FakeRepo::new(10));
        repo.fail(BOOKMARKS);
        repo.put(
            "at.margin.like",
            listed(
                ALICE,
                "at.margin.like",
                "l1",
                json!({
                    "subject": {"uri": "at://did:plc:bob/at.margin.annotation/x", "cid": "bafyreiabc"},
                    "createdAt": "2024-05-01T10:00:00.000Z"
                }),
            ),
        );

        let results = crawler(store.clone(), UnverifiedPolicy::Exclude)
            .perform_sync(ALICE, &FakeFactory(repo))
            .await
            .expect("sync");

        let bookmarks = &results[BOOKMARKS];
        assert!(!bookmarks.is_ok());
        assert_eq!(bookmarks.deleted, 0);
        assert_eq!(results["at.margin.like"].upserted, 1);
        // The failed collection's local record survives.
        assert!(store.uris().contains(&uri("a")));
        assert_eq!(results.len(), DecoderRegistry::standard().len());
    }

    #[tokio::test]
    async fn cancellation_runs_no_deletion() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "a", "https://example.com/a");
        seed(&store, "b", "https://example.com/b");

        let repo = Arc::new(FakeRepo::new(1));
        repo.put(BOOKMARKS, listed(ALICE, BOOKMARKS, "x", bookmark("https://example.com/x")));
        repo.put(BOOKMARKS, listed(ALICE, BOOKMARKS, "y", bookmark("https://example.com/y")));

        let cancel = CancellationToken::new();
        repo.cancel_after_first_page(cancel.clone());
        let results = crawler(store.clone(), UnverifiedPolicy::Exclude)
            .with_cancellation(cancel)
            .perform_sync(ALICE, &FakeFactory(repo))
            .await
            .expect("sync");

        for result in results.values() {
            assert_eq!(result.error.as_deref(), Some("cancelled"));
            assert_eq!(result.deleted, 0);
        }
        assert!(store.uris().contains(&uri("a")));
        assert!(store.uris().contains(&uri("b")));
    }

    #[tokio::test]
    async fn tampered_record_is_excluded_by_default() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "a", "https://example.com/a");

        let mut tampered = listed(ALICE, BOOKMARKS, "a", bookmark("https://example.com/a"));
        tampered.value["source"] = json!("https://evil.example.com/");
        let repo = Arc::new(FakeRepo::new(10));
        repo.put(BOOKMARKS, tampered);

        let results = crawler(store.clone(), UnverifiedPolicy::Exclude)
            .perform_sync(ALICE, &FakeFactory(repo))
            .await
            .expect("sync");

        assert_eq!(results[BOOKMARKS].skipped, 1);
        assert_eq!(results[BOOKMARKS].deleted, 1);
        assert!(store.uris().is_empty());
    }

    #[tokio::test]
    async fn tampered_record_keeps_local_copy_when_retained() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "a", "https://example.com/a");

        let mut tampered = listed(ALICE, BOOKMARKS, "a", bookmark("https://example.com/a"));
        tampered.value["source"] = json!("https://evil.example.com/");
        let repo = Arc::new(FakeRepo::new(10));
        repo.put(BOOKMARKS, tampered);

        let results = crawler(store.clone(), UnverifiedPolicy::Retain)
            .perform_sync(ALICE, &FakeFactory(repo))
            .await
            .expect("sync");

        assert_eq!(results[BOOKMARKS].skipped, 1);
        assert_eq!(results[BOOKMARKS].deleted, 0);
        let kept = store.get(&uri("a")).expect("get").expect("still indexed");
        assert_eq!(kept.target_source.as_deref(), Some("https://example.com/a"));
    }

    #[tokio::test]
    async fn failed_local_write_is_not_deleted() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "a", "https://example.com/a");

        let repo = Arc::new(FakeRepo::new(10));
        repo.put(BOOKMARKS, listed(ALICE, BOOKMARKS, "a", bookmark("https://example.com/changed")));
        store.fail_record_writes(true);

        let results = crawler(store.clone(), UnverifiedPolicy::Exclude)
            .perform_sync(ALICE, &FakeFactory(repo))
            .await
            .expect("sync");

        store.fail_record_writes(false);
        assert_eq!(results[BOOKMARKS].upserted, 0);
        assert_eq!(results[BOOKMARKS].deleted, 0);
        assert_eq!(results[BOOKMARKS].index_failures, 1);
        assert!(results[BOOKMARKS].is_ok());
        assert_eq!(store.uris(), vec![uri("a")]);
    }

    #[tokio::test]
    async fn failed_deletions_are_counted() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "a", "https://example.com/a");
        seed(&store, "b", "https://example.com/b");
        store.fail_record_writes(true);

        let results = crawler(store.clone(), UnverifiedPolicy::Exclude)
            .perform_sync(ALICE, &FakeFactory(Arc::new(FakeRepo::new(10))))
            .await
            .expect("sync");

        store.fail_record_writes(false);
        assert_eq!(
            results[BOOKMARKS],
            SyncResult {
                upserted: 0,
                deleted: 0,
                skipped: 0,
                index_failures: 2,
                error: None
            }
        );
        assert_eq!(store.uris(), vec![uri("a"), uri("b")]);
    }

    /// Hands out cursors `a`, `b`, `a`, ... forever, one record per page.
    struct CyclingRepo {
        pages: Mutex<usize>,
    }

    #[async_trait]
    impl RepoLister for CyclingRepo {
        async fn list_records(
            &self,
            _repo: &str,
            collection: &str,
            _limit: u32,
            cursor: Option<&str>,
        ) -> Result<ListRecordsPage, ListingError> {
            *self.pages.lock() += 1;
            if collection != BOOKMARKS {
                return Ok(ListRecordsPage::default());
            }
            let next = if cursor == Some("a") { "b" } else { "a" };
            let rkey = format!("r{}", *self.pages.lock());
            Ok(ListRecordsPage {
                records: vec![listed(ALICE, BOOKMARKS, &rkey, bookmark("https://example.com/r"))],
                cursor: Some(next.to_string()),
            })
        }
    }

    struct CyclingFactory(Arc<CyclingRepo>);

    #[async_trait]
    impl RepoClientFactory for CyclingFactory {
        async fn client_for(&self, _did: &str) -> Result<Arc<dyn RepoLister>, ListingError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn cycling_cursor_fails_the_collection_without_deleting() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "a", "https://example.com/a");
        let repo = Arc::new(CyclingRepo {
            pages: Mutex::new(0),
        });

        let results = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            crawler(store.clone(), UnverifiedPolicy::Exclude)
                .perform_sync(ALICE, &CyclingFactory(repo)),
        )
        .await
        .expect("pagination terminates")
        .expect("sync");

        let bookmarks = &results[BOOKMARKS];
        assert!(bookmarks
            .error
            .as_deref()
            .is_some_and(|e| e.contains("revisited cursor a")));
        assert_eq!(bookmarks.deleted, 0);
        assert!(store.uris().contains(&uri("a")));
    }

    #[tokio::test]
    async fn listing_without_cid_is_accepted() {
        let store = Arc::new(MemoryStore::new());
        let mut record = listed(ALICE, BOOKMARKS, "a", bookmark("https://example.com/a"));
        record.cid = None;
        let repo = Arc::new(FakeRepo::new(10));
        repo.put(BOOKMARKS, record);

        let results = crawler(store.clone(), UnverifiedPolicy::Exclude)
            .perform_sync(ALICE, &FakeFactory(repo))
            .await
            .expect("sync");

        assert_eq!(results[BOOKMARKS].upserted, 1);
        assert_eq!(store.get(&uri("a")).expect("get").expect("indexed").cid, None);
    }
}
