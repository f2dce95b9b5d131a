//! Storage traits consumed by the ingestion paths.
//!
//! The sync code only depends on these traits, so any keyed store can back the index.

use std::collections::HashMap;

use margin_lexicon::IndexedRecord;

use crate::error::Result;

/// Keyed record storage. `uri` is the primary key and every write is idempotent.
pub trait RecordIndex: Send + Sync {
    /// Insert or fully replace the record stored under `record.uri`.
    fn upsert(&self, record: &IndexedRecord) -> Result<()>;

    /// Remove a record. Returns `false` when nothing was stored under `uri`.
    fn delete(&self, uri: &str) -> Result<bool>;

    /// Fetch one record by URI.
    fn get(&self, uri: &str) -> Result<Option<IndexedRecord>>;

    /// Every stored URI (with its CID) for one author and collection NSID.
    fn records_for_author(
        &self,
        did: &str,
        collection: &str,
    ) -> Result<HashMap<String, Option<String>>>;

    /// Records pointing at the page identified by `target_hash`, newest first.
    fn by_target_hash(&self, target_hash: &str) -> Result<Vec<IndexedRecord>>;

    /// Number of stored records.
    fn count(&self) -> Result<usize>;
}

/// Persisted stream positions keyed by subscription name.
pub trait CursorStore: Send + Sync {
    /// Last saved position for `subscription`, if any.
    fn load_cursor(&self, subscription: &str) -> Result<Option<i64>>;

    /// Persist `cursor` as the position for `subscription`.
    fn save_cursor(&self, subscription: &str, cursor: i64) -> Result<()>;
}
