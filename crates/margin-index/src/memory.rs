//! In-memory implementation of the storage traits.
//!
//! Used by tests and dry runs. Writes can be made to fail on demand so callers can
//! exercise their failure accounting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use margin_lexicon::IndexedRecord;
use parking_lot::RwLock;

use crate::error::{IndexError, Result};
use crate::store::{CursorStore, RecordIndex};

/// In-process store for tests and dry runs. Writes can be made to fail on demand.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, IndexedRecord>>,
    cursors: RwLock<HashMap<String, i64>>,
    fail_record_writes: AtomicBool,
    fail_cursor_writes: AtomicBool,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent upsert/delete fail until reset.
    pub fn fail_record_writes(&self, fail: bool) {
        self.fail_record_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent cursor save fail until reset.
    pub fn fail_cursor_writes(&self, fail: bool) {
        self.fail_cursor_writes.store(fail, Ordering::SeqCst);
    }

    /// Every stored URI, sorted.
    pub fn uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.records.read().keys().cloned().collect();
        uris.sort();
        uris
    }

    fn check_writable(&self, flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(IndexError::Unavailable(format!("{what} writes disabled")))
        } else {
            Ok(())
        }
    }
}

impl RecordIndex for MemoryStore {
    fn upsert(&self, record: &IndexedRecord) -> Result<()> {
        self.check_writable(&self.fail_record_writes, "record")?;
        self.records
            .write()
            .insert(record.uri.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, uri: &str) -> Result<bool> {
        self.check_writable(&self.fail_record_writes, "record")?;
        Ok(self.records.write().remove(uri).is_some())
    }

    fn get(&self, uri: &str) -> Result<Option<IndexedRecord>> {
        Ok(self.records.read().get(uri).cloned())
    }

    fn records_for_author(
        &self,
        did: &str,
        collection: &str,
    ) -> Result<HashMap<String, Option<String>>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.author_did == did && r.collection == collection)
            .map(|r| (r.uri.clone(), r.cid.clone()))
            .collect())
    }

    fn by_target_hash(&self, target_hash: &str) -> Result<Vec<IndexedRecord>> {
        let mut records: Vec<IndexedRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.target_hash.as_deref() == Some(target_hash))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    fn count(&self) -> Result<usize> {
        Ok(self.records.read().len())
    }
}

impl CursorStore for MemoryStore {
    fn load_cursor(&self, subscription: &str) -> Result<Option<i64>> {
        Ok(self.cursors.read().get(subscription).copied())
    }

    fn save_cursor(&self, subscription: &str, cursor: i64) -> Result<()> {
        self.check_writable(&self.fail_cursor_writes, "cursor")?;
        self.cursors.write().insert(subscription.to_string(), cursor);
        Ok(())
    }
}
