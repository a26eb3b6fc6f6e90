//! NormalizedStore: the authoritative record-id to record mapping
//!
//! Records are held behind `Arc` and updated copy-on-write: a write replaces
//! only the `Arc`s of the records it touches. Everything else keeps pointer
//! identity, which is what the reader's memoization keys on.
//!
//! All mutation goes through [`NormalizedStore::apply`] with a staged
//! [`WriteSet`], so a write either applies completely or not at all.

use graphcache_core::{Record, RecordId, StorageKey, StoreValue};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Read access to records, implemented by the base store and by effective
/// (overlay-folded) stores alike.
pub trait RecordSource {
    /// Look up the record stored under `id`
    fn record(&self, id: &RecordId) -> Option<Arc<Record>>;
}

/// A staged set of store mutations produced by one write.
///
/// `upserts` hold only the fields actually written, keyed by target record;
/// applying a write set merges those fields into the target records, the
/// later write's value winning field by field. `deletes` name generated records abandoned
/// by id promotion. Write sets double as optimistic patches: they are diffs,
/// not snapshots, so replaying one over a newer base store is sound.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteSet {
    upserts: BTreeMap<RecordId, Record>,
    deletes: Vec<RecordId>,
}

impl WriteSet {
    /// Empty write set
    pub fn new() -> Self {
        WriteSet::default()
    }

    /// Stage one field write on `id`
    pub fn insert_field(&mut self, id: &RecordId, key: StorageKey, value: StoreValue) {
        self.upserts.entry(id.clone()).or_default().insert(key, value);
    }

    /// Staged field value, if this write set touched it
    pub fn staged_field(&self, id: &RecordId, key: &StorageKey) -> Option<&StoreValue> {
        self.upserts.get(id).and_then(|record| record.get(key))
    }

    /// Staged fields for `id`, if any
    pub fn staged_record(&self, id: &RecordId) -> Option<&Record> {
        self.upserts.get(id)
    }

    /// Drop staged fields for `id` without scheduling a delete. Used for the
    /// conceptual `ROOT_MUTATION` record, which is never persisted.
    pub fn discard_record(&mut self, id: &RecordId) {
        self.upserts.remove(id);
    }

    /// Mark `id` for deletion and drop any fields staged under it
    pub fn delete(&mut self, id: RecordId) {
        self.upserts.remove(&id);
        if !self.deletes.contains(&id) {
            self.deletes.push(id);
        }
    }

    /// Whether `id` is marked for deletion
    pub fn is_deleted(&self, id: &RecordId) -> bool {
        self.deletes.contains(id)
    }

    /// Whether nothing was staged
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }

    /// Record ids this write set touches (upserts and deletes)
    pub fn touched_ids(&self) -> impl Iterator<Item = &RecordId> {
        self.upserts.keys().chain(self.deletes.iter())
    }

    /// Staged upserts in id order
    pub fn upserts(&self) -> impl Iterator<Item = (&RecordId, &Record)> {
        self.upserts.iter()
    }

    /// Ids staged for deletion
    pub fn deletes(&self) -> &[RecordId] {
        &self.deletes
    }
}

/// The normalized, deduplicated in-memory graph of server-known records.
#[derive(Debug, Clone, Default)]
pub struct NormalizedStore {
    records: FxHashMap<RecordId, Arc<Record>>,
    revision: u64,
}

impl NormalizedStore {
    /// Empty store
    pub fn new() -> Self {
        NormalizedStore::default()
    }

    /// Monotonic revision counter, bumped on every applied change.
    /// Overlays use it to detect that their folded view is stale.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Look up a record
    pub fn get(&self, id: &RecordId) -> Option<&Arc<Record>> {
        self.records.get(id)
    }

    /// Whether a record exists under `id`
    pub fn contains(&self, id: &RecordId) -> bool {
        self.records.contains_key(id)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate all records
    pub fn iter(&self) -> impl Iterator<Item = (&RecordId, &Arc<Record>)> {
        self.records.iter()
    }

    /// Apply a staged write set atomically. Returns the ids whose records
    /// actually changed.
    ///
    /// Records whose merged state equals their current state keep their
    /// existing `Arc` untouched, so an idempotent re-write leaves every
    /// record pointer-identical (referential stability).
    pub fn apply(&mut self, writes: &WriteSet) -> Vec<RecordId> {
        let mut touched = Vec::new();
        for (id, fields) in writes.upserts() {
            match self.records.get(id) {
                Some(existing) => {
                    let mut merged = Record::clone(existing);
                    merged.merge_from(fields);
                    if merged != **existing {
                        self.records.insert(id.clone(), Arc::new(merged));
                        touched.push(id.clone());
                    }
                }
                None => {
                    self.records.insert(id.clone(), Arc::new(fields.clone()));
                    touched.push(id.clone());
                }
            }
        }
        for id in writes.deletes() {
            if self.records.remove(id).is_some() {
                touched.push(id.clone());
            }
        }
        if !touched.is_empty() {
            self.revision += 1;
        }
        touched
    }

    /// Insert a record wholesale, replacing any existing one. Used by
    /// snapshot hydration.
    pub fn insert_record(&mut self, id: RecordId, record: Record) {
        self.records.insert(id, Arc::new(record));
        self.revision += 1;
    }

    /// Drop every record (store reset)
    pub fn clear(&mut self) {
        self.records.clear();
        self.revision += 1;
    }
}

impl RecordSource for NormalizedStore {
    fn record(&self, id: &RecordId) -> Option<Arc<Record>> {
        self.records.get(id).map(Arc::clone)
    }
}
