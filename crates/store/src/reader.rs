//! Reader/Differ: reconstructs a result tree from the store
//!
//! Walks the selection set, resolving reference edges through the store.
//! Missing data never throws: absent fields are reported by path and the
//! partial result continues to build. The reader only errors when data
//! exists but is shaped inconsistently with the query (a scalar where a
//! reference was expected, and the like).
//!
//! ## Referential stability
//!
//! Two reads of an unchanged subtree must return pointer-identical
//! sub-objects, not merely deep-equal ones, so dependent computations can
//! skip re-processing. Sub-results are memoized per
//! `(record id, selection-set identity, variables fingerprint)` and reused
//! while every record the subtree read is still pointer-identical in the
//! store. Because the store updates records copy-on-write, a write
//! invalidates exactly the memo entries whose subtrees it touched.

use crate::store::RecordSource;
use graphcache_core::{
    variables_fingerprint, Document, Error, Field, FieldPath, FragmentMatch, FragmentMatcher,
    Record, RecordId, Result, Selection, SelectionSet, StoreValue, Variables,
};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// One read request against a store snapshot
#[derive(Debug)]
pub struct ReadRequest<'a> {
    /// Query document to read
    pub document: &'a Document,
    /// Variable bindings
    pub variables: &'a Variables,
    /// Record id to start from (`ROOT_QUERY` for queries)
    pub root_id: RecordId,
}

/// Immutable result tree handed to callers.
///
/// Objects and lists are `Arc`-shared: cloning is cheap and callers cannot
/// mutate cache internals through a returned result. This replaces runtime
/// deep-freezing with a type enforced at the API boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffValue {
    /// Explicit null
    Null,
    /// Boolean scalar
    Bool(bool),
    /// Integer scalar
    Int(i64),
    /// Float scalar
    Float(f64),
    /// String scalar
    String(Arc<str>),
    /// List of values
    List(Arc<Vec<DiffValue>>),
    /// Object keyed by response field name
    Object(Arc<BTreeMap<String, DiffValue>>),
}

impl DiffValue {
    /// Fast identity check: `true` means the two values share the same
    /// allocation (objects/lists) or are equal scalars. `false` says nothing
    /// about deep equality.
    pub fn ptr_eq(&self, other: &DiffValue) -> bool {
        match (self, other) {
            (DiffValue::Object(a), DiffValue::Object(b)) => Arc::ptr_eq(a, b),
            (DiffValue::List(a), DiffValue::List(b)) => Arc::ptr_eq(a, b),
            (DiffValue::String(a), DiffValue::String(b)) => Arc::ptr_eq(a, b) || a == b,
            (a, b) => a == b,
        }
    }

    /// Whether this is an object with no fields
    pub fn is_empty_object(&self) -> bool {
        matches!(self, DiffValue::Object(fields) if fields.is_empty())
    }

    /// Convert to plain JSON (deep copy)
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DiffValue::Null => serde_json::Value::Null,
            DiffValue::Bool(b) => serde_json::Value::Bool(*b),
            DiffValue::Int(i) => serde_json::Value::from(*i),
            DiffValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            DiffValue::String(s) => serde_json::Value::String(s.to_string()),
            DiffValue::List(items) => {
                serde_json::Value::Array(items.iter().map(DiffValue::to_json).collect())
            }
            DiffValue::Object(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

/// Outcome of diffing one query against a store snapshot
#[derive(Debug, Clone)]
pub struct DiffResult {
    /// The (possibly partial) result tree
    pub result: DiffValue,
    /// True iff no field was missing anywhere in the tree
    pub complete: bool,
    /// Paths of every missing field
    pub missing: Vec<FieldPath>,
    /// Every record id the read visited, for invalidation
    pub dependencies: Vec<RecordId>,
}

/// Entry count below which no sweep is attempted
const SWEEP_FLOOR: usize = 64;

/// Memoized sub-results, shared across reads of the same store lineage.
///
/// Entries whose selection list has been dropped are swept out lazily:
/// amortized on insert once the cache grows past a floor, and eagerly via
/// [`ReadCache::sweep`] when a query is destroyed.
#[derive(Debug)]
pub struct ReadCache {
    entries: FxHashMap<MemoKey, Arc<MemoEntry>>,
    sweep_threshold: usize,
}

impl Default for ReadCache {
    fn default() -> Self {
        ReadCache {
            entries: FxHashMap::default(),
            sweep_threshold: SWEEP_FLOOR,
        }
    }
}

impl ReadCache {
    /// Empty cache
    pub fn new() -> Self {
        ReadCache::default()
    }

    /// Drop every memo entry (store reset)
    pub fn clear(&mut self) {
        self.entries.clear();
        self.sweep_threshold = SWEEP_FLOOR;
    }

    /// Drop entries for selection lists that no longer exist (their
    /// documents were dropped)
    pub fn sweep(&mut self) {
        self.entries
            .retain(|_, entry| entry.selection.strong_count() > 0);
        self.sweep_threshold = (self.entries.len() * 2).max(SWEEP_FLOOR);
    }

    fn insert(&mut self, key: MemoKey, entry: Arc<MemoEntry>) {
        if self.entries.len() >= self.sweep_threshold {
            self.sweep();
        }
        self.entries.insert(key, entry);
    }

    /// Number of live memo entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemoKey {
    record_id: RecordId,
    selection: usize,
    variables: u64,
}

#[derive(Debug)]
struct MemoEntry {
    /// The selection list the entry was keyed on. The address in the key is
    /// only trustworthy while that list is alive; once it is dropped the
    /// allocation can be recycled by an unrelated document, so a dead handle
    /// invalidates the entry.
    selection: Weak<Vec<Selection>>,
    /// Records this subtree read, with the exact `Arc` observed (`None`
    /// records an observed absence). The entry is reusable only while every
    /// one of them is still pointer-identical in the current source.
    deps: Vec<(RecordId, Option<Arc<Record>>)>,
    value: DiffValue,
    complete: bool,
    /// Missing paths relative to this subtree's root
    missing: Vec<FieldPath>,
}

/// Read `request` against `source`, memoizing subtrees in `cache`.
pub fn read_result(
    source: &dyn RecordSource,
    request: &ReadRequest<'_>,
    matcher: &dyn FragmentMatcher,
    cache: &mut ReadCache,
) -> Result<DiffResult> {
    let mut reader = Reader {
        source,
        document: request.document,
        variables: request.variables,
        variables_fp: variables_fingerprint(request.variables),
        matcher,
        cache,
    };
    let object = reader.read_object(&request.root_id, &request.document.selection_set)?;
    Ok(DiffResult {
        result: object.value,
        complete: object.complete,
        missing: object.missing,
        dependencies: object.deps.into_iter().map(|(id, _)| id).collect(),
    })
}

/// A subtree read: value plus the bookkeeping that bubbles up
struct ObjectRead {
    value: DiffValue,
    complete: bool,
    missing: Vec<FieldPath>,
    deps: Vec<(RecordId, Option<Arc<Record>>)>,
}

struct Reader<'a> {
    source: &'a dyn RecordSource,
    document: &'a Document,
    variables: &'a Variables,
    variables_fp: u64,
    matcher: &'a dyn FragmentMatcher,
    cache: &'a mut ReadCache,
}

impl Reader<'_> {
    fn read_object(&mut self, record_id: &RecordId, selection_set: &SelectionSet) -> Result<ObjectRead> {
        let key = MemoKey {
            record_id: record_id.clone(),
            selection: selection_set.identity(),
            variables: self.variables_fp,
        };
        if let Some(entry) = self.cache.entries.get(&key) {
            // A live upgrade at the keyed address proves the entry was built
            // from this very selection list, not from a dropped one whose
            // allocation got recycled.
            let same_selection = entry
                .selection
                .upgrade()
                .is_some_and(|live| Arc::as_ptr(&live) as usize == key.selection);
            if same_selection && self.entry_is_current(entry) {
                return Ok(ObjectRead {
                    value: entry.value.clone(),
                    complete: entry.complete,
                    missing: entry.missing.clone(),
                    deps: entry.deps.clone(),
                });
            }
        }

        let record = self.source.record(record_id);
        let mut read = ObjectRead {
            value: DiffValue::Null,
            complete: true,
            missing: Vec::new(),
            deps: vec![(record_id.clone(), record.clone())],
        };
        let record = record.unwrap_or_default();
        let mut fields = BTreeMap::new();
        self.collect_selections(&record, selection_set, &mut fields, &mut read)?;
        read.value = DiffValue::Object(Arc::new(fields));

        self.cache.insert(
            key,
            Arc::new(MemoEntry {
                selection: selection_set.downgrade(),
                deps: read.deps.clone(),
                value: read.value.clone(),
                complete: read.complete,
                missing: read.missing.clone(),
            }),
        );
        Ok(read)
    }

    fn entry_is_current(&self, entry: &MemoEntry) -> bool {
        entry.deps.iter().all(|(id, observed)| {
            match (observed, self.source.record(id)) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, &b),
                (None, None) => true,
                _ => false,
            }
        })
    }

    fn collect_selections(
        &mut self,
        record: &Record,
        selection_set: &SelectionSet,
        fields: &mut BTreeMap<String, DiffValue>,
        read: &mut ObjectRead,
    ) -> Result<()> {
        for selection in selection_set.selections() {
            match selection {
                Selection::Field(field) => self.read_field(record, field, fields, read)?,
                Selection::InlineFragment(fragment) => {
                    let set = fragment.selection_set.clone();
                    match fragment
                        .type_condition
                        .as_deref()
                        .map_or(FragmentMatch::Yes, |cond| self.matcher.matches(record, cond))
                    {
                        FragmentMatch::No => {}
                        FragmentMatch::Yes => {
                            self.collect_selections(record, &set, fields, read)?;
                        }
                        FragmentMatch::Unknown => {
                            // Heuristic matching: read the fields, but do not
                            // claim the result is complete.
                            self.collect_selections(record, &set, fields, read)?;
                            read.complete = false;
                        }
                    }
                }
                Selection::FragmentSpread(name) => {
                    let fragment = self.document.fragment(name)?;
                    let set = fragment.selection_set.clone();
                    match self.matcher.matches(record, &fragment.type_condition) {
                        FragmentMatch::No => {}
                        FragmentMatch::Yes => {
                            self.collect_selections(record, &set, fields, read)?;
                        }
                        FragmentMatch::Unknown => {
                            self.collect_selections(record, &set, fields, read)?;
                            read.complete = false;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn read_field(
        &mut self,
        record: &Record,
        field: &Field,
        fields: &mut BTreeMap<String, DiffValue>,
        read: &mut ObjectRead,
    ) -> Result<()> {
        let response_key = field.response_key();
        let storage_key = field.storage_key(self.variables)?;
        let Some(stored) = record.get(&storage_key) else {
            read.complete = false;
            read.missing.push(FieldPath::from_segments(vec![response_key.to_string()]));
            return Ok(());
        };
        let stored = stored.clone();
        if let Some(value) =
            self.read_value(&stored, field.selection_set.as_ref(), response_key, read)?
        {
            fields.insert(response_key.to_string(), value);
        }
        Ok(())
    }

    /// Materialize one stored value. Returns `None` when the value resolves
    /// to a reference whose record is entirely absent; the caller then
    /// treats the field as missing (already recorded in `read`).
    fn read_value(
        &mut self,
        stored: &StoreValue,
        selection: Option<&SelectionSet>,
        response_key: &str,
        read: &mut ObjectRead,
    ) -> Result<Option<DiffValue>> {
        match stored {
            StoreValue::Null => Ok(Some(DiffValue::Null)),
            StoreValue::Bool(b) => self.scalar(selection, response_key, DiffValue::Bool(*b)),
            StoreValue::Int(i) => self.scalar(selection, response_key, DiffValue::Int(*i)),
            StoreValue::Float(f) => self.scalar(selection, response_key, DiffValue::Float(*f)),
            StoreValue::String(s) => {
                self.scalar(selection, response_key, DiffValue::String(Arc::from(s.as_str())))
            }
            StoreValue::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    let entry_key = format!("{}.{}", response_key, index);
                    match self.read_value(item, selection, &entry_key, read)? {
                        Some(value) => out.push(value),
                        // An absent referenced record inside a list leaves a
                        // hole; report it missing and substitute null.
                        None => out.push(DiffValue::Null),
                    }
                }
                Ok(Some(DiffValue::List(Arc::new(out))))
            }
            StoreValue::Ref(reference) => {
                let Some(selection) = selection else {
                    return Err(Error::InvalidShape {
                        path: FieldPath::from_segments(vec![response_key.to_string()]),
                        expected: "scalar",
                        found: "reference",
                    });
                };
                if self.source.record(&reference.id).is_none() {
                    read.deps.push((reference.id.clone(), None));
                    read.complete = false;
                    read.missing
                        .push(FieldPath::from_segments(vec![response_key.to_string()]));
                    return Ok(None);
                }
                let selection = selection.clone();
                let nested = self.read_object(&reference.id, &selection)?;
                read.complete &= nested.complete;
                for path in &nested.missing {
                    read.missing.push(path.prefixed(response_key));
                }
                read.deps.extend(nested.deps);
                Ok(Some(nested.value))
            }
        }
    }

    fn scalar(
        &self,
        selection: Option<&SelectionSet>,
        response_key: &str,
        value: DiffValue,
    ) -> Result<Option<DiffValue>> {
        if selection.is_some() {
            return Err(Error::InvalidShape {
                path: FieldPath::from_segments(vec![response_key.to_string()]),
                expected: "reference",
                found: "scalar",
            });
        }
        Ok(Some(value))
    }
}
