//! Value types for the normalized store
//!
//! This module defines:
//! - StoreValue: unified value enum held under one storage key
//! - Record: one flattened record, an ordered mapping of storage keys to values
//!
//! Nested objects never appear inside a record; they are replaced by
//! [`Reference`] edges to other records, which is what keeps the store a
//! normalized, deduplicated graph.

use crate::types::{Reference, StorageKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One value stored under a storage key in a record.
///
/// Scalars are stored directly. Object-valued fields are stored as
/// [`StoreValue::Ref`] edges. Lists may mix scalars, nested lists and
/// references (a list of objects normalizes to a list of references).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreValue {
    /// Explicit null returned by the server
    Null,
    /// Boolean scalar
    Bool(bool),
    /// Integer scalar
    Int(i64),
    /// Floating point scalar
    Float(f64),
    /// String scalar
    String(String),
    /// Ordered list of values
    List(Vec<StoreValue>),
    /// Edge to another record
    Ref(Reference),
}

impl StoreValue {
    /// Convert a scalar JSON value. Returns `None` for objects and arrays,
    /// which must go through the writer's normalization instead.
    pub fn from_scalar_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(StoreValue::Null),
            serde_json::Value::Bool(b) => Some(StoreValue::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(StoreValue::Int(i))
                } else {
                    n.as_f64().map(StoreValue::Float)
                }
            }
            serde_json::Value::String(s) => Some(StoreValue::String(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }

    /// Whether this value is a reference edge
    pub fn is_ref(&self) -> bool {
        matches!(self, StoreValue::Ref(_))
    }

    /// Borrow the reference if this value is one
    pub fn as_ref_value(&self) -> Option<&Reference> {
        match self {
            StoreValue::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// Short type name for shape-error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            StoreValue::Null => "null",
            StoreValue::Bool(_) => "bool",
            StoreValue::Int(_) => "int",
            StoreValue::Float(_) => "float",
            StoreValue::String(_) => "string",
            StoreValue::List(_) => "list",
            StoreValue::Ref(_) => "reference",
        }
    }
}

/// One flattened record: an ordered mapping from storage key to value.
///
/// The map is ordered so that iteration, serialization and equality are
/// deterministic regardless of write order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<StorageKey, StoreValue>,
}

impl Record {
    /// Empty record
    pub fn new() -> Self {
        Record::default()
    }

    /// Look up a field value
    pub fn get(&self, key: &StorageKey) -> Option<&StoreValue> {
        self.fields.get(key)
    }

    /// Insert or replace a field value
    pub fn insert(&mut self, key: StorageKey, value: StoreValue) {
        self.fields.insert(key, value);
    }

    /// Union `other` into this record. For keys present in both, `other`'s
    /// value wins, so the later write always shadows the earlier one.
    pub fn merge_from(&mut self, other: &Record) {
        for (key, value) in &other.fields {
            self.fields.insert(key.clone(), value.clone());
        }
    }

    /// Union `other` into this record, keeping this record's value for keys
    /// present in both. Used for generated-to-real id promotion, where fields
    /// copied forward from the abandoned generated record must not overwrite
    /// fields already written under the real id.
    pub fn merge_defaults_from(&mut self, other: &Record) {
        for (key, value) in &other.fields {
            self.fields.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    /// Iterate fields in key order
    pub fn iter(&self) -> impl Iterator<Item = (&StorageKey, &StoreValue)> {
        self.fields.iter()
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the record has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(StorageKey, StoreValue)> for Record {
    fn from_iter<T: IntoIterator<Item = (StorageKey, StoreValue)>>(iter: T) -> Self {
        Record {
            fields: iter.into_iter().collect(),
        }
    }
}
