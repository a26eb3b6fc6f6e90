//! Identifier types for the normalized store
//!
//! This module defines:
//! - RecordId: stable key identifying one normalized record
//! - StorageKey: field-name + canonicalized-arguments key on one record
//! - Reference: typed edge between records (id + generated flag)
//! - FieldPath: dotted path into a query result, used for missing-field
//!   reporting and integrity errors

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Root record id under which top-level query fields are stored.
pub static ROOT_QUERY: Lazy<RecordId> = Lazy::new(|| RecordId::new("ROOT_QUERY"));

/// Conceptual root id for mutation results. Never persisted: mutation field
/// results are written directly into the records they reference.
pub static ROOT_MUTATION: Lazy<RecordId> = Lazy::new(|| RecordId::new("ROOT_MUTATION"));

/// Stable key identifying one normalized record in the store.
///
/// Two kinds of ids exist, distinguished by the `generated` flag on the
/// [`Reference`] that points at them:
/// - real ids, produced by a user-supplied identity function over the
///   object's own fields (e.g. `Type:7`)
/// - generated ids, synthesized from the field path at which the object was
///   first seen (e.g. `ROOT_QUERY.user({"id":7})`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Create a record id from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        RecordId(id.into())
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Synthesize the generated id for a child object stored under
    /// `storage_key` on the record `parent`.
    pub fn generated_child(parent: &RecordId, storage_key: &StorageKey) -> Self {
        RecordId(format!("{}.{}", parent.0, storage_key.as_str()))
    }

    /// Synthesize the generated id for the `index`-th entry of a list whose
    /// generated id is `base`. Nested lists compose by reapplying this.
    pub fn generated_list_entry(base: &RecordId, index: usize) -> Self {
        RecordId(format!("{}.{}", base.0, index))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        RecordId::new(s)
    }
}

/// Storage key distinguishing parameterized field values on one record.
///
/// Derived from the field name plus its serialized call arguments. The
/// argument serialization is canonical (object keys sorted recursively), so
/// equivalent argument sets always produce the same key. A field called with
/// no arguments is keyed by its bare name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    /// Key for a field with no arguments
    pub fn bare(field_name: &str) -> Self {
        StorageKey(field_name.to_string())
    }

    /// Key for a field with canonically serialized arguments
    pub fn with_args(field_name: &str, canonical_args: &str) -> Self {
        StorageKey(format!("{}({})", field_name, canonical_args))
    }

    /// The key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed edge from one record to another.
///
/// `generated = true` marks an id synthesized from a field path;
/// `generated = false` marks an id produced by the identity function.
/// The flag drives the promotion/conflict rules applied by the writer:
/// a generated reference may be silently promoted to a real one, but a real
/// reference is never silently replaced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// Target record id
    pub id: RecordId,
    /// Whether the id was synthesized from the field path
    pub generated: bool,
}

impl Reference {
    /// Reference to a record with a real (identity-derived) id
    pub fn real(id: RecordId) -> Self {
        Reference { id, generated: false }
    }

    /// Reference to a record with a path-synthesized id
    pub fn generated(id: RecordId) -> Self {
        Reference { id, generated: true }
    }
}

/// Dotted path to a field inside a query result.
///
/// Used to report missing fields from the differ and to name the offending
/// position in integrity errors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Empty path (the query root)
    pub fn root() -> Self {
        FieldPath(Vec::new())
    }

    /// Path from pre-built segments
    pub fn from_segments(segments: Vec<String>) -> Self {
        FieldPath(segments)
    }

    /// Return a new path with `segment` appended
    pub fn child(&self, segment: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        FieldPath(segments)
    }

    /// Return a new path with `prefix` prepended to every segment of `self`
    pub fn prefixed(&self, prefix: &str) -> Self {
        let mut segments = Vec::with_capacity(self.0.len() + 1);
        segments.push(prefix.to_string());
        segments.extend(self.0.iter().cloned());
        FieldPath(segments)
    }

    /// Path segments
    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

// Segments joined by dots; the root path renders as `$`.
impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("$");
        }
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}
