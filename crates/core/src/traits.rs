//! Collaborator traits consumed by the core
//!
//! Fragment-type matching against a schema and record identity are supplied
//! from outside; the cache only consumes them as capabilities.

use crate::types::{RecordId, StorageKey};
use crate::value::{Record, StoreValue};
use std::sync::Arc;

/// Outcome of matching a record against a fragment type condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentMatch {
    /// The record satisfies the condition
    Yes,
    /// The record does not satisfy the condition
    No,
    /// The matcher cannot decide (e.g. no type information on the record).
    /// The reader treats this as a match but marks the result incomplete.
    Unknown,
}

/// Decides whether a record's type satisfies a fragment condition
pub trait FragmentMatcher: Send + Sync {
    /// Match `record` against `type_condition`
    fn matches(&self, record: &Record, type_condition: &str) -> FragmentMatch;
}

/// Identity function over a result object's own fields.
///
/// Pure; called once per object encountered by the writer. Returning `None`
/// makes the writer fall back to a path-synthesized (generated) id.
pub type IdentityFn =
    Arc<dyn Fn(&serde_json::Map<String, serde_json::Value>) -> Option<RecordId> + Send + Sync>;

/// Build the conventional `__typename:id` identity function
pub fn typename_and_id() -> IdentityFn {
    Arc::new(|fields| {
        let typename = fields.get("__typename")?.as_str()?;
        let id = fields.get("id")?;
        let id = match id {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(RecordId::new(format!("{}:{}", typename, id)))
    })
}

/// Default matcher comparing the record's stored `__typename`.
///
/// Returns [`FragmentMatch::Unknown`] when the record carries no type
/// information, which is the heuristic behavior: read the fragment anyway
/// but do not claim completeness.
#[derive(Debug, Default, Clone, Copy)]
pub struct TypenameMatcher;

impl FragmentMatcher for TypenameMatcher {
    fn matches(&self, record: &Record, type_condition: &str) -> FragmentMatch {
        match record.get(&StorageKey::bare("__typename")) {
            Some(StoreValue::String(typename)) if typename == type_condition => FragmentMatch::Yes,
            Some(StoreValue::String(_)) => FragmentMatch::No,
            _ => FragmentMatch::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record_with_typename(typename: &str) -> Record {
        [(
            StorageKey::bare("__typename"),
            StoreValue::String(typename.to_string()),
        )]
        .into_iter()
        .collect()
    }

    #[test]
    fn typename_matcher_matches_equal_typename() {
        let record = record_with_typename("User");
        assert_eq!(TypenameMatcher.matches(&record, "User"), FragmentMatch::Yes);
        assert_eq!(TypenameMatcher.matches(&record, "Post"), FragmentMatch::No);
    }

    #[test]
    fn typename_matcher_unknown_without_typename() {
        assert_eq!(
            TypenameMatcher.matches(&Record::new(), "User"),
            FragmentMatch::Unknown
        );
    }

    #[test]
    fn typename_and_id_builds_composite_id() {
        let identity = typename_and_id();
        let obj = json!({"__typename": "User", "id": 7, "name": "Ada"});
        let id = (*identity)(obj.as_object().unwrap()).unwrap();
        assert_eq!(id.as_str(), "User:7");
    }

    #[test]
    fn typename_and_id_requires_both_fields() {
        let identity = typename_and_id();
        assert!((*identity)(json!({"id": 7}).as_object().unwrap()).is_none());
        assert!((*identity)(json!({"__typename": "User"}).as_object().unwrap()).is_none());
    }
}
