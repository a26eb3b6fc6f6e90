//! Snapshot extraction and hydration
//!
//! The store and overlay are plain data; a [`CacheSnapshot`] serializes them
//! for hydration (e.g. server-rendered state handed to a client). Only
//! `data` (and pending optimistic patches) may be pre-seeded: a snapshot
//! carrying a non-empty `queries` or `mutations` section is rejected, since
//! query lifecycle state cannot be meaningfully transplanted.

use crate::optimistic::{OptimisticEntry, OptimisticOverlay};
use crate::store::NormalizedStore;
use graphcache_core::{Error, Record, RecordId, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// Serializable snapshot of cache state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// All normalized records
    pub data: BTreeMap<RecordId, Record>,
    /// Pending optimistic patches, in fold order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optimistic: Vec<OptimisticEntry>,
    /// Query lifecycle state. Accepted only when empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queries: Option<Json>,
    /// Mutation lifecycle state. Accepted only when empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutations: Option<Json>,
}

/// Extract the current store and overlay into a snapshot
pub fn extract(store: &NormalizedStore, overlay: &OptimisticOverlay) -> CacheSnapshot {
    CacheSnapshot {
        data: store
            .iter()
            .map(|(id, record)| (id.clone(), Record::clone(record)))
            .collect(),
        optimistic: overlay.entries().to_vec(),
        queries: None,
        mutations: None,
    }
}

/// Hydrate a store and overlay from a snapshot
pub fn restore(snapshot: CacheSnapshot) -> Result<(NormalizedStore, OptimisticOverlay)> {
    reject_lifecycle_section("queries", snapshot.queries.as_ref())?;
    reject_lifecycle_section("mutations", snapshot.mutations.as_ref())?;

    let mut store = NormalizedStore::new();
    for (id, record) in snapshot.data {
        store.insert_record(id, record);
    }
    let mut overlay = OptimisticOverlay::new();
    overlay.restore_entries(snapshot.optimistic);
    Ok((store, overlay))
}

fn reject_lifecycle_section(name: &str, section: Option<&Json>) -> Result<()> {
    let non_empty = match section {
        None | Some(Json::Null) => false,
        Some(Json::Object(map)) => !map.is_empty(),
        Some(Json::Array(items)) => !items.is_empty(),
        Some(_) => true,
    };
    if non_empty {
        return Err(Error::InvalidSnapshot(format!(
            "snapshot may not pre-seed a non-empty `{}` section",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphcache_core::{StorageKey, StoreValue};
    use serde_json::json;

    fn seeded_store() -> NormalizedStore {
        let mut store = NormalizedStore::new();
        let record: Record = [(StorageKey::bare("a"), StoreValue::Int(1))]
            .into_iter()
            .collect();
        store.insert_record(RecordId::new("ROOT_QUERY"), record);
        store
    }

    #[test]
    fn extract_restore_round_trip() {
        let store = seeded_store();
        let mut overlay = OptimisticOverlay::new();
        let mut patch = crate::store::WriteSet::new();
        patch.insert_field(&RecordId::new("ROOT_QUERY"), StorageKey::bare("a"), StoreValue::Int(2));
        overlay.add_patch(7, patch);

        let snapshot = extract(&store, &overlay);
        let text = serde_json::to_string(&snapshot).unwrap();
        let parsed: CacheSnapshot = serde_json::from_str(&text).unwrap();
        let (restored_store, restored_overlay) = restore(parsed).unwrap();

        assert_eq!(restored_store.len(), 1);
        assert_eq!(restored_overlay.entries().len(), 1);
        assert_eq!(restored_overlay.entries()[0].mutation_id, 7);
    }

    #[test]
    fn empty_queries_section_is_accepted() {
        let snapshot: CacheSnapshot =
            serde_json::from_value(json!({"data": {}, "queries": {}})).unwrap();
        assert!(restore(snapshot).is_ok());
    }

    #[test]
    fn non_empty_queries_section_is_rejected() {
        let snapshot: CacheSnapshot =
            serde_json::from_value(json!({"data": {}, "queries": {"1": {"networkStatus": 7}}}))
                .unwrap();
        let err = restore(snapshot).unwrap_err();
        assert!(matches!(err, Error::InvalidSnapshot(msg) if msg.contains("queries")));
    }

    #[test]
    fn non_empty_mutations_section_is_rejected() {
        let snapshot: CacheSnapshot =
            serde_json::from_value(json!({"data": {}, "mutations": [1]})).unwrap();
        assert!(matches!(restore(snapshot), Err(Error::InvalidSnapshot(_))));
    }

    #[test]
    fn data_only_snapshot_hydrates_records() {
        let snapshot: CacheSnapshot = serde_json::from_value(json!({
            "data": {"User:1": {"name": {"String": "Ada"}}}
        }))
        .unwrap();
        let (store, overlay) = restore(snapshot).unwrap();
        assert!(store.contains(&RecordId::new("User:1")));
        assert!(overlay.is_empty());
    }
}
