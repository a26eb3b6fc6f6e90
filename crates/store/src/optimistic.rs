//! OptimisticOverlay: speculative patches layered atop the base store
//!
//! Each patch is the [`WriteSet`] derived from a mutation's optimistic
//! response. The effective store is the base store with every current patch
//! folded in, in mutation-insertion order. Patches are diffs, not snapshots:
//! recomputation costs the total patch size, and removing a patch never
//! rolls back the base store — it only removes that layer.
//!
//! The folded view is cached and rebuilt lazily when the base revision or
//! the patch list changes.

use crate::store::{NormalizedStore, WriteSet};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One speculative patch, keyed by the mutation that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimisticEntry {
    /// Id of the mutation this patch belongs to
    pub mutation_id: u64,
    /// The staged diff to fold over the base store
    pub patch: WriteSet,
}

/// Ordered list of optimistic patches with a cached folded view
#[derive(Debug, Default)]
pub struct OptimisticOverlay {
    entries: Vec<OptimisticEntry>,
    cached: Option<CachedEffective>,
}

#[derive(Debug)]
struct CachedEffective {
    base_revision: u64,
    store: NormalizedStore,
}

impl OptimisticOverlay {
    /// Empty overlay
    pub fn new() -> Self {
        OptimisticOverlay::default()
    }

    /// Install a patch for `mutation_id`. Patches fold in insertion order.
    pub fn add_patch(&mut self, mutation_id: u64, patch: WriteSet) {
        debug!(mutation_id, "installing optimistic patch");
        self.entries.push(OptimisticEntry { mutation_id, patch });
        self.cached = None;
    }

    /// Remove the patch for `mutation_id` (mutation settled either way).
    /// Returns whether a patch was present.
    pub fn remove_patch(&mut self, mutation_id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.mutation_id != mutation_id);
        let removed = self.entries.len() != before;
        if removed {
            debug!(mutation_id, "removed optimistic patch");
            self.cached = None;
        }
        removed
    }

    /// Whether any patch is installed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current entries in fold order
    pub fn entries(&self) -> &[OptimisticEntry] {
        &self.entries
    }

    /// Replace all entries (snapshot hydration)
    pub fn restore_entries(&mut self, entries: Vec<OptimisticEntry>) {
        self.entries = entries;
        self.cached = None;
    }

    /// Drop every patch and the cached view (store reset)
    pub fn clear(&mut self) {
        self.entries.clear();
        self.cached = None;
    }

    /// The effective store: `base` with every patch folded in.
    ///
    /// Returns `base` itself when no patch is installed, so records keep
    /// pointer identity with the base store wherever patches did not touch
    /// them — the reader's memoization carries over transparently.
    pub fn effective<'a>(&'a mut self, base: &'a NormalizedStore) -> &'a NormalizedStore {
        if self.entries.is_empty() {
            return base;
        }
        let stale = match &self.cached {
            Some(cached) => cached.base_revision != base.revision(),
            None => true,
        };
        if stale {
            let mut store = base.clone();
            for entry in &self.entries {
                store.apply(&entry.patch);
            }
            self.cached = Some(CachedEffective {
                base_revision: base.revision(),
                store,
            });
        }
        match &self.cached {
            Some(cached) => &cached.store,
            None => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphcache_core::{RecordId, StorageKey, StoreValue};
    use std::sync::Arc;

    fn patch(id: &str, field: &str, value: StoreValue) -> WriteSet {
        let mut writes = WriteSet::new();
        writes.insert_field(&RecordId::new(id), StorageKey::bare(field), value);
        writes
    }

    fn string_at(store: &NormalizedStore, id: &str, field: &str) -> Option<String> {
        store.get(&RecordId::new(id)).and_then(|record| {
            match record.get(&StorageKey::bare(field)) {
                Some(StoreValue::String(s)) => Some(s.clone()),
                _ => None,
            }
        })
    }

    #[test]
    fn effective_is_base_when_no_patches() {
        let mut overlay = OptimisticOverlay::new();
        let mut base = NormalizedStore::new();
        base.apply(&patch("A", "name", StoreValue::String("X".into())));
        let effective = overlay.effective(&base);
        assert_eq!(string_at(effective, "A", "name"), Some("X".into()));
    }

    #[test]
    fn patch_shadows_base_and_rollback_restores_exactly() {
        let mut base = NormalizedStore::new();
        base.apply(&patch("A", "name", StoreValue::String("X".into())));

        let mut overlay = OptimisticOverlay::new();
        overlay.add_patch(1, patch("A", "name", StoreValue::String("Y (optimistic)".into())));
        assert_eq!(
            string_at(overlay.effective(&base), "A", "name"),
            Some("Y (optimistic)".into())
        );

        assert!(overlay.remove_patch(1));
        assert_eq!(string_at(overlay.effective(&base), "A", "name"), Some("X".into()));
        // No residue: the effective store is the base store itself again.
        assert!(overlay.is_empty());
    }

    #[test]
    fn patches_fold_in_insertion_order() {
        let base = NormalizedStore::new();
        let mut overlay = OptimisticOverlay::new();
        overlay.add_patch(1, patch("A", "name", StoreValue::String("first".into())));
        overlay.add_patch(2, patch("A", "name", StoreValue::String("second".into())));
        assert_eq!(
            string_at(overlay.effective(&base), "A", "name"),
            Some("second".into())
        );

        // Removing the later patch re-exposes the earlier one.
        overlay.remove_patch(2);
        assert_eq!(
            string_at(overlay.effective(&base), "A", "name"),
            Some("first".into())
        );
    }

    #[test]
    fn base_write_invalidates_cached_fold() {
        let mut base = NormalizedStore::new();
        base.apply(&patch("A", "name", StoreValue::String("X".into())));

        let mut overlay = OptimisticOverlay::new();
        overlay.add_patch(1, patch("B", "v", StoreValue::Int(1)));
        let _ = overlay.effective(&base);

        base.apply(&patch("A", "name", StoreValue::String("Z".into())));
        let effective = overlay.effective(&base);
        assert_eq!(string_at(effective, "A", "name"), Some("Z".into()));
        assert!(effective.contains(&RecordId::new("B")));
    }

    #[test]
    fn untouched_records_keep_pointer_identity_through_overlay() {
        let mut base = NormalizedStore::new();
        base.apply(&patch("A", "name", StoreValue::String("X".into())));
        base.apply(&patch("B", "v", StoreValue::Int(1)));

        let mut overlay = OptimisticOverlay::new();
        overlay.add_patch(1, patch("B", "v", StoreValue::Int(2)));
        let untouched_before = Arc::clone(base.get(&RecordId::new("A")).unwrap());
        let effective = overlay.effective(&base);
        assert!(Arc::ptr_eq(
            &untouched_before,
            effective.get(&RecordId::new("A")).unwrap()
        ));
    }

    #[test]
    fn remove_unknown_patch_is_a_no_op() {
        let mut overlay = OptimisticOverlay::new();
        assert!(!overlay.remove_patch(42));
    }
}
