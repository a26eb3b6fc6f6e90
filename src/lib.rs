//! graphcache: a normalized client-side graph cache with query orchestration
//!
//! Query results are normalized into flat records keyed by stable ids, so
//! every view of an entity reads from one shared source of truth. Live
//! queries re-deliver automatically when a write changes the data they
//! depend on, with pointer-stable sub-results for cheap change detection.
//! Mutations can apply optimistic patches that roll back exactly on failure.
//!
//! The facade re-exports the three layers:
//! - [`graphcache_core`]: documents, values, record ids, errors
//! - [`graphcache_store`]: normalized store, writer, reader, overlay
//! - [`graphcache_engine`]: query manager, transport, polling
//!
//! ```no_run
//! use std::sync::Arc;
//! use graphcache::{Document, FetchPolicy, QueryManager, Variables, field};
//! # fn transport() -> Arc<dyn graphcache::Transport> { unimplemented!() }
//!
//! # async fn demo() -> graphcache::Result<()> {
//! let manager = QueryManager::new(transport());
//! let doc = Arc::new(Document::query([
//!     field("user").select([field("id").into(), field("name").into()]).into(),
//! ]));
//! let result = manager
//!     .query(doc, Variables::new(), FetchPolicy::CacheFirst)
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use graphcache_core::{
    canonical_json, field, fragment, inline_fragment, typename_and_id, ArgValue, Document,
    DocumentCache, Error, Field, FieldPath, FragmentDefinition, FragmentMatch, FragmentMatcher,
    GraphQlError, GraphQlErrors, IdentityFn, InlineFragment, OperationKind, Record, RecordId,
    Reference, Result, Selection, SelectionSet, StorageKey, StoreValue, TypenameMatcher,
    Variables, ROOT_MUTATION, ROOT_QUERY,
};
pub use graphcache_engine::{
    CacheTransaction, FetchPolicy, GraphQlRequest, GraphQlResponse, MutationOptions,
    MutationResult, NetworkStatus, QueryId, QueryManager, QueryManagerBuilder, QueryResult,
    Subscription, Transport, WatchQueryOptions, WatchedQuery,
};
pub use graphcache_store::{
    extract, read_result, restore, write_result, CacheSnapshot, DiffResult, DiffValue,
    NormalizedStore, OptimisticOverlay, ReadCache, ReadRequest, RecordSource, WriteRequest,
    WriteSet,
};
