//! Normalization engine for graphcache
//!
//! This crate owns the cache's data plane:
//! - NormalizedStore / WriteSet: the record graph and its atomic write path
//! - writer: flattening result trees into staged mutations
//! - reader: reconstructing (and diffing) result trees with structural
//!   sharing
//! - OptimisticOverlay: speculative patches folded over the base store
//! - snapshot: extract/restore of plain-data cache state

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod optimistic;
pub mod reader;
pub mod snapshot;
pub mod store;
pub mod writer;

pub use optimistic::{OptimisticEntry, OptimisticOverlay};
pub use reader::{read_result, DiffResult, DiffValue, ReadCache, ReadRequest};
pub use snapshot::{extract, restore, CacheSnapshot};
pub use store::{NormalizedStore, RecordSource, WriteSet};
pub use writer::{write_result, WriteRequest};
