//! Query orchestration atop the normalized store
//!
//! The engine layers live queries over `graphcache-store`: each watched
//! query is a small state machine (network status, request dedup, observer
//! list) driven by cache diffs and transport completions. A scheduler groups
//! polling queries by interval so equal intervals share one timer.
//!
//! Entry point: [`QueryManager`].

#![warn(missing_docs)]
#![warn(clippy::all)]

mod manager;
mod query;
mod scheduler;
mod status;
mod transport;

pub use manager::{
    CacheTransaction, MutationOptions, MutationResult, QueryManager, QueryManagerBuilder,
    Subscription, UpdateFn, WatchedQuery,
};
pub use query::{FetchPolicy, ObserverFn, QueryId, QueryResult, WatchQueryOptions};
pub use status::NetworkStatus;
pub use transport::{GraphQlRequest, GraphQlResponse, Transport};
