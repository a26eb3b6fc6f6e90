//! Per-query state: fetch policy, lifecycle record, delivered results

use crate::status::NetworkStatus;
use graphcache_core::{Document, Error, GraphQlErrors, Variables};
use graphcache_store::DiffValue;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Identifier of one observed query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub(crate) u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query#{}", self.0)
    }
}

/// Configuration governing when a query consults cache vs. network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPolicy {
    /// Read cache; fetch only if the cached result is incomplete
    #[default]
    CacheFirst,
    /// Never fetch. Polling or refetching such a query is an error.
    CacheOnly,
    /// Always fetch, but still write the result through the cache
    NetworkOnly,
    /// Serve cache immediately if present, then always also fetch
    CacheAndNetwork,
}

/// Callback invoked with every delivered result
pub type ObserverFn = Arc<dyn Fn(QueryResult) + Send + Sync>;

/// Options for `watch_query`
#[derive(Clone)]
pub struct WatchQueryOptions {
    /// Parsed query document
    pub document: Arc<Document>,
    /// Variable bindings
    pub variables: Variables,
    /// Cache/network policy
    pub fetch_policy: FetchPolicy,
    /// Poll interval; `None` disables polling
    pub poll_interval: Option<Duration>,
    /// Free-form caller metadata carried on the query record
    pub metadata: Json,
}

impl WatchQueryOptions {
    /// Options with defaults (cache-first, no polling)
    pub fn new(document: Arc<Document>) -> Self {
        WatchQueryOptions {
            document,
            variables: Variables::new(),
            fetch_policy: FetchPolicy::default(),
            poll_interval: None,
            metadata: Json::Null,
        }
    }

    /// Set variables
    pub fn variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    /// Set the fetch policy
    pub fn fetch_policy(mut self, policy: FetchPolicy) -> Self {
        self.fetch_policy = policy;
        self
    }

    /// Enable polling at `interval`
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Attach caller metadata
    pub fn metadata(mut self, metadata: Json) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One result snapshot delivered to subscribers.
///
/// `data` is an immutable, `Arc`-shared tree; callers cannot corrupt cache
/// internals through it.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// The (possibly partial) result tree; `None` when nothing is readable
    pub data: Option<DiffValue>,
    /// Application errors from the last settled fetch
    pub graphql_errors: GraphQlErrors,
    /// Transport failure, or the store-write failure of the last attempt
    pub network_error: Option<Error>,
    /// Lifecycle state
    pub network_status: NetworkStatus,
    /// Whether the status counts as loading
    pub loading: bool,
    /// The data shown is a last-known value about to be superseded
    pub stale: bool,
    /// The data is incomplete with respect to the query
    pub partial: bool,
}

impl QueryResult {
    /// Whether this result carries any error
    pub fn has_errors(&self) -> bool {
        self.network_error.is_some() || !self.graphql_errors.is_empty()
    }
}

/// Internal lifecycle record of one observed query
pub(crate) struct QueryRecord {
    pub(crate) id: QueryId,
    pub(crate) document: Arc<Document>,
    pub(crate) variables: Variables,
    /// Previous variables while a variable change is in flight
    pub(crate) previous_variables: Option<Variables>,
    pub(crate) fetch_policy: FetchPolicy,
    pub(crate) network_status: NetworkStatus,
    pub(crate) graphql_errors: GraphQlErrors,
    pub(crate) network_error: Option<Error>,
    /// Monotonic request counter: responses from stale requests are
    /// discarded on arrival
    pub(crate) last_request_id: u64,
    pub(crate) in_flight: bool,
    pub(crate) stale: bool,
    /// Poll interval requested at watch time; polling starts with the first
    /// subscriber
    pub(crate) poll_interval: Option<Duration>,
    pub(crate) metadata: Json,
    pub(crate) last_result: Option<DiffValue>,
    pub(crate) last_complete: bool,
    /// Whether the first subscriber has kicked off the initial fetch
    pub(crate) started: bool,
    pub(crate) observers: Vec<(u64, ObserverFn)>,
}

impl QueryRecord {
    pub(crate) fn new(id: QueryId, options: WatchQueryOptions) -> Self {
        QueryRecord {
            id,
            document: options.document,
            variables: options.variables,
            previous_variables: None,
            fetch_policy: options.fetch_policy,
            network_status: NetworkStatus::Loading,
            graphql_errors: GraphQlErrors::default(),
            network_error: None,
            last_request_id: 0,
            in_flight: false,
            stale: false,
            poll_interval: options.poll_interval,
            metadata: options.metadata,
            last_result: None,
            last_complete: false,
            started: false,
            observers: Vec::new(),
        }
    }

    /// Snapshot the current state for delivery
    pub(crate) fn current_result(&self) -> QueryResult {
        QueryResult {
            data: self.last_result.clone(),
            graphql_errors: self.graphql_errors.clone(),
            network_error: self.network_error.clone(),
            network_status: self.network_status,
            loading: self.network_status.is_loading(),
            stale: self.stale,
            partial: !self.last_complete,
        }
    }
}
