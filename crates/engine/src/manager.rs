//! QueryManager: per-query state machines, fetch orchestration, mutations
//!
//! The manager owns the store, the optimistic overlay and the read memo
//! behind one mutex (single-writer model). Transport completions each
//! enqueue exactly one atomic write; reads, diffs, overlay folds and
//! state-machine transitions all execute synchronously against a single
//! store revision. The transport call is the only suspension point, and the
//! lock is never held across it.
//!
//! Observer callbacks are collected while the lock is held and invoked after
//! it is released, so a subscriber may call back into the manager.

use crate::query::{
    FetchPolicy, ObserverFn, QueryId, QueryRecord, QueryResult, WatchQueryOptions,
};
use crate::scheduler::QueryScheduler;
use crate::status::NetworkStatus;
use crate::transport::{GraphQlRequest, GraphQlResponse, Transport};
use graphcache_core::{
    Document, Error, FragmentMatcher, GraphQlErrors, IdentityFn, Result, TypenameMatcher,
    Variables, ROOT_MUTATION, ROOT_QUERY,
};
use graphcache_store::{
    extract, read_result, restore, write_result, CacheSnapshot, DiffResult, DiffValue,
    NormalizedStore, OptimisticOverlay, ReadCache, ReadRequest, WriteRequest, WriteSet,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Options for one mutation
pub struct MutationOptions {
    /// Parsed mutation document
    pub document: Arc<Document>,
    /// Variable bindings
    pub variables: Variables,
    /// Speculative result installed as an optimistic patch until the real
    /// result (or an error) arrives
    pub optimistic_response: Option<Json>,
    /// Transaction-scoped update callback run after the real result is
    /// written; its recorded writes are replayed atomically
    pub update: Option<UpdateFn>,
    /// Names of active queries to refetch (network-only) after success
    pub refetch_queries: Vec<String>,
}

/// Update callback signature. An error here is recorded as the sticky
/// reducer error instead of failing the mutation.
pub type UpdateFn = Box<dyn FnOnce(&mut CacheTransaction<'_>) -> Result<()> + Send>;

impl MutationOptions {
    /// Options with defaults
    pub fn new(document: Arc<Document>) -> Self {
        MutationOptions {
            document,
            variables: Variables::new(),
            optimistic_response: None,
            update: None,
            refetch_queries: Vec::new(),
        }
    }

    /// Set variables
    pub fn variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    /// Install `response` optimistically while the mutation is in flight
    pub fn optimistic_response(mut self, response: Json) -> Self {
        self.optimistic_response = Some(response);
        self
    }

    /// Run `update` against a transaction-scoped cache proxy on success
    pub fn update(
        mut self,
        update: impl FnOnce(&mut CacheTransaction<'_>) -> Result<()> + Send + 'static,
    ) -> Self {
        self.update = Some(Box::new(update));
        self
    }

    /// Refetch the named active queries after success
    pub fn refetch_queries(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.refetch_queries = names.into_iter().collect();
        self
    }
}

/// Result of a settled mutation
#[derive(Debug, Clone)]
pub struct MutationResult {
    /// The result tree returned by the server
    pub data: Option<Json>,
}

/// Transaction-scoped cache proxy handed to mutation `update` callbacks.
///
/// Reads and writes go against a scratch copy of the base store; the scratch
/// replaces the base atomically when the callback finishes without error, so
/// a failing callback leaves the store untouched.
pub struct CacheTransaction<'a> {
    scratch: NormalizedStore,
    identity: Option<&'a IdentityFn>,
    matcher: &'a dyn FragmentMatcher,
    mutation_data: &'a Json,
}

impl CacheTransaction<'_> {
    /// The mutation's result tree, for convenience
    pub fn mutation_result(&self) -> &Json {
        self.mutation_data
    }

    /// Read a query against the transaction's view
    pub fn read_query(&self, document: &Document, variables: &Variables) -> Result<DiffResult> {
        let mut cache = ReadCache::new();
        read_result(
            &self.scratch,
            &ReadRequest {
                document,
                variables,
                root_id: ROOT_QUERY.clone(),
            },
            self.matcher,
            &mut cache,
        )
    }

    /// Record a write; visible to later reads in this transaction and
    /// replayed atomically on commit
    pub fn write_query(
        &mut self,
        document: &Document,
        variables: &Variables,
        data: &Json,
    ) -> Result<()> {
        let writes = write_result(
            &self.scratch,
            &WriteRequest {
                document,
                variables,
                root_id: ROOT_QUERY.clone(),
                result: data,
            },
            self.identity,
        )?;
        self.scratch.apply(&writes);
        Ok(())
    }
}

/// One pending notification, dispatched after the state lock is released
struct Notification {
    observers: Vec<ObserverFn>,
    result: QueryResult,
}

type Notifications = Vec<Notification>;

fn dispatch(notifications: Notifications) {
    for notification in notifications {
        for observer in &notification.observers {
            (**observer)(notification.result.clone());
        }
    }
}

/// Everything a fetch needs once the lock is released
struct FetchPlan {
    query_id: QueryId,
    request_id: u64,
    reset_generation: u64,
    document: Arc<Document>,
    variables: Variables,
}

pub(crate) struct CacheState {
    pub(crate) store: NormalizedStore,
    pub(crate) overlay: OptimisticOverlay,
    pub(crate) read_cache: ReadCache,
    pub(crate) queries: FxHashMap<QueryId, QueryRecord>,
    /// Sticky error from a failed write, kept so a single bad write does not
    /// stop the cache from being inspectable
    pub(crate) reducer_error: Option<Error>,
}

pub(crate) struct ManagerInner {
    transport: Arc<dyn Transport>,
    identity: Option<IdentityFn>,
    matcher: Arc<dyn FragmentMatcher>,
    pub(crate) state: Mutex<CacheState>,
    query_ids: AtomicU64,
    request_ids: AtomicU64,
    mutation_ids: AtomicU64,
    observer_ids: AtomicU64,
    /// Bumped on every store reset; in-flight fetches from an older
    /// generation are rejected with `Error::StoreReset`
    reset_generation: AtomicU64,
    scheduler: QueryScheduler,
    /// Self-handle for spawning background fetches; set at construction
    weak_self: Weak<ManagerInner>,
}

impl ManagerInner {
    fn next_query_id(&self) -> QueryId {
        QueryId(self.query_ids.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn next_request_id(&self) -> u64 {
        self.request_ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn next_mutation_id(&self) -> u64 {
        self.mutation_ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Diff `document`/`variables` against the effective store
    fn diff(state: &mut CacheState, matcher: &dyn FragmentMatcher, document: &Document, variables: &Variables) -> Result<DiffResult> {
        let effective = state.overlay.effective(&state.store);
        read_result(
            effective,
            &ReadRequest {
                document,
                variables,
                root_id: ROOT_QUERY.clone(),
            },
            matcher,
            &mut state.read_cache,
        )
    }

    /// Visible data from a diff: an empty, incomplete object reads as "no
    /// data yet" rather than `{}`
    fn data_from_diff(diff: &DiffResult) -> Option<DiffValue> {
        if diff.result.is_empty_object() && !diff.complete {
            None
        } else {
            Some(diff.result.clone())
        }
    }

    /// Stage a fetch: assign the request id, flip status, and queue the
    /// loading-state notification
    fn prepare_fetch(
        &self,
        state: &mut CacheState,
        query_id: QueryId,
        status: NetworkStatus,
        variables_override: Option<Variables>,
        notifications: &mut Notifications,
    ) -> Option<FetchPlan> {
        let qr = state.queries.get_mut(&query_id)?;
        let request_id = self.next_request_id();
        qr.last_request_id = request_id;
        qr.in_flight = true;
        qr.network_status = status;
        if qr.last_result.is_some() && status != NetworkStatus::Loading {
            // The shown data is a last-known value about to be superseded.
            qr.stale = true;
        }
        notifications.push(Notification {
            observers: qr.observers.iter().map(|(_, o)| Arc::clone(o)).collect(),
            result: qr.current_result(),
        });
        debug!(%query_id, request_id, ?status, "fetch staged");
        Some(FetchPlan {
            query_id,
            request_id,
            reset_generation: self.reset_generation.load(Ordering::SeqCst),
            document: Arc::clone(&qr.document),
            variables: variables_override.unwrap_or_else(|| qr.variables.clone()),
        })
    }

    fn spawn_fetch(&self, plan: FetchPlan) {
        let Some(inner) = self.weak_self.upgrade() else { return };
        tokio::spawn(async move {
            if let Err(error) = inner.run_fetch(plan).await {
                debug!(%error, "background fetch settled with error");
            }
        });
    }

    async fn run_fetch(&self, plan: FetchPlan) -> Result<QueryResult> {
        let request = GraphQlRequest {
            document: Arc::clone(&plan.document),
            variables: plan.variables.clone(),
            operation_name: plan.document.name.clone(),
        };
        let response = self.transport.execute(request).await;
        self.complete_fetch(plan, response)
    }

    /// Apply one settled transport call: one atomic write, then fan-out.
    fn complete_fetch(
        &self,
        plan: FetchPlan,
        response: Result<GraphQlResponse>,
    ) -> Result<QueryResult> {
        let mut notifications = Notifications::new();
        let outcome = {
            let mut state = self.state.lock();
            self.settle(&mut state, plan, response, &mut notifications)
        };
        dispatch(notifications);
        outcome
    }

    fn settle(
        &self,
        state: &mut CacheState,
        plan: FetchPlan,
        response: Result<GraphQlResponse>,
        notifications: &mut Notifications,
    ) -> Result<QueryResult> {
        if self.reset_generation.load(Ordering::SeqCst) != plan.reset_generation {
            // The store was reset while this request was in flight.
            if let Some(qr) = state.queries.get_mut(&plan.query_id) {
                if qr.last_request_id == plan.request_id {
                    qr.in_flight = false;
                }
            }
            return Err(Error::StoreReset);
        }
        let Some(qr) = state.queries.get_mut(&plan.query_id) else {
            // Last observer unsubscribed; the response is not delivered.
            debug!(query_id = %plan.query_id, "response for inactive query discarded");
            return Err(Error::Network("query is no longer active".into()));
        };
        if qr.last_request_id != plan.request_id {
            warn!(
                query_id = %plan.query_id,
                request_id = plan.request_id,
                latest = qr.last_request_id,
                "stale response discarded"
            );
            return Err(Error::Network("superseded by a newer request".into()));
        }
        qr.in_flight = false;

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                qr.network_status = NetworkStatus::Error;
                qr.network_error = Some(error.clone());
                qr.graphql_errors = GraphQlErrors::default();
                notifications.push(Self::notification_for(qr));
                return Err(error);
            }
        };
        if response.has_errors() {
            // Presence of errors always rejects the observer, even if
            // partial data was returned alongside them.
            qr.network_status = NetworkStatus::Error;
            qr.graphql_errors = response.errors.clone();
            qr.network_error = None;
            notifications.push(Self::notification_for(qr));
            return Err(Error::GraphQl(response.errors));
        }
        let Some(data) = response.data else {
            let error = Error::Network("server returned neither data nor errors".into());
            qr.network_status = NetworkStatus::Error;
            qr.network_error = Some(error.clone());
            notifications.push(Self::notification_for(qr));
            return Err(error);
        };

        let document = Arc::clone(&qr.document);
        let write = write_result(
            &state.store,
            &WriteRequest {
                document: &document,
                variables: &plan.variables,
                root_id: ROOT_QUERY.clone(),
                result: &data,
            },
            self.identity.as_ref(),
        );
        match write {
            Ok(writes) => {
                state.store.apply(&writes);
                let qr = match state.queries.get_mut(&plan.query_id) {
                    Some(qr) => qr,
                    None => return Err(Error::Network("query is no longer active".into())),
                };
                qr.network_status = NetworkStatus::Ready;
                qr.graphql_errors = GraphQlErrors::default();
                qr.network_error = None;
                qr.stale = false;
                qr.previous_variables = None;
                self.broadcast(state, Some(plan.query_id), notifications);
                let qr = state
                    .queries
                    .get(&plan.query_id)
                    .ok_or_else(|| Error::Network("query is no longer active".into()))?;
                Ok(qr.current_result())
            }
            Err(error) => {
                // A failed write is fatal to this query's attempt only; the
                // rest of the store stays intact and readable.
                state.reducer_error = Some(error.clone());
                let qr = match state.queries.get_mut(&plan.query_id) {
                    Some(qr) => qr,
                    None => return Err(error),
                };
                qr.network_status = NetworkStatus::Error;
                qr.network_error = Some(error.clone());
                notifications.push(Self::notification_for(qr));
                Err(error)
            }
        }
    }

    fn notification_for(qr: &QueryRecord) -> Notification {
        Notification {
            observers: qr.observers.iter().map(|(_, o)| Arc::clone(o)).collect(),
            result: qr.current_result(),
        }
    }

    /// Re-diff every observed query against the effective store and notify
    /// the ones whose visible result changed. `force` always notifies that
    /// query (its status changed even if its data did not).
    fn broadcast(
        &self,
        state: &mut CacheState,
        force: Option<QueryId>,
        notifications: &mut Notifications,
    ) {
        let ids: Vec<QueryId> = state.queries.keys().copied().collect();
        for id in ids {
            let Some(qr) = state.queries.get(&id) else { continue };
            let document = Arc::clone(&qr.document);
            let variables = qr.variables.clone();
            let diff = Self::diff(state, self.matcher.as_ref(), &document, &variables);
            let Some(qr) = state.queries.get_mut(&id) else { continue };
            match diff {
                Ok(diff) => {
                    let data = Self::data_from_diff(&diff);
                    let unchanged = match (&qr.last_result, &data) {
                        (Some(a), Some(b)) => a.ptr_eq(b),
                        (None, None) => true,
                        _ => false,
                    } && qr.last_complete == diff.complete;
                    qr.last_result = data;
                    qr.last_complete = diff.complete;
                    if !unchanged || force == Some(id) {
                        notifications.push(Self::notification_for(qr));
                    }
                }
                Err(error) => {
                    qr.network_status = NetworkStatus::Error;
                    qr.network_error = Some(error);
                    notifications.push(Self::notification_for(qr));
                }
            }
        }
    }

    /// First-subscribe transition: consult the cache per fetch policy and
    /// decide whether a network fetch is needed.
    fn start_query(
        &self,
        state: &mut CacheState,
        query_id: QueryId,
        notifications: &mut Notifications,
    ) -> Option<FetchPlan> {
        let Some(qr) = state.queries.get(&query_id) else { return None };
        let policy = qr.fetch_policy;
        let document = Arc::clone(&qr.document);
        let variables = qr.variables.clone();

        let cached = match policy {
            FetchPolicy::NetworkOnly => None,
            _ => match Self::diff(state, self.matcher.as_ref(), &document, &variables) {
                Ok(diff) => Some(diff),
                Err(error) => {
                    if let Some(qr) = state.queries.get_mut(&query_id) {
                        qr.network_status = NetworkStatus::Error;
                        qr.network_error = Some(error);
                        notifications.push(Self::notification_for(qr));
                    }
                    return None;
                }
            },
        };

        let qr = state.queries.get_mut(&query_id)?;
        match policy {
            FetchPolicy::CacheOnly => {
                // Never fetches; whatever the cache holds is the answer.
                let diff = cached?;
                qr.last_result = Self::data_from_diff(&diff);
                qr.last_complete = diff.complete;
                qr.network_status = NetworkStatus::Ready;
                notifications.push(Self::notification_for(qr));
                None
            }
            FetchPolicy::CacheFirst => {
                let diff = cached?;
                if diff.complete {
                    qr.last_result = Self::data_from_diff(&diff);
                    qr.last_complete = true;
                    qr.network_status = NetworkStatus::Ready;
                    notifications.push(Self::notification_for(qr));
                    None
                } else {
                    self.prepare_fetch(state, query_id, NetworkStatus::Loading, None, notifications)
                }
            }
            FetchPolicy::NetworkOnly => {
                self.prepare_fetch(state, query_id, NetworkStatus::Loading, None, notifications)
            }
            FetchPolicy::CacheAndNetwork => {
                // Serve whatever the cache has immediately, then fetch.
                if let Some(diff) = cached {
                    if let Some(data) = Self::data_from_diff(&diff) {
                        qr.last_result = Some(data);
                        qr.last_complete = diff.complete;
                    }
                }
                self.prepare_fetch(state, query_id, NetworkStatus::Loading, None, notifications)
            }
        }
    }

    pub(crate) fn watch_query(&self, options: WatchQueryOptions) -> QueryId {
        let query_id = self.next_query_id();
        let record = QueryRecord::new(query_id, options);
        info!(%query_id, "watching query");
        self.state.lock().queries.insert(query_id, record);
        query_id
    }

    pub(crate) fn subscribe(
        &self,
        query_id: QueryId,
        observer: ObserverFn,
    ) -> Option<u64> {
        let observer_id = self.observer_ids.fetch_add(1, Ordering::SeqCst) + 1;
        let mut notifications = Notifications::new();
        let mut plan = None;
        let mut poll_interval = None;
        {
            let mut state = self.state.lock();
            let qr = state.queries.get_mut(&query_id)?;
            qr.observers.push((observer_id, Arc::clone(&observer)));
            if qr.started {
                // Late subscriber: deliver the current snapshot to it alone.
                notifications.push(Notification {
                    observers: vec![observer],
                    result: qr.current_result(),
                });
            } else {
                qr.started = true;
                poll_interval = qr.poll_interval;
                plan = self.start_query(&mut state, query_id, &mut notifications);
            }
        }
        dispatch(notifications);
        if let Some(plan) = plan {
            self.spawn_fetch(plan);
        }
        if let Some(interval) = poll_interval {
            if let Err(error) = self.start_polling(query_id, interval) {
                warn!(%query_id, %error, "polling not started");
            }
        }
        Some(observer_id)
    }

    pub(crate) fn unsubscribe(&self, query_id: QueryId, observer_id: u64) {
        let removed = {
            let mut state = self.state.lock();
            let Some(qr) = state.queries.get_mut(&query_id) else { return };
            qr.observers.retain(|(id, _)| *id != observer_id);
            if qr.observers.is_empty() {
                // An in-flight fetch may still complete; it is simply not
                // delivered.
                state.queries.remove(&query_id);
                state.read_cache.sweep();
                info!(%query_id, "query destroyed (last subscriber gone)");
                true
            } else {
                false
            }
        };
        if removed {
            self.scheduler.stop_polling(query_id);
        }
    }

    pub(crate) fn current_result(&self, query_id: QueryId) -> Option<QueryResult> {
        self.state
            .lock()
            .queries
            .get(&query_id)
            .map(QueryRecord::current_result)
    }

    pub(crate) async fn refetch(&self, query_id: QueryId) -> Result<QueryResult> {
        let plan = {
            let mut state = self.state.lock();
            let qr = state
                .queries
                .get(&query_id)
                .ok_or_else(|| Error::InvalidOperation(format!("{} is not active", query_id)))?;
            if qr.fetch_policy == FetchPolicy::CacheOnly {
                return Err(Error::InvalidOperation(
                    "cannot refetch a cache-only query".into(),
                ));
            }
            let mut notifications = Notifications::new();
            let plan = self.prepare_fetch(
                &mut state,
                query_id,
                NetworkStatus::Refetch,
                None,
                &mut notifications,
            );
            drop(state);
            dispatch(notifications);
            plan.ok_or_else(|| Error::InvalidOperation(format!("{} is not active", query_id)))?
        };
        self.run_fetch(plan).await
    }

    pub(crate) async fn set_variables(
        &self,
        query_id: QueryId,
        variables: Variables,
    ) -> Result<QueryResult> {
        let plan = {
            let mut notifications = Notifications::new();
            let mut state = self.state.lock();
            let qr = state
                .queries
                .get_mut(&query_id)
                .ok_or_else(|| Error::InvalidOperation(format!("{} is not active", query_id)))?;
            if qr.variables == variables {
                // Unchanged variables: no network request, no notification.
                return Ok(qr.current_result());
            }
            qr.previous_variables = Some(std::mem::replace(&mut qr.variables, variables));
            let policy = qr.fetch_policy;
            if policy == FetchPolicy::CacheOnly {
                let document = Arc::clone(&qr.document);
                let new_variables = qr.variables.clone();
                let diff = Self::diff(&mut state, self.matcher.as_ref(), &document, &new_variables)?;
                let qr = state
                    .queries
                    .get_mut(&query_id)
                    .ok_or_else(|| Error::InvalidOperation(format!("{} is not active", query_id)))?;
                qr.last_result = Self::data_from_diff(&diff);
                qr.last_complete = diff.complete;
                qr.previous_variables = None;
                qr.network_status = NetworkStatus::Ready;
                notifications.push(Self::notification_for(qr));
                let result = qr.current_result();
                drop(state);
                dispatch(notifications);
                return Ok(result);
            }
            let plan = self.prepare_fetch(
                &mut state,
                query_id,
                NetworkStatus::SetVariables,
                None,
                &mut notifications,
            );
            drop(state);
            dispatch(notifications);
            plan.ok_or_else(|| Error::InvalidOperation(format!("{} is not active", query_id)))?
        };
        self.run_fetch(plan).await
    }

    pub(crate) async fn fetch_more(
        &self,
        query_id: QueryId,
        extra_variables: Variables,
    ) -> Result<QueryResult> {
        let plan = {
            let mut notifications = Notifications::new();
            let mut state = self.state.lock();
            let qr = state
                .queries
                .get(&query_id)
                .ok_or_else(|| Error::InvalidOperation(format!("{} is not active", query_id)))?;
            if qr.fetch_policy == FetchPolicy::CacheOnly {
                return Err(Error::InvalidOperation(
                    "cannot fetch more on a cache-only query".into(),
                ));
            }
            let mut merged = qr.variables.clone();
            for (name, value) in extra_variables {
                merged.insert(name, value);
            }
            let plan = self.prepare_fetch(
                &mut state,
                query_id,
                NetworkStatus::FetchMore,
                Some(merged),
                &mut notifications,
            );
            drop(state);
            dispatch(notifications);
            plan.ok_or_else(|| Error::InvalidOperation(format!("{} is not active", query_id)))?
        };
        self.run_fetch(plan).await
    }

    /// Scheduled poll tick for one query. Suppressed while a fetch for the
    /// same query id is in flight.
    pub(crate) fn poll_tick(&self, query_id: QueryId) {
        let mut notifications = Notifications::new();
        let plan = {
            let mut state = self.state.lock();
            let Some(qr) = state.queries.get(&query_id) else { return };
            if qr.in_flight {
                debug!(%query_id, "poll tick skipped: fetch already in flight");
                return;
            }
            if qr.fetch_policy == FetchPolicy::CacheOnly {
                return;
            }
            self.prepare_fetch(&mut state, query_id, NetworkStatus::Poll, None, &mut notifications)
        };
        dispatch(notifications);
        if let Some(plan) = plan {
            self.spawn_fetch(plan);
        }
    }

    pub(crate) fn start_polling(
        &self,
        query_id: QueryId,
        interval: Duration,
    ) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::InvalidOperation("poll interval must be positive".into()));
        }
        {
            let state = self.state.lock();
            let qr = state
                .queries
                .get(&query_id)
                .ok_or_else(|| Error::InvalidOperation(format!("{} is not active", query_id)))?;
            if qr.fetch_policy == FetchPolicy::CacheOnly {
                return Err(Error::InvalidOperation(
                    "cannot poll a cache-only query".into(),
                ));
            }
        }
        self.scheduler.start_polling(query_id, interval);
        Ok(())
    }

    pub(crate) fn stop_polling(&self, query_id: QueryId) {
        self.scheduler.stop_polling(query_id);
    }

    /// Clear all records, reject in-flight requests, and refetch every
    /// active non-cache-only query.
    pub(crate) fn reset_store(&self) {
        let mut notifications = Notifications::new();
        let plans = {
            let mut state = self.state.lock();
            info!("store reset");
            state.store.clear();
            state.overlay.clear();
            state.read_cache.clear();
            state.reducer_error = None;
            self.reset_generation.fetch_add(1, Ordering::SeqCst);

            let ids: Vec<QueryId> = state.queries.keys().copied().collect();
            let mut plans = Vec::new();
            for id in ids {
                let Some(qr) = state.queries.get_mut(&id) else { continue };
                if qr.fetch_policy == FetchPolicy::CacheOnly {
                    // Left untouched; it has nothing to re-synchronize.
                    continue;
                }
                qr.last_result = None;
                qr.last_complete = false;
                if let Some(plan) =
                    self.prepare_fetch(&mut state, id, NetworkStatus::Loading, None, &mut notifications)
                {
                    plans.push(plan);
                }
            }
            plans
        };
        dispatch(notifications);
        for plan in plans {
            self.spawn_fetch(plan);
        }
    }

    pub(crate) async fn query(
        &self,
        document: Arc<Document>,
        variables: Variables,
        fetch_policy: FetchPolicy,
    ) -> Result<QueryResult> {
        let options = WatchQueryOptions::new(document)
            .variables(variables)
            .fetch_policy(fetch_policy);
        let query_id = self.watch_query(options);
        let outcome = {
            let mut notifications = Notifications::new();
            let (plan, immediate) = {
                let mut state = self.state.lock();
                if let Some(qr) = state.queries.get_mut(&query_id) {
                    qr.started = true;
                }
                let plan = self.start_query(&mut state, query_id, &mut notifications);
                let immediate = state
                    .queries
                    .get(&query_id)
                    .map(QueryRecord::current_result);
                (plan, immediate)
            };
            dispatch(notifications);
            match plan {
                Some(plan) => self.run_fetch(plan).await,
                None => immediate.ok_or_else(|| {
                    Error::InvalidOperation(format!("{} is not active", query_id))
                }),
            }
        };
        // One-shot: drop the transient record unless someone subscribed.
        let mut state = self.state.lock();
        if state
            .queries
            .get(&query_id)
            .is_some_and(|qr| qr.observers.is_empty())
        {
            state.queries.remove(&query_id);
        }
        outcome
    }

    pub(crate) async fn mutate(&self, options: MutationOptions) -> Result<MutationResult> {
        let mutation_id = self.next_mutation_id();
        let MutationOptions {
            document,
            variables,
            optimistic_response,
            update,
            refetch_queries,
        } = options;

        if let Some(speculative) = &optimistic_response {
            let mut notifications = Notifications::new();
            {
                let mut state = self.state.lock();
                let state = &mut *state;
                let patch = {
                    let effective = state.overlay.effective(&state.store);
                    Self::mutation_write_set(
                        effective,
                        &document,
                        &variables,
                        speculative,
                        self.identity.as_ref(),
                    )?
                };
                state.overlay.add_patch(mutation_id, patch);
                self.broadcast(state, None, &mut notifications);
            }
            dispatch(notifications);
        }

        let request = GraphQlRequest {
            document: Arc::clone(&document),
            variables: variables.clone(),
            operation_name: document.name.clone(),
        };
        let response = self.transport.execute(request).await;

        let mut notifications = Notifications::new();
        let outcome = {
            let mut state = self.state.lock();
            let had_patch = optimistic_response.is_some();
            let result = match response {
                Err(error) => {
                    // Rollback: remove the layer; the base store was never
                    // touched.
                    if had_patch {
                        state.overlay.remove_patch(mutation_id);
                    }
                    Err(error)
                }
                Ok(response) if response.has_errors() => {
                    if had_patch {
                        state.overlay.remove_patch(mutation_id);
                    }
                    Err(Error::GraphQl(response.errors))
                }
                Ok(response) => match response.data {
                    None => {
                        if had_patch {
                            state.overlay.remove_patch(mutation_id);
                        }
                        Err(Error::Network("server returned neither data nor errors".into()))
                    }
                    Some(data) => {
                        if had_patch {
                            state.overlay.remove_patch(mutation_id);
                        }
                        let writes = Self::mutation_write_set(
                            &state.store,
                            &document,
                            &variables,
                            &data,
                            self.identity.as_ref(),
                        );
                        match writes {
                            Ok(writes) => {
                                state.store.apply(&writes);
                                if let Some(update) = update {
                                    self.run_update(&mut state, update, &data);
                                }
                                Ok(MutationResult { data: Some(data) })
                            }
                            Err(error) => {
                                state.reducer_error = Some(error.clone());
                                Err(error)
                            }
                        }
                    }
                },
            };
            self.broadcast(&mut state, None, &mut notifications);
            result
        };
        dispatch(notifications);

        if outcome.is_ok() {
            self.refetch_named_queries(&refetch_queries);
        }
        outcome
    }

    /// Derive the write set for a mutation result. Top-level mutation fields
    /// resolve into the records they reference; the conceptual
    /// `ROOT_MUTATION` record itself is never persisted.
    fn mutation_write_set(
        source: &NormalizedStore,
        document: &Document,
        variables: &Variables,
        data: &Json,
        identity: Option<&IdentityFn>,
    ) -> Result<WriteSet> {
        let mut writes = write_result(
            source,
            &WriteRequest {
                document,
                variables,
                root_id: ROOT_MUTATION.clone(),
                result: data,
            },
            identity,
        )?;
        writes.discard_record(&ROOT_MUTATION);
        Ok(writes)
    }

    /// Run a mutation `update` callback against a scratch store and replay
    /// its writes atomically. A callback error becomes the sticky reducer
    /// error; the base store is left untouched in that case.
    fn run_update(&self, state: &mut CacheState, update: UpdateFn, data: &Json) {
        let mut transaction = CacheTransaction {
            scratch: state.store.clone(),
            identity: self.identity.as_ref(),
            matcher: self.matcher.as_ref(),
            mutation_data: data,
        };
        match update(&mut transaction) {
            Ok(()) => {
                state.store = transaction.scratch;
            }
            Err(error) => {
                warn!(%error, "mutation update callback failed; writes discarded");
                state.reducer_error = Some(error);
            }
        }
    }

    /// Refetch active queries matching the given operation names.
    fn refetch_named_queries(&self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        let mut notifications = Notifications::new();
        let plans = {
            let mut state = self.state.lock();
            let mut plans = Vec::new();
            for name in names {
                let matching: Vec<(QueryId, bool)> = state
                    .queries
                    .values()
                    .filter(|qr| qr.document.name.as_deref() == Some(name.as_str()))
                    .map(|qr| (qr.id, qr.observers.is_empty()))
                    .collect();
                if matching.is_empty() {
                    warn!(query_name = %name, "refetch requested for unknown query name");
                    continue;
                }
                for (id, unobserved) in matching {
                    if unobserved {
                        // Known but unsubscribed: silently ignored.
                        continue;
                    }
                    if let Some(plan) = self.prepare_fetch(
                        &mut state,
                        id,
                        NetworkStatus::Refetch,
                        None,
                        &mut notifications,
                    ) {
                        plans.push(plan);
                    }
                }
            }
            plans
        };
        dispatch(notifications);
        for plan in plans {
            self.spawn_fetch(plan);
        }
    }

    pub(crate) fn read_query(
        &self,
        document: &Document,
        variables: &Variables,
    ) -> Result<DiffResult> {
        let mut state = self.state.lock();
        Self::diff(&mut state, self.matcher.as_ref(), document, variables)
    }

    pub(crate) fn write_query(
        &self,
        document: &Document,
        variables: &Variables,
        data: &Json,
    ) -> Result<()> {
        let mut notifications = Notifications::new();
        {
            let mut state = self.state.lock();
            let writes = write_result(
                &state.store,
                &WriteRequest {
                    document,
                    variables,
                    root_id: ROOT_QUERY.clone(),
                    result: data,
                },
                self.identity.as_ref(),
            )?;
            state.store.apply(&writes);
            self.broadcast(&mut state, None, &mut notifications);
        }
        dispatch(notifications);
        Ok(())
    }

    pub(crate) fn extract(&self) -> CacheSnapshot {
        let state = self.state.lock();
        extract(&state.store, &state.overlay)
    }

    pub(crate) fn restore(&self, snapshot: CacheSnapshot) -> Result<()> {
        let mut notifications = Notifications::new();
        {
            let mut state = self.state.lock();
            let (store, overlay) = restore(snapshot)?;
            state.store = store;
            state.overlay = overlay;
            state.read_cache.clear();
            self.broadcast(&mut state, None, &mut notifications);
        }
        dispatch(notifications);
        Ok(())
    }

    pub(crate) fn reducer_error(&self) -> Option<Error> {
        self.state.lock().reducer_error.clone()
    }
}

/// Builder for [`QueryManager`]
pub struct QueryManagerBuilder {
    transport: Arc<dyn Transport>,
    identity: Option<IdentityFn>,
    matcher: Arc<dyn FragmentMatcher>,
}

impl QueryManagerBuilder {
    /// Supply the identity function (`dataIdFromObject`)
    pub fn identity(mut self, identity: IdentityFn) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Supply the fragment matcher
    pub fn matcher(mut self, matcher: Arc<dyn FragmentMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// Build the manager
    pub fn build(self) -> QueryManager {
        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| ManagerInner {
            transport: self.transport,
            identity: self.identity,
            matcher: self.matcher,
            state: Mutex::new(CacheState {
                store: NormalizedStore::new(),
                overlay: OptimisticOverlay::new(),
                read_cache: ReadCache::new(),
                queries: FxHashMap::default(),
                reducer_error: None,
            }),
            query_ids: AtomicU64::new(0),
            request_ids: AtomicU64::new(0),
            mutation_ids: AtomicU64::new(0),
            observer_ids: AtomicU64::new(0),
            reset_generation: AtomicU64::new(0),
            scheduler: QueryScheduler::new(weak.clone()),
            weak_self: weak.clone(),
        });
        QueryManager { inner }
    }
}

/// The cache engine's public entry point.
///
/// Owns the store, the optimistic overlay and every observed query. Callers
/// construct and hold the manager; there is no ambient singleton.
#[derive(Clone)]
pub struct QueryManager {
    inner: Arc<ManagerInner>,
}

impl QueryManager {
    /// Manager with default collaborators (typename matcher, no identity
    /// function)
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::builder(transport).build()
    }

    /// Start building a manager
    pub fn builder(transport: Arc<dyn Transport>) -> QueryManagerBuilder {
        QueryManagerBuilder {
            transport,
            identity: None,
            matcher: Arc::new(TypenameMatcher),
        }
    }

    /// Register a live query. The first subscriber triggers the initial
    /// fetch per the fetch policy.
    pub fn watch_query(&self, options: WatchQueryOptions) -> WatchedQuery {
        let id = self.inner.watch_query(options);
        WatchedQuery {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    /// One-shot query resolved per `fetch_policy`
    pub async fn query(
        &self,
        document: Arc<Document>,
        variables: Variables,
        fetch_policy: FetchPolicy,
    ) -> Result<QueryResult> {
        self.inner.query(document, variables, fetch_policy).await
    }

    /// Execute a mutation
    pub async fn mutate(&self, options: MutationOptions) -> Result<MutationResult> {
        self.inner.mutate(options).await
    }

    /// Read a query against the effective (optimistic) store, cache only
    pub fn read_query(&self, document: &Document, variables: &Variables) -> Result<DiffResult> {
        self.inner.read_query(document, variables)
    }

    /// Write a result tree directly into the base store
    pub fn write_query(
        &self,
        document: &Document,
        variables: &Variables,
        data: &Json,
    ) -> Result<()> {
        self.inner.write_query(document, variables, data)
    }

    /// Clear all cached records and re-synchronize active queries
    pub fn reset_store(&self) {
        self.inner.reset_store();
    }

    /// Serialize the current store and pending optimistic patches
    pub fn extract(&self) -> CacheSnapshot {
        self.inner.extract()
    }

    /// Hydrate from a snapshot. Only `data` (and optimistic patches) may be
    /// pre-seeded.
    pub fn restore(&self, snapshot: CacheSnapshot) -> Result<()> {
        self.inner.restore(snapshot)
    }

    /// The sticky error from the last failed write, if any
    pub fn reducer_error(&self) -> Option<Error> {
        self.inner.reducer_error()
    }
}

/// Handle to one observed query
pub struct WatchedQuery {
    inner: Arc<ManagerInner>,
    id: QueryId,
}

impl WatchedQuery {
    /// This query's id
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// Subscribe to result deliveries. The first subscription triggers the
    /// initial fetch; dropping the returned handle unsubscribes. Fails when
    /// the query has already been destroyed (its last subscriber left).
    pub fn subscribe(
        &self,
        observer: impl Fn(QueryResult) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        let observer_id = self
            .inner
            .subscribe(self.id, Arc::new(observer))
            .ok_or_else(|| Error::InvalidOperation(format!("{} is not active", self.id)))?;
        Ok(Subscription {
            inner: Arc::downgrade(&self.inner),
            query_id: self.id,
            observer_id,
        })
    }

    /// Current result snapshot, if the query is still active
    pub fn current_result(&self) -> Option<QueryResult> {
        self.inner.current_result(self.id)
    }

    /// Force a network-only fetch, regardless of fetch policy.
    /// Rejected for cache-only queries.
    pub async fn refetch(&self) -> Result<QueryResult> {
        self.inner.refetch(self.id).await
    }

    /// Change variables. Unchanged variables are a no-op: no network
    /// request, no notification. Otherwise the previous result stays
    /// visible (loading, stale) until the new one arrives.
    pub async fn set_variables(&self, variables: Variables) -> Result<QueryResult> {
        self.inner.set_variables(self.id, variables).await
    }

    /// Fetch a follow-up page: `extra_variables` are merged over the
    /// query's variables for this one request.
    pub async fn fetch_more(&self, extra_variables: Variables) -> Result<QueryResult> {
        self.inner.fetch_more(self.id, extra_variables).await
    }

    /// Start polling at `interval`. Rejected for cache-only queries.
    pub fn start_polling(&self, interval: Duration) -> Result<()> {
        self.inner.start_polling(self.id, interval)
    }

    /// Stop polling this query
    pub fn stop_polling(&self) {
        self.inner.stop_polling(self.id)
    }
}

/// Subscription handle; unsubscribes on drop
#[derive(Debug)]
pub struct Subscription {
    inner: Weak<ManagerInner>,
    query_id: QueryId,
    observer_id: u64,
}

impl Subscription {
    /// Explicitly unsubscribe
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.unsubscribe(self.query_id, self.observer_id);
        }
    }
}
