//! Shared test fixtures: a scriptable transport, document builders, and
//! small synchronization helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use graphcache::{
    field, Document, Error, GraphQlRequest, GraphQlResponse, QueryResult, Result, Transport,
    Variables,
};
use parking_lot::Mutex;
use serde_json::{json, Value as Json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scripted transport. Each request pops the next queued response, after an
/// optional simulated latency. An exhausted script answers with a network
/// error so a test that over-fetches fails loudly.
pub struct MockTransport {
    script: Mutex<VecDeque<Result<GraphQlResponse>>>,
    latency: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(MockTransport {
            script: Mutex::new(VecDeque::new()),
            latency: Mutex::new(None),
            calls: AtomicUsize::new(0),
        })
    }

    /// Queue a successful response carrying `data`
    pub fn respond_with(&self, data: Json) {
        self.script
            .lock()
            .push_back(Ok(GraphQlResponse::data(data)));
    }

    /// Queue a raw response (e.g. one carrying GraphQL errors)
    pub fn respond(&self, response: Result<GraphQlResponse>) {
        self.script.lock().push_back(response);
    }

    /// Queue a transport failure
    pub fn fail_with(&self, message: &str) {
        self.script
            .lock()
            .push_back(Err(Error::Network(message.to_string())));
    }

    /// Delay every response by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Number of requests executed so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, _request: GraphQlRequest) -> Result<GraphQlResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Network("script exhausted".into())))
    }
}

/// Collects every result delivered to an observer
#[derive(Clone, Default)]
pub struct ResultLog {
    results: Arc<Mutex<Vec<QueryResult>>>,
}

impl ResultLog {
    pub fn new() -> Self {
        ResultLog::default()
    }

    /// An observer closure that appends to this log
    pub fn observer(&self) -> impl Fn(QueryResult) + Send + Sync + 'static {
        let results = Arc::clone(&self.results);
        move |result| results.lock().push(result)
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn last(&self) -> Option<QueryResult> {
        self.results.lock().last().cloned()
    }

    pub fn snapshot(&self) -> Vec<QueryResult> {
        self.results.lock().clone()
    }

    /// Response-tree names of `user.name` across delivered results, for
    /// compact assertions
    pub fn user_names(&self) -> Vec<Option<String>> {
        self.results
            .lock()
            .iter()
            .map(|result| {
                result
                    .data
                    .as_ref()
                    .map(|data| data.to_json())
                    .and_then(|json| {
                        json.pointer("/user/name")
                            .and_then(Json::as_str)
                            .map(str::to_string)
                    })
            })
            .collect()
    }
}

/// `{ user { __typename id name } }`
pub fn user_doc() -> Arc<Document> {
    Arc::new(Document::query([field("user")
        .select([
            field("__typename").into(),
            field("id").into(),
            field("name").into(),
        ])
        .into()]))
}

/// `user_doc` with an operation name, for refetch-by-name scenarios
pub fn named_user_doc(name: &str) -> Arc<Document> {
    Arc::new(
        Document::query([field("user")
            .select([
                field("__typename").into(),
                field("id").into(),
                field("name").into(),
            ])
            .into()])
        .named(name),
    )
}

/// `mutation { updateUser { __typename id name } }`
pub fn update_user_doc() -> Arc<Document> {
    Arc::new(Document::mutation([field("updateUser")
        .select([
            field("__typename").into(),
            field("id").into(),
            field("name").into(),
        ])
        .into()]))
}

/// A `{ user: { ... } }` response tree
pub fn user_json(id: &str, name: &str) -> Json {
    json!({"user": {"__typename": "User", "id": id, "name": name}})
}

/// An `{ updateUser: { ... } }` mutation response tree
pub fn update_user_json(id: &str, name: &str) -> Json {
    json!({"updateUser": {"__typename": "User", "id": id, "name": name}})
}

/// Variables from a JSON object literal
pub fn vars(value: Json) -> Variables {
    match value {
        Json::Object(map) => map,
        other => panic!("variables must be an object, got {other}"),
    }
}

/// Route tracing output through the test harness (once per process)
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Await `cond`, yielding to background tasks between checks
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not met within timeout");
}
