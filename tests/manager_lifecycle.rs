//! Query-manager lifecycle: fetch policies, observer delivery, variable
//! changes, error handling, and store reset.

mod common;

use common::{init_tracing, user_doc, user_json, vars, wait_until, MockTransport, ResultLog};
use graphcache::{
    Error, FetchPolicy, GraphQlError, GraphQlResponse, NetworkStatus, QueryManager, Variables,
    WatchQueryOptions,
};
use serde_json::json;

#[tokio::test]
async fn cache_first_fetches_once_then_serves_from_cache() {
    init_tracing();
    let transport = MockTransport::new();
    transport.respond_with(user_json("1", "Ada"));
    let manager = QueryManager::new(transport.clone());

    let first = manager
        .query(user_doc(), Variables::new(), FetchPolicy::CacheFirst)
        .await
        .unwrap();
    assert_eq!(first.network_status, NetworkStatus::Ready);
    assert!(!first.partial);
    assert_eq!(
        first.data.unwrap().to_json().pointer("/user/name"),
        Some(&json!("Ada"))
    );
    assert_eq!(transport.calls(), 1);

    // The cache satisfies the second run completely; no request goes out.
    let second = manager
        .query(user_doc(), Variables::new(), FetchPolicy::CacheFirst)
        .await
        .unwrap();
    assert_eq!(transport.calls(), 1);
    assert_eq!(
        second.data.unwrap().to_json().pointer("/user/name"),
        Some(&json!("Ada"))
    );
}

#[tokio::test]
async fn network_only_bypasses_the_cache_but_writes_through_it() {
    let transport = MockTransport::new();
    transport.respond_with(user_json("1", "Ada"));
    transport.respond_with(user_json("1", "Ada Lovelace"));
    let manager = QueryManager::new(transport.clone());

    manager
        .query(user_doc(), Variables::new(), FetchPolicy::NetworkOnly)
        .await
        .unwrap();
    let second = manager
        .query(user_doc(), Variables::new(), FetchPolicy::NetworkOnly)
        .await
        .unwrap();
    assert_eq!(transport.calls(), 2);

    // The second response was written through: a cache-only read sees it.
    assert_eq!(
        second.data.unwrap().to_json().pointer("/user/name"),
        Some(&json!("Ada Lovelace"))
    );
    let cached = manager
        .query(user_doc(), Variables::new(), FetchPolicy::CacheOnly)
        .await
        .unwrap();
    assert_eq!(transport.calls(), 2);
    assert_eq!(
        cached.data.unwrap().to_json().pointer("/user/name"),
        Some(&json!("Ada Lovelace"))
    );
}

#[tokio::test]
async fn cache_only_on_an_empty_cache_is_partial_and_never_fetches() {
    let transport = MockTransport::new();
    let manager = QueryManager::new(transport.clone());

    let result = manager
        .query(user_doc(), Variables::new(), FetchPolicy::CacheOnly)
        .await
        .unwrap();
    assert_eq!(transport.calls(), 0);
    assert!(result.partial);
    assert!(result.data.is_none());
}

#[tokio::test]
async fn observers_see_loading_then_ready() {
    let transport = MockTransport::new();
    transport.respond_with(user_json("1", "Ada"));
    let manager = QueryManager::new(transport.clone());

    let watched = manager.watch_query(WatchQueryOptions::new(user_doc()));
    let log = ResultLog::new();
    let _sub = watched.subscribe(log.observer()).unwrap();

    wait_until(|| log.last().is_some_and(|r| r.network_status == NetworkStatus::Ready)).await;
    let results = log.snapshot();
    assert!(results[0].loading);
    assert!(results[0].data.is_none());
    let last = results.last().unwrap();
    assert!(!last.loading);
    assert!(!last.partial);
    assert_eq!(
        last.data.as_ref().unwrap().to_json().pointer("/user/name"),
        Some(&json!("Ada"))
    );
}

#[tokio::test]
async fn direct_cache_writes_notify_watchers() {
    let transport = MockTransport::new();
    transport.respond_with(user_json("1", "Ada"));
    let manager = QueryManager::new(transport.clone());

    let watched = manager.watch_query(WatchQueryOptions::new(user_doc()));
    let log = ResultLog::new();
    let _sub = watched.subscribe(log.observer()).unwrap();
    wait_until(|| log.last().is_some_and(|r| r.network_status == NetworkStatus::Ready)).await;

    manager
        .write_query(&user_doc(), &Variables::new(), &user_json("1", "Grace"))
        .unwrap();
    wait_until(|| log.user_names().last() == Some(&Some("Grace".to_string()))).await;
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn unchanged_variables_are_a_no_op() {
    let transport = MockTransport::new();
    transport.respond_with(user_json("1", "Ada"));
    let manager = QueryManager::new(transport.clone());

    let options = WatchQueryOptions::new(user_doc()).variables(vars(json!({"id": "1"})));
    let watched = manager.watch_query(options);
    let log = ResultLog::new();
    let _sub = watched.subscribe(log.observer()).unwrap();
    wait_until(|| log.last().is_some_and(|r| r.network_status == NetworkStatus::Ready)).await;
    let delivered = log.len();

    let result = watched.set_variables(vars(json!({"id": "1"}))).await.unwrap();
    assert_eq!(transport.calls(), 1);
    assert_eq!(log.len(), delivered);
    assert_eq!(result.network_status, NetworkStatus::Ready);
}

#[tokio::test]
async fn changed_variables_keep_previous_data_visible_while_loading() {
    let transport = MockTransport::new();
    transport.respond_with(user_json("1", "Ada"));
    transport.respond_with(user_json("2", "Grace"));
    let manager = QueryManager::new(transport.clone());

    let options = WatchQueryOptions::new(user_doc()).variables(vars(json!({"id": "1"})));
    let watched = manager.watch_query(options);
    let log = ResultLog::new();
    let _sub = watched.subscribe(log.observer()).unwrap();
    wait_until(|| log.last().is_some_and(|r| r.network_status == NetworkStatus::Ready)).await;

    let result = watched.set_variables(vars(json!({"id": "2"}))).await.unwrap();
    assert_eq!(result.network_status, NetworkStatus::Ready);
    assert_eq!(transport.calls(), 2);

    // While the change was in flight an intermediate delivery carried the
    // SetVariables status with the old data still attached.
    let statuses: Vec<NetworkStatus> =
        log.snapshot().iter().map(|r| r.network_status).collect();
    assert!(statuses.contains(&NetworkStatus::SetVariables), "{statuses:?}");
    let during = log
        .snapshot()
        .into_iter()
        .find(|r| r.network_status == NetworkStatus::SetVariables)
        .unwrap();
    assert!(during.stale);
    assert!(during.data.is_some());
}

#[tokio::test]
async fn fetch_more_merges_variables_for_one_request() {
    let transport = MockTransport::new();
    transport.respond_with(user_json("1", "Ada"));
    transport.respond_with(user_json("1", "Ada (page 2)"));
    let manager = QueryManager::new(transport.clone());

    let options = WatchQueryOptions::new(user_doc()).variables(vars(json!({"page": 1})));
    let watched = manager.watch_query(options);
    let log = ResultLog::new();
    let _sub = watched.subscribe(log.observer()).unwrap();
    wait_until(|| log.last().is_some_and(|r| r.network_status == NetworkStatus::Ready)).await;

    let result = watched.fetch_more(vars(json!({"page": 2}))).await.unwrap();
    assert_eq!(result.network_status, NetworkStatus::Ready);
    assert_eq!(transport.calls(), 2);
    // The pagination request was transient: the query's own variables are
    // unchanged, so a no-op set_variables confirms them.
    let confirmed = watched.set_variables(vars(json!({"page": 1}))).await.unwrap();
    assert_eq!(transport.calls(), 2);
    assert_eq!(confirmed.network_status, NetworkStatus::Ready);
    let statuses: Vec<NetworkStatus> =
        log.snapshot().iter().map(|r| r.network_status).collect();
    assert!(statuses.contains(&NetworkStatus::FetchMore), "{statuses:?}");
}

#[tokio::test]
async fn refetching_a_cache_only_query_is_rejected() {
    let transport = MockTransport::new();
    let manager = QueryManager::new(transport.clone());

    let options = WatchQueryOptions::new(user_doc()).fetch_policy(FetchPolicy::CacheOnly);
    let watched = manager.watch_query(options);
    let log = ResultLog::new();
    let _sub = watched.subscribe(log.observer()).unwrap();

    let err = watched.refetch().await.unwrap_err();
    assert!(matches!(err, Error::InvalidOperation(_)));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn graphql_errors_reject_the_result_and_leave_the_store_untouched() {
    let transport = MockTransport::new();
    transport.respond(Ok(GraphQlResponse {
        data: Some(user_json("1", "Ada")),
        errors: vec![GraphQlError::new("boom")].into(),
    }));
    let manager = QueryManager::new(transport.clone());

    let err = manager
        .query(user_doc(), Variables::new(), FetchPolicy::CacheFirst)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::GraphQl(_)));

    // Even the partial data alongside the errors was not written.
    let cached = manager
        .query(user_doc(), Variables::new(), FetchPolicy::CacheOnly)
        .await
        .unwrap();
    assert!(cached.data.is_none());
}

#[tokio::test]
async fn transport_failures_surface_with_error_status() {
    let transport = MockTransport::new();
    transport.fail_with("connection refused");
    let manager = QueryManager::new(transport.clone());

    let watched = manager.watch_query(WatchQueryOptions::new(user_doc()));
    let log = ResultLog::new();
    let _sub = watched.subscribe(log.observer()).unwrap();

    wait_until(|| log.last().is_some_and(|r| r.network_status == NetworkStatus::Error)).await;
    let last = log.last().unwrap();
    assert!(matches!(last.network_error, Some(Error::Network(_))));

    // A later refetch that succeeds clears the error.
    transport.respond_with(user_json("1", "Ada"));
    let recovered = watched.refetch().await.unwrap();
    assert_eq!(recovered.network_status, NetworkStatus::Ready);
    assert!(recovered.network_error.is_none());
}

#[tokio::test]
async fn reset_store_clears_data_and_refetches_active_queries() {
    let transport = MockTransport::new();
    transport.respond_with(user_json("1", "Ada"));
    transport.respond_with(user_json("1", "Ada (fresh)"));
    let manager = QueryManager::new(transport.clone());

    let watched = manager.watch_query(WatchQueryOptions::new(user_doc()));
    let log = ResultLog::new();
    let _sub = watched.subscribe(log.observer()).unwrap();
    wait_until(|| log.last().is_some_and(|r| r.network_status == NetworkStatus::Ready)).await;

    // A cache-only sibling must be left alone by the reset.
    let sibling = manager.watch_query(
        WatchQueryOptions::new(user_doc()).fetch_policy(FetchPolicy::CacheOnly),
    );
    let sibling_log = ResultLog::new();
    let _sibling_sub = sibling.subscribe(sibling_log.observer()).unwrap();
    wait_until(|| sibling_log.len() > 0).await;

    manager.reset_store();
    wait_until(|| log.user_names().last() == Some(&Some("Ada (fresh)".to_string()))).await;
    // Exactly one refetch: the watched query. The cache-only sibling never
    // hits the network.
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn unsubscribing_the_last_observer_destroys_the_query() {
    let transport = MockTransport::new();
    transport.respond_with(user_json("1", "Ada"));
    let manager = QueryManager::new(transport.clone());

    let watched = manager.watch_query(WatchQueryOptions::new(user_doc()));
    let log = ResultLog::new();
    let sub = watched.subscribe(log.observer()).unwrap();
    wait_until(|| log.last().is_some_and(|r| r.network_status == NetworkStatus::Ready)).await;

    sub.unsubscribe();
    assert!(watched.current_result().is_none());

    // The handle is now a dangling reference; subscribing through it fails
    // instead of handing back a dud subscription.
    let err = watched.subscribe(|_| {}).unwrap_err();
    assert!(matches!(err, Error::InvalidOperation(_)));
}
