//! Snapshot extraction and hydration through the manager.

mod common;

use common::{user_doc, user_json, MockTransport};
use graphcache::{CacheSnapshot, Error, FetchPolicy, QueryManager, Variables};
use serde_json::json;

#[tokio::test]
async fn extracted_state_hydrates_a_fresh_manager() {
    let transport = MockTransport::new();
    transport.respond_with(user_json("1", "Ada"));
    let source = QueryManager::new(transport.clone());
    source
        .query(user_doc(), Variables::new(), FetchPolicy::CacheFirst)
        .await
        .unwrap();

    // Round-trip through the serialized form, as a hydration payload would.
    let text = serde_json::to_string(&source.extract()).unwrap();
    let snapshot: CacheSnapshot = serde_json::from_str(&text).unwrap();

    let offline_transport = MockTransport::new();
    let hydrated = QueryManager::new(offline_transport.clone());
    hydrated.restore(snapshot).unwrap();

    let result = hydrated
        .query(user_doc(), Variables::new(), FetchPolicy::CacheFirst)
        .await
        .unwrap();
    assert_eq!(offline_transport.calls(), 0);
    assert_eq!(
        result.data.unwrap().to_json().pointer("/user/name"),
        Some(&json!("Ada"))
    );
}

#[tokio::test]
async fn snapshots_with_lifecycle_state_are_rejected() {
    let transport = MockTransport::new();
    let manager = QueryManager::new(transport.clone());

    let snapshot: CacheSnapshot = serde_json::from_value(json!({
        "data": {},
        "queries": {"1": {"networkStatus": 7}}
    }))
    .unwrap();
    let err = manager.restore(snapshot).unwrap_err();
    assert!(matches!(err, Error::InvalidSnapshot(_)));
}
