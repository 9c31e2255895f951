//! Tests for the fetcher

use bytes::Bytes;
use plenum_key::Key;
use serde_json::json;

use super::*;
use crate::error::FetchError;
use crate::stub;

fn key(s: &str) -> Key {
    Key::parse(s).unwrap()
}

#[tokio::test]
async fn test_empty_execute_issues_no_request() {
    let (ds, source) = stub::datastore(json!({}));
    let mut fetch = Fetcher::new(&ds);

    fetch.execute().await.unwrap();

    assert_eq!(source.request_count(), 0);
}

#[tokio::test]
async fn test_lazy_slots_fill_on_execute() {
    let (ds, source) = stub::datastore(json!({
        "topic/1/title": "foo",
        "topic/1/agenda_item_id": 7,
    }));
    let mut fetch = Fetcher::new(&ds);

    let title = fetch.lazy::<String>(key("topic/1/title"));
    let agenda_item = fetch.lazy::<i32>(key("topic/1/agenda_item_id"));
    assert_eq!(title.value(), None);

    fetch.execute().await.unwrap();

    assert_eq!(title.value(), Some(&"foo".to_string()));
    assert_eq!(agenda_item.value(), Some(&7));
    // One batched request for both keys.
    assert_eq!(source.request_count(), 1);
}

#[tokio::test]
async fn test_lazy_absent_value_leaves_slot_empty() {
    let (ds, _source) = stub::datastore(json!({}));
    let mut fetch = Fetcher::new(&ds);

    let title = fetch.lazy::<String>(key("topic/404/title"));
    fetch.execute().await.unwrap();

    assert_eq!(title.value(), None);
    assert!(!title.exists());
}

#[tokio::test]
async fn test_required_field_of_missing_object() {
    let (ds, _source) = stub::datastore(json!({}));
    let mut fetch = Fetcher::new(&ds);

    let _username = fetch.lazy_required::<String>(key("user/404/username"));
    let err = fetch.execute().await.unwrap_err();

    assert!(matches!(err, FetchError::DoesNotExist(k) if k == key("user/404/username")));
}

#[tokio::test]
async fn test_one_error_does_not_poison_the_other_slot() {
    let (ds, _source) = stub::datastore(json!({"topic/1/title": "foo"}));
    let mut fetch = Fetcher::new(&ds);

    let missing = fetch.lazy_required::<String>(key("topic/2/title"));
    let present = fetch.lazy_required::<String>(key("topic/1/title"));

    let err = fetch.execute().await.unwrap_err();
    assert!(err.is_does_not_exist());

    // The failing slot stays empty, the other one is filled.
    assert_eq!(missing.value(), None);
    assert_eq!(present.value(), Some(&"foo".to_string()));
}

#[tokio::test]
async fn test_decode_error_names_the_key() {
    let (ds, _source) = stub::datastore(json!({"topic/1/title": 42}));
    let mut fetch = Fetcher::new(&ds);

    let _title = fetch.lazy::<String>(key("topic/1/title"));
    let err = fetch.execute().await.unwrap_err();

    match err {
        FetchError::Decode { key: k, .. } => assert_eq!(k, key("topic/1/title")),
        other => panic!("expected decode error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_value_sugar() {
    let (ds, _source) = stub::datastore(json!({"topic/1/title": "foo"}));
    let mut fetch = Fetcher::new(&ds);

    let title: Option<String> = fetch.value(key("topic/1/title")).await.unwrap();
    assert_eq!(title.as_deref(), Some("foo"));

    let missing: Option<String> = fetch.value(key("topic/2/title")).await.unwrap();
    assert_eq!(missing, None);
}

#[tokio::test]
async fn test_require_sugar() {
    let (ds, _source) = stub::datastore(json!({"topic/1/title": "foo"}));
    let mut fetch = Fetcher::new(&ds);

    let title: String = fetch.require(key("topic/1/title")).await.unwrap();
    assert_eq!(title, "foo");

    let err = fetch.require::<String>(key("topic/2/title")).await.unwrap_err();
    assert!(err.is_does_not_exist());
}

#[tokio::test]
async fn test_raw_and_decoded_access() {
    let (ds, _source) = stub::datastore(json!({"topic/1/title": "foo"}));
    let mut fetch = Fetcher::new(&ds);

    fetch.want(key("topic/1/title"));
    fetch.want(key("topic/2/title"));
    fetch.execute().await.unwrap();

    assert_eq!(fetch.raw(&key("topic/1/title")), Some(&Bytes::from("\"foo\"")));
    assert_eq!(fetch.raw(&key("topic/2/title")), None);

    let decoded: Option<String> = fetch.decoded(&key("topic/1/title")).unwrap();
    assert_eq!(decoded.as_deref(), Some("foo"));
}

#[tokio::test]
async fn test_touched_records_every_requested_key() {
    let (ds, _source) = stub::datastore(json!({"topic/1/title": "foo"}));
    let mut fetch = Fetcher::new(&ds);

    fetch.want(key("topic/1/title"));
    let _ = fetch.lazy::<String>(key("topic/2/title"));
    fetch.execute().await.unwrap();
    let _: Option<i32> = fetch.value(key("topic/3/agenda_item_id")).await.unwrap();

    let touched = fetch.touched();
    assert_eq!(touched.len(), 3);
    assert!(touched.contains(&key("topic/1/title")));
    assert!(touched.contains(&key("topic/2/title")));
    assert!(touched.contains(&key("topic/3/agenda_item_id")));
}
