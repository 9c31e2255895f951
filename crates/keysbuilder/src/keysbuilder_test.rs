//! Tests for request parsing and key expansion

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use plenum_datastore::{BoxError, Datastore, Value, stub};
use plenum_key::Key;
use serde_json::json;

use super::*;

fn key(s: &str) -> Key {
    Key::parse(s).unwrap()
}

fn keys(strs: &[&str]) -> std::collections::HashSet<Key> {
    strs.iter().map(|s| key(s)).collect()
}

/// Unrestricted loader over a stub datastore, counting calls to
/// verify per-wave batching.
struct DsLoader {
    ds: Datastore,
    calls: AtomicUsize,
}

impl DsLoader {
    fn new(ds: Datastore) -> Self {
        Self {
            ds,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ValueLoader for DsLoader {
    async fn values(&self, wanted: Vec<Key>) -> Result<HashMap<Key, Value>, BoxError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.ds.get(&wanted).await?)
    }
}

async fn expand(data: serde_json::Value, request: serde_json::Value) -> std::collections::HashSet<Key> {
    let (ds, _source) = stub::datastore(data);
    let loader = DsLoader::new(ds);
    let requests = parse_body(request.to_string().as_bytes()).unwrap();
    KeysBuilder::new(requests).expand(&loader).await.unwrap()
}

// ============================================================================
// Expansion
// ============================================================================

#[tokio::test]
async fn test_plain_fields() {
    let got = expand(
        json!({}),
        json!({"collection": "user", "ids": [1, 2], "fields": {"username": null}}),
    )
    .await;

    assert_eq!(got, keys(&["user/1/username", "user/2/username"]));
}

#[tokio::test]
async fn test_relation_follows_stored_id() {
    let got = expand(
        json!({"topic/1/agenda_item_id": 7}),
        json!({
            "collection": "topic",
            "ids": [1],
            "fields": {
                "agenda_item_id": {
                    "type": "relation",
                    "collection": "agenda_item",
                    "fields": {"duration": null}
                }
            }
        }),
    )
    .await;

    assert_eq!(got, keys(&["topic/1/agenda_item_id", "agenda_item/7/duration"]));
}

#[tokio::test]
async fn test_relation_with_null_value_yields_no_keys() {
    let got = expand(
        json!({"topic/1/agenda_item_id": null}),
        json!({
            "collection": "topic",
            "ids": [1],
            "fields": {
                "agenda_item_id": {
                    "type": "relation",
                    "collection": "agenda_item",
                    "fields": {"duration": null}
                }
            }
        }),
    )
    .await;

    // The stub treats explicit null as absent; only the relation key
    // itself remains.
    assert_eq!(got, keys(&["topic/1/agenda_item_id"]));
}

#[tokio::test]
async fn test_missing_intermediate_is_empty_not_an_error() {
    let got = expand(
        json!({}),
        json!({
            "collection": "topic",
            "ids": [1],
            "fields": {
                "agenda_item_id": {
                    "type": "relation",
                    "collection": "agenda_item",
                    "fields": {"duration": null}
                }
            }
        }),
    )
    .await;

    assert_eq!(got, keys(&["topic/1/agenda_item_id"]));
}

#[tokio::test]
async fn test_relation_list() {
    let got = expand(
        json!({"meeting/7/group_ids": [10, 11]}),
        json!({
            "collection": "meeting",
            "ids": [7],
            "fields": {
                "group_ids": {
                    "type": "relation-list",
                    "collection": "group",
                    "fields": {"name": null}
                }
            }
        }),
    )
    .await;

    assert_eq!(
        got,
        keys(&["meeting/7/group_ids", "group/10/name", "group/11/name"])
    );
}

#[tokio::test]
async fn test_generic_relation() {
    let got = expand(
        json!({"projection/1/content_object_id": "topic/9"}),
        json!({
            "collection": "projection",
            "ids": [1],
            "fields": {
                "content_object_id": {
                    "type": "generic-relation",
                    "fields": {"title": null}
                }
            }
        }),
    )
    .await;

    assert_eq!(
        got,
        keys(&["projection/1/content_object_id", "topic/9/title"])
    );
}

#[tokio::test]
async fn test_generic_relation_constrained_to_declared_collection() {
    let got = expand(
        json!({"projection/1/content_object_id": "meeting/7"}),
        json!({
            "collection": "projection",
            "ids": [1],
            "fields": {
                "content_object_id": {
                    "type": "generic-relation",
                    "collection": "topic",
                    "fields": {"title": null}
                }
            }
        }),
    )
    .await;

    // The stored value points outside the declared collection.
    assert_eq!(got, keys(&["projection/1/content_object_id"]));
}

#[tokio::test]
async fn test_generic_relation_list() {
    let got = expand(
        json!({"agenda_item/1/tag_ids": ["tag/3", "tag/4"]}),
        json!({
            "collection": "agenda_item",
            "ids": [1],
            "fields": {
                "tag_ids": {
                    "type": "generic-relation-list",
                    "fields": {"name": null}
                }
            }
        }),
    )
    .await;

    assert_eq!(
        got,
        keys(&["agenda_item/1/tag_ids", "tag/3/name", "tag/4/name"])
    );
}

#[tokio::test]
async fn test_template_without_sub_descriptor() {
    let got = expand(
        json!({"user/1/group_ids$": ["7", "8"]}),
        json!({
            "collection": "user",
            "ids": [1],
            "fields": {"group_ids$": {"type": "template"}}
        }),
    )
    .await;

    assert_eq!(
        got,
        keys(&["user/1/group_ids$", "user/1/group_ids$7", "user/1/group_ids$8"])
    );
}

#[tokio::test]
async fn test_template_with_relation_list_sub_descriptor() {
    let got = expand(
        json!({
            "user/1/group_ids$": ["7"],
            "user/1/group_ids$7": [10],
            "group/10/name": "delegates",
        }),
        json!({
            "collection": "user",
            "ids": [1],
            "fields": {
                "group_ids$": {
                    "type": "template",
                    "values": {
                        "type": "relation-list",
                        "collection": "group",
                        "fields": {"name": null}
                    }
                }
            }
        }),
    )
    .await;

    assert_eq!(
        got,
        keys(&["user/1/group_ids$", "user/1/group_ids$7", "group/10/name"])
    );
}

#[tokio::test]
async fn test_multi_request_body() {
    let got = expand(
        json!({}),
        json!([
            {"collection": "user", "ids": [1], "fields": {"username": null}},
            {"collection": "meeting", "ids": [7], "fields": {"name": null}}
        ]),
    )
    .await;

    assert_eq!(got, keys(&["user/1/username", "meeting/7/name"]));
}

#[tokio::test]
async fn test_expansion_is_idempotent() {
    let data = json!({
        "meeting/7/group_ids": [10],
        "group/10/name": "delegates",
    });
    let request = json!({
        "collection": "meeting",
        "ids": [7],
        "fields": {
            "group_ids": {
                "type": "relation-list",
                "collection": "group",
                "fields": {"name": null}
            }
        }
    });

    let first = expand(data.clone(), request.clone()).await;
    let second = expand(data, request).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_one_loader_call_per_wave() {
    let (ds, _source) = stub::datastore(json!({
        "meeting/7/group_ids": [10, 11],
        "group/10/superadmin_role_for_meeting_id": 7,
        "group/11/superadmin_role_for_meeting_id": 7,
    }));
    let loader = DsLoader::new(ds);

    let requests = parse_body(
        json!({
            "collection": "meeting",
            "ids": [7],
            "fields": {
                "group_ids": {
                    "type": "relation-list",
                    "collection": "group",
                    "fields": {
                        "superadmin_role_for_meeting_id": {
                            "type": "relation",
                            "collection": "meeting",
                            "fields": {"name": null}
                        }
                    }
                }
            }
        })
        .to_string()
        .as_bytes(),
    )
    .unwrap();

    KeysBuilder::new(requests).expand(&loader).await.unwrap();

    // Two reading waves: the root relation, then both group
    // relations in one batch. The plain meeting names need no read.
    assert!(loader.calls.load(Ordering::Relaxed) <= 2);
}

// ============================================================================
// Request validation
// ============================================================================

#[test]
fn test_parse_minimal_request() {
    let requests = parse_body(
        br#"{"collection": "user", "ids": [1], "fields": {"username": null}}"#,
    )
    .unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].collection, "user");
    assert_eq!(requests[0].fields["username"], FieldDescriptor::Plain);
}

#[test]
fn test_request_without_ids_is_rejected() {
    let err = parse_body(br#"{"collection": "user", "fields": {"username": null}}"#).unwrap_err();
    assert!(matches!(err, RequestError::NoIds(_)));
}

#[test]
fn test_request_with_negative_id_is_rejected() {
    let err =
        parse_body(br#"{"collection": "user", "ids": [-1], "fields": {"username": null}}"#)
            .unwrap_err();
    assert!(matches!(err, RequestError::InvalidId { id: -1, .. }));
}

#[test]
fn test_invalid_collection_is_rejected() {
    let err = parse_body(br#"{"collection": "User", "ids": [1], "fields": {}}"#).unwrap_err();
    assert!(matches!(err, RequestError::InvalidCollection(_)));
}

#[test]
fn test_invalid_field_is_rejected() {
    let err =
        parse_body(br#"{"collection": "user", "ids": [1], "fields": {"User Name": null}}"#)
            .unwrap_err();
    assert!(matches!(err, RequestError::InvalidField(_)));
}

#[test]
fn test_unknown_descriptor_type_is_rejected() {
    let err = parse_body(
        br#"{"collection": "user", "ids": [1],
             "fields": {"group_ids": {"type": "backlink", "collection": "group", "fields": {}}}}"#,
    )
    .unwrap_err();
    assert!(matches!(err, RequestError::UnknownType { .. }));
}

#[test]
fn test_relation_without_collection_is_rejected() {
    let err = parse_body(
        br#"{"collection": "user", "ids": [1],
             "fields": {"committee_id": {"type": "relation", "fields": {}}}}"#,
    )
    .unwrap_err();
    assert!(matches!(err, RequestError::CollectionNeeded { .. }));
}

#[test]
fn test_template_descriptor_on_plain_field_is_rejected() {
    let err = parse_body(
        br#"{"collection": "user", "ids": [1],
             "fields": {"username": {"type": "template"}}}"#,
    )
    .unwrap_err();
    assert!(matches!(err, RequestError::NotATemplate(_)));
}

#[test]
fn test_relation_descriptor_on_template_field_is_rejected() {
    let err = parse_body(
        br#"{"collection": "user", "ids": [1],
             "fields": {"group_ids$": {"type": "relation", "collection": "group", "fields": {}}}}"#,
    )
    .unwrap_err();
    assert!(matches!(err, RequestError::TemplateNeeded(_)));
}

#[test]
fn test_nested_template_descriptor_is_rejected() {
    let err = parse_body(
        br#"{"collection": "user", "ids": [1],
             "fields": {"group_ids$": {"type": "template", "values": {"type": "template"}}}}"#,
    )
    .unwrap_err();
    assert!(matches!(err, RequestError::NestedTemplate(_)));
}

#[test]
fn test_plain_template_field_is_allowed() {
    let requests = parse_body(
        br#"{"collection": "user", "ids": [1], "fields": {"group_ids$": null}}"#,
    )
    .unwrap();
    assert_eq!(requests[0].fields["group_ids$"], FieldDescriptor::Plain);
}
