//! Tests for the connection loop
//!
//! The projector is registered like in production, so the scenarios
//! cover computed-field emission end to end: snapshot, change-driven
//! recomputation, permission revocation, and silence on unrelated
//! changes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use plenum_datastore::{Fetcher, stub};
use plenum_key::Key;
use plenum_projector::{Projection, Slide, SlideStore};
use plenum_restrict::Restricter;
use serde_json::json;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::connection::encode_frame;

fn key(s: &str) -> Key {
    Key::parse(s).unwrap()
}

struct Test1Slide;

#[async_trait]
impl Slide for Test1Slide {
    async fn render(
        &self,
        _fetch: &mut Fetcher,
        _projection: &Projection,
    ) -> Result<Vec<u8>, BoxError> {
        Ok(br#"{"value":"abc"}"#.to_vec())
    }
}

struct TestModelSlide;

#[async_trait]
impl Slide for TestModelSlide {
    async fn render(
        &self,
        fetch: &mut Fetcher,
        _projection: &Projection,
    ) -> Result<Vec<u8>, BoxError> {
        let field: Option<String> = fetch.value(Key::new("test_model", 1, "field")).await?;
        let rendered = match field {
            None => r#"{"value":"test_model"}"#.to_string(),
            Some(field) => format!(r#"{{"value":"calculated with {field}"}}"#),
        };
        Ok(rendered.into_bytes())
    }
}

/// A running service over stubbed data, with the projector
/// registered and the update loop spawned.
fn service(data: serde_json::Value) -> (Autoupdate, Arc<stub::StubSource>, CancellationToken) {
    let (ds, source) = stub::datastore(data);

    let mut slides = SlideStore::with_defaults();
    slides.register("test1", Arc::new(Test1Slide));
    slides.register("test_model", Arc::new(TestModelSlide));
    plenum_projector::register(&ds, slides);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let ds = ds.clone();
        let token = cancel.clone();
        async move { ds.listen(token).await }
    });

    let restricter = Restricter::new(ds.clone());
    (Autoupdate::new(ds, restricter), source, cancel)
}

fn content_request() -> Vec<plenum_keysbuilder::KeyRequest> {
    plenum_keysbuilder::parse_body(
        json!({"collection": "projection", "ids": [1], "fields": {"content": null}})
            .to_string()
            .as_bytes(),
    )
    .unwrap()
}

/// Wait until the service applied a change, then ask for the next
/// frame.
async fn next_frame(connection: &mut Connection) -> Frame {
    timeout(Duration::from_secs(2), connection.next())
        .await
        .expect("no emission within deadline")
        .unwrap()
        .expect("update stream ended")
}

fn assert_silent(frame: Result<Result<Option<Frame>, ConnectionError>, tokio::time::error::Elapsed>) {
    assert!(frame.is_err(), "expected no emission, got {frame:?}");
}

fn parsed(frame: &Frame, key: &Key) -> Option<serde_json::Value> {
    frame
        .get(key)?
        .as_ref()
        .map(|bytes| serde_json::from_slice(bytes).unwrap())
}

// ============================================================================
// Snapshot
// ============================================================================

#[tokio::test]
async fn test_snapshot_on_empty_datastore_emits_null() {
    let (service, _source, _cancel) = service(json!({}));
    let mut connection = service.connect(1, content_request());

    let frame = next_frame(&mut connection).await;

    assert_eq!(frame.len(), 1);
    assert_eq!(frame[&key("projection/1/content")], None);
    assert_eq!(
        encode_frame(&frame).unwrap(),
        br#"{"projection/1/content":null}"#
    );
}

#[tokio::test]
async fn test_unchanged_data_emits_nothing_after_snapshot() {
    let (service, _source, _cancel) = service(json!({}));
    let mut connection = service.connect(1, content_request());

    next_frame(&mut connection).await;

    assert_silent(timeout(Duration::from_millis(100), connection.next()).await);
}

#[tokio::test]
async fn test_snapshot_renders_computed_content() {
    let (service, _source, _cancel) = service(json!({
        "projection/1/id": 1,
        "projection/1/content_object_id": "test_model/1",
        "user/1/organization_management_level": "superadmin",
    }));
    let mut connection = service.connect(1, content_request());

    let frame = next_frame(&mut connection).await;

    assert_eq!(
        parsed(&frame, &key("projection/1/content")),
        Some(json!({"collection": "test_model", "value": "test_model"}))
    );
}

// ============================================================================
// Change-driven emissions
// ============================================================================

#[tokio::test]
async fn test_projection_change_triggers_recomputed_emission() {
    let (service, source, _cancel) = service(json!({
        "projection/1/id": 1,
        "projection/1/content_object_id": "test_model/1",
        "projection/1/type": "test1",
        "user/1/organization_management_level": "superadmin",
    }));
    let mut connection = service.connect(1, content_request());

    let snapshot = next_frame(&mut connection).await;
    assert_eq!(
        parsed(&snapshot, &key("projection/1/content")),
        Some(json!({"collection": "test1", "value": "abc"}))
    );

    source.send(stub::changes(json!({"projection/1/type": null})));

    let delta = next_frame(&mut connection).await;
    assert_eq!(
        parsed(&delta, &key("projection/1/content")),
        Some(json!({"collection": "test_model", "value": "test_model"}))
    );
}

#[tokio::test]
async fn test_upstream_dependency_change_triggers_emission() {
    let (service, source, _cancel) = service(json!({
        "projection/1/id": 1,
        "projection/1/content_object_id": "test_model/1",
        "user/1/organization_management_level": "superadmin",
    }));
    let mut connection = service.connect(1, content_request());

    next_frame(&mut connection).await;

    source.send(stub::changes(json!({"test_model/1/field": "new value"})));

    let delta = next_frame(&mut connection).await;
    assert_eq!(
        parsed(&delta, &key("projection/1/content")),
        Some(json!({"collection": "test_model", "value": "calculated with new value"}))
    );
}

#[tokio::test]
async fn test_unrelated_change_emits_nothing() {
    let (service, source, _cancel) = service(json!({
        "projection/1/id": 1,
        "projection/1/content_object_id": "test_model/1",
        "user/1/organization_management_level": "superadmin",
    }));
    let mut connection = service.connect(1, content_request());

    next_frame(&mut connection).await;

    source.send(stub::changes(json!({"some_other/1/field": "new value"})));

    assert_silent(timeout(Duration::from_millis(100), connection.next()).await);
}

// ============================================================================
// Restriction interplay
// ============================================================================

#[tokio::test]
async fn test_permission_revocation_emits_null() {
    let (service, source, _cancel) = service(json!({
        "meeting/7/id": 7,
        "meeting/7/admin_group_id": 99,
        "chat_group/5/meeting_id": 7,
        "chat_group/5/read_group_ids": [],
        "chat_group/5/write_group_ids": [],
        "chat_message/1/chat_group_id": 5,
        "chat_message/1/user_id": 2,
        "chat_message/1/content": "hello",
        "user/1/group_ids$7": [10],
        "group/10/permissions": ["chat.can_manage"],
    }));
    let requests = plenum_keysbuilder::parse_body(
        json!({"collection": "chat_message", "ids": [1], "fields": {"content": null}})
            .to_string()
            .as_bytes(),
    )
    .unwrap();
    let mut connection = service.connect(1, requests);

    let snapshot = next_frame(&mut connection).await;
    assert_eq!(
        snapshot[&key("chat_message/1/content")],
        Some(Bytes::from("\"hello\""))
    );

    // Revoking the permission must wake the connection even though
    // the changed key was only read for permission checks.
    source.send(stub::changes(json!({"group/10/permissions": []})));

    let delta = next_frame(&mut connection).await;
    assert_eq!(delta[&key("chat_message/1/content")], None);
}

#[tokio::test]
async fn test_shrinking_relation_emits_deletion() {
    let (service, source, _cancel) = service(json!({
        "meeting/7/group_ids": [10],
        "group/10/name": "delegates",
        "user/1/organization_management_level": "superadmin",
    }));
    let requests = plenum_keysbuilder::parse_body(
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
        })
        .to_string()
        .as_bytes(),
    )
    .unwrap();
    let mut connection = service.connect(1, requests);

    let snapshot = next_frame(&mut connection).await;
    assert_eq!(
        snapshot[&key("group/10/name")],
        Some(Bytes::from("\"delegates\""))
    );

    source.send(stub::changes(json!({"meeting/7/group_ids": []})));

    let delta = next_frame(&mut connection).await;
    // The group's keys fell out of the expansion: deletion.
    assert_eq!(delta.get(&key("group/10/name")), Some(&None));
}

// ============================================================================
// Frame encoding
// ============================================================================

#[test]
fn test_encode_frame_is_ordered_and_null_encodes_deletion() {
    let mut frame: Frame = Frame::new();
    frame.insert(key("user/2/username"), None);
    frame.insert(key("user/1/username"), Some(Bytes::from("\"hugo\"")));

    let encoded = encode_frame(&frame).unwrap();
    assert_eq!(
        encoded,
        br#"{"user/1/username":"hugo","user/2/username":null}"#
    );
}
