//! Tests for the http front door

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use plenum_datastore::stub;
use plenum_restrict::Restricter;
use serde_json::json;
use tower::ServiceExt;

use super::*;

fn test_server(data: serde_json::Value) -> Server {
    let (ds, _source) = stub::datastore(data);
    let restricter = Restricter::new(ds.clone());
    let autoupdate = Arc::new(Autoupdate::new(ds, restricter));
    Server::new("127.0.0.1:0", autoupdate, Arc::new(HeaderAuth))
}

#[tokio::test]
async fn test_health() {
    let router = test_server(json!({})).router();

    let response = router
        .oneshot(
            Request::get("/system/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_malformed_request_body_is_rejected() {
    let router = test_server(json!({})).router();

    let response = router
        .oneshot(
            Request::post("/system/autoupdate")
                .body(Body::from("no json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalid_key_request_is_rejected() {
    let router = test_server(json!({})).router();

    let body = json!({"collection": "user", "fields": {"username": null}});
    let response = router
        .oneshot(
            Request::post("/system/autoupdate")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    // No ids in the request.
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_user_header_is_unauthorized() {
    let router = test_server(json!({})).router();

    let body = json!({"collection": "user", "ids": [1], "fields": {"username": null}});
    let response = router
        .oneshot(
            Request::post("/system/autoupdate")
                .header(USER_ID_HEADER, "not a number")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_subscription_streams_the_snapshot_first() {
    let router = test_server(json!({
        "user/1/username": "hugo",
    }))
    .router();

    let body = json!({"collection": "user", "ids": [1], "fields": {"username": null}});
    let response = router
        .oneshot(
            Request::post("/system/autoupdate")
                .header(USER_ID_HEADER, "1")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "application/x-ndjson"
    );

    // The first frame is the snapshot; the stream then stays open.
    let mut body = response.into_body();
    let frame = body.frame().await.unwrap().unwrap();
    let line = frame.into_data().unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&line).unwrap();
    assert_eq!(parsed, json!({"user/1/username": "hugo"}));
}
