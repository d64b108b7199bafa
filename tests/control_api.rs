//! Control API over an in-process router

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use conference_bridge::conference::{CallId, ConferenceRegistry};
use conference_bridge::config::BridgeConfig;
use conference_bridge::control::{router, AppState};

fn app() -> (Router, Arc<ConferenceRegistry>) {
    let mut config = BridgeConfig::default();
    config.sender.default_media = "PCM/8000/1".into();
    let registry = Arc::new(ConferenceRegistry::new(Arc::new(config)));
    let state = Arc::new(AppState::new(registry.clone(), None));
    (router(state), registry)
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(body) => {
            request = request.header("content-type", "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };

    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create_conference(app: &Router, id: &str) {
    let (status, _) = call(
        app,
        Method::POST,
        "/api/conferences",
        Some(json!({ "id": id, "permanent": true })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

async fn join(app: &Router, conference: &str, call_id: &str) -> Value {
    let (status, body) = call(
        app,
        Method::POST,
        &format!("/api/conferences/{}/members", conference),
        Some(json!({ "call_id": call_id, "phone_number": "6001", "receive_payload": 102 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    body
}

#[tokio::test]
async fn test_conference_lifecycle() {
    let (app, _) = app();

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/conferences",
        Some(json!({ "id": "standup", "media": "PCM/16000/1", "permanent": true })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["id"], "standup");

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/conferences",
        Some(json!({ "id": "standup" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);

    let (status, body) = call(&app, Method::GET, "/api/conferences", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, _) = call(&app, Method::DELETE, "/api/conferences/standup", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, Method::GET, "/api/conferences/standup", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_bad_media_preference_is_rejected() {
    let (app, _) = app();
    let (status, body) = call(
        &app,
        Method::POST,
        "/api/conferences",
        Some(json!({ "id": "c", "media": "G729/8000/1" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().is_some());
}

#[tokio::test]
async fn test_join_and_member_status() {
    let (app, registry) = app();
    create_conference(&app, "c").await;

    let body = join(&app, "c", "alice").await;
    assert_eq!(body["data"]["call_id"], "alice");
    assert_eq!(body["data"]["whisper_group"], "c");

    let (status, body) = call(&app, Method::GET, "/api/conferences/c/members/alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["muted"], false);

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/conferences/c/members/alice/mute",
        Some(json!({ "enabled": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let member = registry.find("c").unwrap().member(&CallId::from("alice")).unwrap();
    assert!(member.mute_flags().muted());

    let (status, _) = call(&app, Method::GET, "/api/conferences/c/members/nobody", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, Method::DELETE, "/api/conferences/c/members/alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(registry.find("c").unwrap().member_count(), 0);
}

#[tokio::test]
async fn test_whisper_groups() {
    let (app, registry) = app();
    create_conference(&app, "c").await;
    join(&app, "c", "alice").await;
    join(&app, "c", "bob").await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/conferences/c/groups",
        Some(json!({ "id": "sidebar", "attenuation": 0.3 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"], "sidebar");

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/conferences/c/groups/sidebar/members",
        Some(json!({ "call_id": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/conferences/c/members/alice/whisper",
        Some(json!({ "group": "sidebar" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let conference = registry.find("c").unwrap();
    assert_eq!(
        conference.member(&CallId::from("alice")).unwrap().whisper_group().unwrap().id(),
        "sidebar"
    );

    // bob is not in the group
    let (status, _) = call(
        &app,
        Method::POST,
        "/api/conferences/c/members/bob/whisper",
        Some(json!({ "group": "sidebar" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        Method::PATCH,
        "/api/conferences/c/groups/sidebar",
        Some(json!({ "attenuation": 1.5 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        Method::PATCH,
        "/api/conferences/c/groups/sidebar",
        Some(json!({ "attenuation": 0.6, "locked": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let group = conference.whisper_group("sidebar").unwrap();
    assert_eq!(group.attenuation(), 0.6);
    assert!(group.is_locked());

    // The conference group cannot be destroyed
    let (status, _) = call(&app, Method::DELETE, "/api/conferences/c/groups/c", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, Method::DELETE, "/api/conferences/c/groups/sidebar", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        conference.member(&CallId::from("alice")).unwrap().whisper_group().unwrap().id(),
        "c"
    );
}

#[tokio::test]
async fn test_private_mix_is_queued() {
    let (app, registry) = app();
    create_conference(&app, "c").await;
    join(&app, "c", "alice").await;
    join(&app, "c", "bob").await;

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/conferences/c/members/alice/private-mix",
        Some(json!({ "target": "bob", "values": [0.5, -0.5, 0.0, 0.8] })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(registry.private_mix_stats().pending, 1);

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/conferences/c/members/alice/private-mix",
        Some(json!({ "target": "alice", "values": [0.0, 0.0, 0.0, 0.5] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&app, Method::GET, "/api/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["members"], 2);
    assert_eq!(body["data"]["private_mixes"]["pending"], 1);
}

#[tokio::test]
async fn test_transfer_between_conferences() {
    let (app, registry) = app();
    create_conference(&app, "a").await;
    create_conference(&app, "b").await;
    join(&app, "a", "alice").await;

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/conferences/a/members/alice/transfer",
        Some(json!({ "conference": "b" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(registry.member_conference(&CallId::from("alice")).unwrap().id(), "b");

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/conferences/b/members/alice/transfer",
        Some(json!({ "conference": "missing" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_treatment_to_missing_group() {
    let (app, _) = app();
    create_conference(&app, "c").await;

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/conferences/c/treatment",
        Some(json!({ "frequency": 440.0, "duration_ms": 200 })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/conferences/c/treatment",
        Some(json!({ "frequency": 440.0, "group": "nope" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
