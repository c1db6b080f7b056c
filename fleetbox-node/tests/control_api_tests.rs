//! Control API integration tests
//!
//! Requests go through the full router with `tower::ServiceExt::oneshot`.

mod helpers;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

use fleetbox_node::api::{router, AppContext};
use helpers::{wait_until, NodeFixture, TOKEN};

fn app(fx: &NodeFixture) -> Router {
    router(AppContext {
        node: fx.node.clone(),
    })
}

async fn get(app: &Router, path: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::get(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn post_control(app: &Router, body: &str) -> (StatusCode, Value) {
    let request = Request::post("/control")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health() {
    let fx = NodeFixture::start().await;
    let (status, body) = get(&app(&fx), "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["module"], "fleetbox-node");

    fx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_command_is_accepted() {
    let fx = NodeFixture::start().await;
    let app = app(&fx);

    let (status, body) =
        post_control(&app, r#"{"type":"command","command":"setVolume","value":0.25}"#).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, json!({"status": "accepted", "type": "command"}));

    assert!(
        wait_until(Duration::from_secs(5), || {
            fx.node.status().device().map(|d| d.volume) == Some(25)
        })
        .await
    );

    let (status, body) = get(&app, "/status").await;
    assert_eq!(status, StatusCode::OK);
    let device = body
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["type"] == "deviceStatus")
        .cloned()
        .unwrap();
    assert_eq!(device["token"], TOKEN);
    assert_eq!(device["volume"], 25);
    assert_eq!(device["isOnline"], true);

    fx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_messages_are_bad_requests() {
    let fx = NodeFixture::start().await;
    let app = app(&fx);

    for body in [
        "not json",
        r#"{"type":"launchRockets"}"#,
        r#"{"type":"command","command":"setVolume"}"#,
        r#"{"type":"command","command":"resetSchedule"}"#,
        r#"{"type":"playlistPush","playlist":{"id":"","tracks":[],"loop":false}}"#,
    ] {
        let (status, response) = post_control(&app, body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body: {}", body);
        assert!(response["error"].is_string(), "body: {}", body);
    }

    fx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_schedule_is_bad_request() {
    let fx = NodeFixture::start().await;
    let body = json!({
        "type": "scheduleCreated",
        "schedule": {
            "id": "s1",
            "playlist": {"id": "p", "tracks": [], "loop": false},
            "startDate": "2030-01-01T10:00:00Z",
            "endDate": "2030-01-01T11:00:00Z"
        }
    });

    let (status, response) = post_control(&app(&fx), &body.to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(response["error"].as_str().unwrap().contains("empty playlist"));

    fx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_event_stream_replays_latest_status() {
    let fx = NodeFixture::start().await;
    assert!(wait_until(Duration::from_secs(5), || fx.node.status().device().is_some()).await);

    let response = app(&fx)
        .oneshot(Request::get("/events").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );

    // Each status kind opens with its latest value, in no fixed order
    let mut body = response.into_body();
    let text = tokio::time::timeout(Duration::from_secs(5), async {
        let mut seen = String::new();
        while !seen.contains("event: deviceStatus") {
            let frame = body.frame().await.unwrap().unwrap();
            if let Ok(data) = frame.into_data() {
                seen.push_str(&String::from_utf8_lossy(&data));
            }
        }
        seen
    })
    .await
    .expect("no deviceStatus frame");
    assert!(text.contains(r#""type":"deviceStatus""#), "{}", text);

    fx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_history_lists_recent_plays() {
    use fleetbox_common::control::ControlMessage;
    use fleetbox_common::model::Playlist;

    let fx = NodeFixture::start().await;
    let app = app(&fx);

    let (status, body) = get(&app, "/history").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let jingle = fx.serve("api-hist", 1.5);
    fx.node
        .handle_control(ControlMessage::PlaylistPush {
            playlist: Playlist {
                id: "api".to_string(),
                name: None,
                tracks: vec![jingle],
                looping: false,
            },
        })
        .await
        .unwrap();

    let mut rows = Value::Null;
    for _ in 0..100 {
        let (_, body) = get(&app, "/history?limit=5").await;
        if body.as_array().map(|a| !a.is_empty()).unwrap_or(false) {
            rows = body;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let row = &rows[0];
    assert_eq!(row["songId"], "api-hist");
    assert_eq!(row["deviceId"], TOKEN);
    assert_eq!(row["source"], "playlist");
    assert_eq!(row["completed"], true);

    fx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_announcement_is_accepted() {
    let fx = NodeFixture::start().await;
    let app = app(&fx);

    let (status, body) =
        post_control(&app, r#"{"type":"deleteAnnouncement","data":"ann-9"}"#).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["type"], "deleteAnnouncement");

    let (status, _) = post_control(&app, r#"{"type":"deleteAnnouncement","data":" "}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    fx.stop().await;
}
