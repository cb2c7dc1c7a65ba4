use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use relay_provider::{AssistantTurn, ProviderError};
use serde_json::{json, Value};
use tokio::time::Duration;
use tower::util::ServiceExt;

use crate::runner::{RunResult, Runner};
use crate::server::{build_app, build_openapi_router, CheckpointSummary};
use crate::testing::{call, calls_turn, memory_engine, ScriptedReasoner};

fn app_with(reasoner: ScriptedReasoner) -> (Router, Arc<Runner>) {
    let runner = Arc::new(Runner::new(memory_engine(Arc::new(reasoner))));
    (build_app(runner.clone()), runner)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    (status, body.to_vec())
}

fn detail(body: &[u8]) -> String {
    let value: Value = serde_json::from_slice(body).expect("json");
    value["detail"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn query_returns_final_state() {
    let (app, _) = app_with(ScriptedReasoner::new(vec![AssistantTurn::text("hi back")]));
    let mut request = post_json("/agent/query", json!({ "message": "hello" }));
    request
        .headers_mut()
        .insert("x-end-user-id", "user-9".parse().unwrap());

    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let result: RunResult = serde_json::from_slice(&body).expect("result");
    assert_eq!(result.messages.len(), 2);
    assert_eq!(result.final_message.as_deref(), Some("hi back"));
    assert_eq!(result.end_user_id.as_deref(), Some("user-9"));
    assert!(!result.run_id.is_empty());
}

#[tokio::test]
async fn empty_message_is_bad_request() {
    let (app, _) = app_with(ScriptedReasoner::default());
    let (status, body) = send(&app, post_json("/agent/query", json!({ "message": "" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(detail(&body), "message must not be empty");
}

#[tokio::test]
async fn malformed_body_is_bad_request() {
    let (app, _) = app_with(ScriptedReasoner::default());
    let request = Request::builder()
        .method("POST")
        .uri("/agent/query")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!detail(&body).is_empty());
}

#[tokio::test]
async fn upstream_status_and_body_pass_through() {
    let (app, _) = app_with(ScriptedReasoner::failing(ProviderError::Http {
        status: 503,
        body: "model overloaded".into(),
    }));
    let (status, body) = send(&app, post_json("/agent/query", json!({ "message": "hi" }))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(detail(&body), "model overloaded");
}

#[tokio::test]
async fn other_failures_are_internal_errors() {
    let (app, runner) = app_with(ScriptedReasoner::default());
    runner.close().await.expect("close");
    let (status, body) = send(&app, post_json("/agent/query", json!({ "message": "hi" }))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(detail(&body), "runner is closed");
}

#[tokio::test]
async fn stream_emits_data_frames_then_completed() {
    let (app, _) = app_with(ScriptedReasoner::new(vec![AssistantTurn::text("streamed")]));
    let (status, body) = send(&app, get("/agent/stream?message=hi&thread_id=s1")).await;
    assert_eq!(status, StatusCode::OK);

    let text = String::from_utf8(body).expect("utf8");
    assert!(text.starts_with("event: data\ndata: "));
    assert!(text.contains("\"type\":\"reasoning_delta\""));
    assert!(text.ends_with("event: event\ndata: {\"status\":\"completed\"}\n\n"));
    assert_eq!(text.matches("event: event\n").count(), 1);
}

#[tokio::test]
async fn stream_failure_ends_with_error_frame() {
    let (app, _) = app_with(ScriptedReasoner::failing(ProviderError::Transport(
        "connection reset".into(),
    )));
    let (status, body) = send(&app, get("/agent/stream?message=hi")).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).expect("utf8");
    assert!(text.trim_end().ends_with("}"));
    let last = text.trim_end().rsplit("\n\n").next().unwrap_or_default();
    assert!(last.starts_with("event: error\ndata: "));
    assert!(last.contains("connection reset"));
    assert!(!text.contains("\"status\":\"completed\""));
}

#[tokio::test]
async fn stream_rejects_empty_message_before_streaming() {
    let (app, _) = app_with(ScriptedReasoner::default());
    let (status, body) = send(&app, get("/agent/stream?message=")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(detail(&body), "message must not be empty");
}

#[tokio::test]
async fn stream_body_answers_a_client_tool_interrupt() {
    let (app, runner) = app_with(ScriptedReasoner::new(vec![
        calls_turn(vec![call("t1", "confirm_trade")]),
        AssistantTurn::text("trade placed"),
    ]));
    let (status, body) = send(
        &app,
        post_json("/agent/query", json!({ "message": "buy ACME", "thread_id": "ct1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let suspended: RunResult = serde_json::from_slice(&body).expect("result");
    assert_eq!(suspended.interrupt.len(), 1);

    let (status, body) = send(
        &app,
        post_json(
            "/agent/stream",
            json!({
                "thread_id": "ct1",
                "tool_results": [{ "call_id": "t1", "content": { "confirmed": true } }]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).expect("utf8");
    assert!(text.contains("trade placed"));
    assert!(text.ends_with("event: event\ndata: {\"status\":\"completed\"}\n\n"));

    let history = runner
        .history("ct1", Default::default())
        .await
        .expect("history");
    let head = &history[0].checkpoint;
    let answered = head
        .messages()
        .iter()
        .find(|message| message.tool_call_id() == Some("t1"))
        .expect("tool result");
    assert!(answered.content().contains("confirmed"));
}

#[tokio::test]
async fn stream_body_rejects_malformed_json() {
    let (app, _) = app_with(ScriptedReasoner::default());
    let request = Request::builder()
        .method("POST")
        .uri("/agent/stream")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn slow_reasoning_is_covered_by_pings() {
    let reasoner =
        ScriptedReasoner::new(vec![AssistantTurn::text("late")]).with_delay(Duration::from_millis(60));
    let runner = Arc::new(
        Runner::new(memory_engine(Arc::new(reasoner))).with_heartbeat(Duration::from_millis(10)),
    );
    let app = build_app(runner);

    let (_, body) = send(&app, get("/agent/stream?message=hi")).await;
    let text = String::from_utf8(body).expect("utf8");
    let ping = text.find("event: ping\ndata: {\"message\":\"heartbeat\"}").expect("ping");
    let delta = text.find("reasoning_delta").expect("delta");
    assert!(ping < delta);
}

#[tokio::test]
async fn checkpoints_are_listed_newest_first() {
    let (app, _) = app_with(ScriptedReasoner::new(vec![
        calls_turn(vec![call("c1", "get_price")]),
        AssistantTurn::text("ACME is 42.5"),
    ]));
    let (status, _) = send(
        &app,
        post_json("/agent/query", json!({ "message": "price?", "thread_id": "h1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, get("/threads/h1/checkpoints")).await;
    assert_eq!(status, StatusCode::OK);
    let summaries: Vec<CheckpointSummary> = serde_json::from_slice(&body).expect("json");
    let nexts: Vec<&str> = summaries.iter().map(|s| s.next.as_str()).collect();
    assert_eq!(nexts, vec!["terminal", "reasoning", "tool_exec"]);
    assert_eq!(summaries[2].parent_checkpoint_id, None);
    assert_eq!(
        summaries[0].parent_checkpoint_id.as_deref(),
        Some(summaries[1].checkpoint_id.as_str())
    );

    let uri = format!("/threads/h1/checkpoints?before={}", summaries[1].checkpoint_id);
    let (_, body) = send(&app, get(&uri)).await;
    let older: Vec<CheckpointSummary> = serde_json::from_slice(&body).expect("json");
    assert_eq!(older.len(), 1);
    assert_eq!(older[0].checkpoint_id, summaries[2].checkpoint_id);
}

#[tokio::test]
async fn resume_of_unknown_thread_is_bad_request() {
    let (app, _) = app_with(ScriptedReasoner::default());
    let request = Request::builder()
        .method("POST")
        .uri("/threads/nope/resume")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(detail(&body).contains("nope"));
}

#[tokio::test]
async fn openapi_lists_every_route() {
    let (app, _) = app_with(ScriptedReasoner::default());
    let (status, body) = send(&app, get("/openapi.json")).await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_slice(&body).expect("json");
    for path in [
        "/agent/query",
        "/agent/stream",
        "/threads/{thread_id}/checkpoints",
        "/threads/{thread_id}/resume",
    ] {
        assert!(value["paths"].get(path).is_some(), "missing {path}");
    }
    assert_eq!(build_openapi_router().1, String::from_utf8(body).expect("utf8"));
}
