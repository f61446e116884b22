//! API endpoint integration tests

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use murmur_gateway::VoiceEngine;
use murmur_gateway::api::ApiServerBuilder;
use tower::ServiceExt;

mod common;
use common::{ScriptedSynthesizer, setup_test_engine};

/// Build a test API router
fn build_test_router(engine: VoiceEngine) -> axum::Router {
    ApiServerBuilder::new(engine, 0)
        .api_key(Some("test-api-key".to_string()))
        .build()
        .router()
}

fn test_engine() -> VoiceEngine {
    setup_test_engine(&[], ScriptedSynthesizer::finite(vec![vec![0; 8]])).engine
}

async fn seed_conversation(engine: &VoiceEngine, session_id: &str) {
    engine
        .conversations
        .record_user_turn(session_id, "Any good pizza places near the hotel?")
        .await
        .unwrap();
    engine
        .conversations
        .record_assistant_turn(session_id, "There's a great one two blocks away.")
        .await
        .unwrap();
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = build_test_router(test_engine());

    let (status, json) = get_json(app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_ready_endpoint() {
    let engine = test_engine();
    engine.store.get_or_create("s1").await.unwrap();
    let app = build_test_router(engine);

    let (status, json) = get_json(app, "/ready").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["checks"]["database"]["status"], "ok");
    assert_eq!(json["active_sessions"], 1);
    assert_eq!(json["active_streams"], 0);
}

#[tokio::test]
async fn test_history_of_unknown_session_is_not_found() {
    let engine = test_engine();
    let app = build_test_router(engine.clone());

    let (status, json) = get_json(app, "/api/sessions/ghost/history").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "not_found");

    // Inspection never creates sessions
    assert!(!engine.store.is_active("ghost").await);
    assert!(engine.store.snapshot("ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn test_session_history() {
    let engine = test_engine();
    seed_conversation(&engine, "s1").await;
    let app = build_test_router(engine);

    let (status, json) = get_json(app, "/api/sessions/s1/history").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["session_id"], "s1");
    let turns = json["turns"].as_array().unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0]["role"], "user");
    assert_eq!(turns[0]["interaction_index"], 1);
    assert_eq!(turns[1]["role"], "assistant");
}

#[tokio::test]
async fn test_session_summary_and_topics() {
    let engine = test_engine();
    seed_conversation(&engine, "s1").await;

    let (status, summary) =
        get_json(build_test_router(engine.clone()), "/api/sessions/s1/summary").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["turn_count"], 2);
    assert_eq!(summary["user_turns"], 1);
    assert_eq!(summary["assistant_turns"], 1);
    assert_eq!(
        summary["last_user_message"],
        "Any good pizza places near the hotel?"
    );

    let (status, topics) = get_json(build_test_router(engine), "/api/sessions/s1/topics").await;
    assert_eq!(status, StatusCode::OK);
    let topics: Vec<_> = topics["topics"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t.as_str().unwrap().to_string())
        .collect();
    assert_eq!(topics, vec!["food", "travel"]);
}

#[tokio::test]
async fn test_session_context_respects_budget() {
    let engine = test_engine();
    seed_conversation(&engine, "s1").await;

    let (status, full) =
        get_json(build_test_router(engine.clone()), "/api/sessions/s1/context").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(full["max_chars"], 1000);
    assert!(
        full["prompt_preview"]
            .as_str()
            .unwrap()
            .contains("pizza places")
    );

    let (status, tight) = get_json(
        build_test_router(engine),
        "/api/sessions/s1/context?max_chars=10",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tight["max_chars"], 10);
    let preview_len = |v: &serde_json::Value| v["prompt_preview"].as_str().unwrap().len();
    assert!(preview_len(&tight) < preview_len(&full));
    assert_eq!(tight["context"]["omitted"], 1);
}

#[tokio::test]
async fn test_list_sessions() {
    let engine = test_engine();
    seed_conversation(&engine, "s1").await;
    engine.store.get_or_create("s2").await.unwrap();
    engine.store.remove("s2").await.unwrap();
    let app = build_test_router(engine);

    let (status, json) = get_json(app, "/api/sessions").await;

    assert_eq!(status, StatusCode::OK);
    let entries = json.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    let active = |id: &str| {
        entries
            .iter()
            .find(|e| e["id"] == id)
            .map(|e| e["active"].as_bool().unwrap())
    };
    assert_eq!(active("s1"), Some(true));
    assert_eq!(active("s2"), Some(false));
}

#[tokio::test]
async fn test_clear_session_requires_auth() {
    let engine = test_engine();
    seed_conversation(&engine, "s1").await;
    let app = build_test_router(engine.clone());

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/sessions/s1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let history = engine.conversations.history("s1").await.unwrap().unwrap();
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn test_clear_session_with_auth() {
    let engine = test_engine();
    seed_conversation(&engine, "s1").await;

    let response = build_test_router(engine.clone())
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/sessions/s1")
                .header("Authorization", "Bearer test-api-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let history = engine.conversations.history("s1").await.unwrap().unwrap();
    assert!(history.is_empty());
    let topics = engine.conversations.topics("s1").await.unwrap().unwrap();
    assert!(topics.is_empty());

    // Clearing an unknown session is a 404
    let response = build_test_router(engine)
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/sessions/ghost")
                .header("Authorization", "Bearer test-api-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rate_limit_rejects_burst() {
    let engine = test_engine();
    let app = ApiServerBuilder::new(engine, 0)
        .rate_limit_per_minute(2)
        .build()
        .router();

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let (status, _) = get_json(app.clone(), "/api/sessions").await;
        statuses.push(status);
    }

    assert_eq!(
        statuses,
        vec![StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]
    );
}
