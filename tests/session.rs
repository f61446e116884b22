//! Session store, persistence and reaper integration tests

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use murmur_gateway::config::SessionConfig;
use murmur_gateway::context::ConversationManager;
use murmur_gateway::session::SessionReaper;
use murmur_gateway::{PreferenceValue, SessionRepo, SessionStore, TurnRole, db};
use tempfile::TempDir;

mod common;
use common::{setup_test_db, setup_test_store};

fn manager(store: &Arc<SessionStore>, max_history: usize) -> ConversationManager {
    let config = SessionConfig {
        max_history,
        ..SessionConfig::default()
    };
    ConversationManager::new(Arc::clone(store), &config)
}

#[tokio::test]
async fn test_session_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sessions.db");

    {
        let store = Arc::new(SessionStore::new(SessionRepo::new(db::init(&path).unwrap())));
        let conversations = manager(&store, 50);

        conversations
            .record_user_turn("kitchen", "What's the weather like today?")
            .await
            .unwrap();
        conversations
            .record_assistant_turn("kitchen", "Sunny and warm.")
            .await
            .unwrap();
        store
            .update("kitchen", |s| {
                s.preferences
                    .insert("voice".to_string(), PreferenceValue::Text("nova".to_string()));
            })
            .await
            .unwrap();

        assert_eq!(store.flush_all().await, 1);
    }

    // A new process opens the same file
    let store = Arc::new(SessionStore::new(SessionRepo::new(db::init(&path).unwrap())));
    assert!(!store.is_active("kitchen").await);

    let session = store.get_or_create("kitchen").await.unwrap();
    assert_eq!(session.turns.len(), 2);
    assert_eq!(session.turns[0].role, TurnRole::User);
    assert_eq!(session.turns[1].text, "Sunny and warm.");
    assert!(session.topics.contains("weather"));
    assert_eq!(session.preference_text("voice"), Some("nova"));
    assert_eq!(session.interaction_count, 2);
    assert!(store.is_active("kitchen").await);
}

#[tokio::test]
async fn test_expired_session_rehydrates_identically() {
    let store = setup_test_store();
    let conversations = manager(&store, 50);

    conversations
        .record_user_turn("s1", "I need a flight to Lisbon")
        .await
        .unwrap();
    conversations
        .record_assistant_turn("s1", "When would you like to leave?")
        .await
        .unwrap();

    let before = store.snapshot("s1").await.unwrap().unwrap();

    let reaper = SessionReaper::new(
        Arc::clone(&store),
        Duration::from_secs(1200),
        Duration::from_secs(300),
    );
    let later = before.last_active_at + chrono::Duration::seconds(1200);
    assert_eq!(reaper.sweep_at(later).await, 1);
    assert!(!store.is_active("s1").await);

    // Reads fall through to the durable copy without reactivating
    let durable = store.snapshot("s1").await.unwrap().unwrap();
    assert_eq!(durable, before);
    assert!(!store.is_active("s1").await);

    let revived = store.get_or_create("s1").await.unwrap();
    assert_eq!(revived.turns, before.turns);
    assert_eq!(revived.topics, before.topics);
    assert_eq!(revived.created_at, before.created_at);
    assert!(revived.last_active_at >= before.last_active_at);
}

#[tokio::test]
async fn test_touch_before_sweep_keeps_session() {
    let store = setup_test_store();
    let created = store.get_or_create("s1").await.unwrap();

    let reaper = SessionReaper::new(
        Arc::clone(&store),
        Duration::from_millis(50),
        Duration::from_secs(300),
    );

    tokio::time::sleep(Duration::from_millis(80)).await;
    store.touch("s1").await.unwrap();

    let touched = store.snapshot("s1").await.unwrap().unwrap();
    assert!(touched.last_active_at > created.last_active_at);

    // Swept at the moment of the touch: idle time is zero
    assert_eq!(reaper.sweep_at(touched.last_active_at).await, 0);
    assert!(store.is_active("s1").await);
}

#[tokio::test]
async fn test_session_with_active_stream_is_not_expired() {
    let store = setup_test_store();
    let session = store.get_or_create("s1").await.unwrap();
    store
        .modify("s1", |s| s.active_stream_id = Some("tts-1".to_string()))
        .await
        .unwrap();

    let later = session.last_active_at + chrono::Duration::hours(2);
    assert!(store.expire_idle(later, Duration::from_secs(1200)).await.is_empty());
    assert!(store.is_active("s1").await);

    store
        .modify("s1", |s| s.active_stream_id = None)
        .await
        .unwrap();
    assert_eq!(
        store.expire_idle(later, Duration::from_secs(1200)).await,
        vec!["s1".to_string()]
    );
}

#[tokio::test]
async fn test_history_keeps_most_recent_turns() {
    let store = setup_test_store();
    let conversations = manager(&store, 4);

    for i in 0..3 {
        conversations
            .record_user_turn("s1", &format!("question {i}"))
            .await
            .unwrap();
        conversations
            .record_assistant_turn("s1", &format!("answer {i}"))
            .await
            .unwrap();
    }

    let history = conversations.history("s1").await.unwrap().unwrap();
    let texts: Vec<_> = history.iter().map(|t| t.text.as_str()).collect();
    assert_eq!(texts, vec!["question 1", "answer 1", "question 2", "answer 2"]);

    // Indexes keep counting across evictions
    assert_eq!(history[0].interaction_index, 3);
    assert_eq!(history[3].interaction_index, 6);

    let summary = conversations.summary("s1").await.unwrap().unwrap();
    assert_eq!(summary.turn_count, 4);
    assert_eq!(summary.interaction_count, 6);
    assert_eq!(summary.last_user_message.as_deref(), Some("question 2"));
}

#[tokio::test]
async fn test_unreadable_record_starts_fresh_session() {
    let pool = setup_test_db();
    let now = Utc::now().to_rfc3339();
    pool.get()
        .unwrap()
        .execute(
            "INSERT INTO voice_sessions (id, created_at, last_active_at, turns)
             VALUES ('broken', ?1, ?1, 'not json')",
            [&now],
        )
        .unwrap();

    let store = SessionStore::new(SessionRepo::new(pool));
    assert!(store.snapshot("broken").await.unwrap().is_none());

    let session = store.get_or_create("broken").await.unwrap();
    assert!(session.turns.is_empty());
    assert_eq!(session.interaction_count, 0);

    // The fresh session overwrites the bad row
    let repo = store.repo().clone();
    assert!(repo.load("broken").unwrap().is_some());
}

#[tokio::test]
async fn test_unknown_session_reads_are_absent() {
    let store = setup_test_store();
    let conversations = manager(&store, 50);

    assert!(conversations.history("ghost").await.unwrap().is_none());
    assert!(conversations.summary("ghost").await.unwrap().is_none());
    assert!(conversations.topics("ghost").await.unwrap().is_none());
    assert!(conversations.context_with_budget("ghost", 100).await.unwrap().is_none());
    assert!(!conversations.clear("ghost").await.unwrap());
    assert_eq!(store.active_count().await, 0);
}
