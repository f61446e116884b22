//! Conversation memory for voice sessions
//!
//! Combines:
//! - Turn history (bounded, oldest evicted first)
//! - Topic extraction over user turns
//! - A character-bounded context window for the response generator

mod builder;
mod topics;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use builder::{ConversationContext, build_context};
pub use topics::{Topic, extract_topics};

use crate::Result;
use crate::config::SessionConfig;
use crate::session::{ConversationTurn, Session, SessionStore, TurnRole};

/// Append a turn, evicting the oldest beyond `max_history`
pub fn append_turn(
    session: &mut Session,
    role: TurnRole,
    text: impl Into<String>,
    max_history: usize,
    now: DateTime<Utc>,
) {
    session.interaction_count += 1;
    session.turns.push_back(ConversationTurn {
        role,
        text: text.into(),
        timestamp: now,
        interaction_index: session.interaction_count,
    });

    while session.turns.len() > max_history {
        session.turns.pop_front();
    }
}

/// Conversation overview for inspection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub session_id: String,
    pub turn_count: usize,
    pub user_turns: usize,
    pub assistant_turns: usize,
    pub interaction_count: u64,
    pub topics: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Seconds between creation and last activity
    pub duration_secs: i64,
    pub last_user_message: Option<String>,
}

impl ConversationSummary {
    #[must_use]
    pub fn of(session: &Session) -> Self {
        let user_turns = session
            .turns
            .iter()
            .filter(|t| t.role == TurnRole::User)
            .count();

        Self {
            session_id: session.id.clone(),
            turn_count: session.turns.len(),
            user_turns,
            assistant_turns: session.turns.len() - user_turns,
            interaction_count: session.interaction_count,
            topics: session.topics.iter().cloned().collect(),
            created_at: session.created_at,
            last_active_at: session.last_active_at,
            duration_secs: (session.last_active_at - session.created_at).num_seconds(),
            last_user_message: session.last_user_turn().map(|t| t.text.clone()),
        }
    }
}

/// Records turns and serves context through the session store
pub struct ConversationManager {
    store: Arc<SessionStore>,
    max_history: usize,
    max_context_chars: usize,
}

impl ConversationManager {
    #[must_use]
    pub fn new(store: Arc<SessionStore>, config: &SessionConfig) -> Self {
        Self {
            store,
            max_history: config.max_history.max(1),
            max_context_chars: config.context_max_chars,
        }
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Default character budget for [`Self::context`]
    #[must_use]
    pub const fn max_context_chars(&self) -> usize {
        self.max_context_chars
    }

    /// Append a user turn and merge its topics into the session
    ///
    /// Returns the topics that were new to the session.
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be loaded
    pub async fn record_user_turn(&self, session_id: &str, text: &str) -> Result<BTreeSet<Topic>> {
        let mentioned = extract_topics(text);
        let max_history = self.max_history;

        let added = self
            .store
            .update(session_id, |session| {
                append_turn(session, TurnRole::User, text, max_history, Utc::now());
                mentioned
                    .into_iter()
                    .filter(|topic| session.topics.insert(topic.as_str().to_string()))
                    .collect::<BTreeSet<_>>()
            })
            .await?;

        if !added.is_empty() {
            tracing::debug!(session_id, topics = ?added, "new topics");
        }
        Ok(added)
    }

    /// Append an assistant turn
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be loaded
    pub async fn record_assistant_turn(&self, session_id: &str, text: &str) -> Result<()> {
        let max_history = self.max_history;
        self.store
            .update(session_id, |session| {
                append_turn(session, TurnRole::Assistant, text, max_history, Utc::now());
            })
            .await
    }

    /// Context window with the configured budget
    ///
    /// # Errors
    ///
    /// Returns error if the durable store cannot be queried
    pub async fn context(&self, session_id: &str) -> Result<ConversationContext> {
        self.context_with_budget(session_id, self.max_context_chars)
            .await
            .map(Option::unwrap_or_default)
    }

    /// Context window with an explicit budget; `None` if the session is unknown
    ///
    /// # Errors
    ///
    /// Returns error if the durable store cannot be queried
    pub async fn context_with_budget(
        &self,
        session_id: &str,
        max_chars: usize,
    ) -> Result<Option<ConversationContext>> {
        self.store
            .read(session_id, |session| build_context(session, max_chars))
            .await
    }

    /// Full turn history, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if the durable store cannot be queried
    pub async fn history(&self, session_id: &str) -> Result<Option<Vec<ConversationTurn>>> {
        self.store
            .read(session_id, |session| session.turns.iter().cloned().collect())
            .await
    }

    /// # Errors
    ///
    /// Returns error if the durable store cannot be queried
    pub async fn summary(&self, session_id: &str) -> Result<Option<ConversationSummary>> {
        self.store.read(session_id, ConversationSummary::of).await
    }

    /// # Errors
    ///
    /// Returns error if the durable store cannot be queried
    pub async fn topics(&self, session_id: &str) -> Result<Option<Vec<String>>> {
        self.store
            .read(session_id, |session| session.topics.iter().cloned().collect())
            .await
    }

    /// Forget the conversation, keeping preferences
    ///
    /// # Errors
    ///
    /// Returns error if the durable store cannot be written
    pub async fn clear(&self, session_id: &str) -> Result<bool> {
        self.store.clear(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SessionRepo, init_memory};

    fn manager(max_history: usize) -> ConversationManager {
        let store = Arc::new(SessionStore::new(SessionRepo::new(init_memory().unwrap())));
        let config = SessionConfig {
            max_history,
            ..SessionConfig::default()
        };
        ConversationManager::new(store, &config)
    }

    #[test]
    fn append_evicts_oldest_first() {
        let mut session = Session::new("s1", Utc::now());
        for i in 0..5 {
            append_turn(&mut session, TurnRole::User, format!("turn {i}"), 3, Utc::now());
        }

        let texts: Vec<_> = session.turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["turn 2", "turn 3", "turn 4"]);
        assert_eq!(session.interaction_count, 5);
        assert_eq!(session.turns.back().unwrap().interaction_index, 5);
    }

    #[tokio::test]
    async fn user_turns_accumulate_topics_without_duplicates() {
        let manager = manager(50);

        let first = manager
            .record_user_turn("s1", "my exam is tomorrow")
            .await
            .unwrap();
        assert!(first.contains(&Topic::Education));

        let second = manager
            .record_user_turn("s1", "the exam is about history")
            .await
            .unwrap();
        assert!(second.is_empty());

        manager
            .record_assistant_turn("s1", "want to plan a trip after?")
            .await
            .unwrap();

        let topics = manager.topics("s1").await.unwrap().unwrap();
        assert_eq!(topics, vec!["education".to_string()]);
    }

    #[tokio::test]
    async fn summary_counts_roles() {
        let manager = manager(50);
        manager.record_user_turn("s1", "hello").await.unwrap();
        manager.record_assistant_turn("s1", "hi there").await.unwrap();
        manager.record_user_turn("s1", "bye").await.unwrap();

        let summary = manager.summary("s1").await.unwrap().unwrap();
        assert_eq!(summary.turn_count, 3);
        assert_eq!(summary.user_turns, 2);
        assert_eq!(summary.assistant_turns, 1);
        assert_eq!(summary.last_user_message.as_deref(), Some("bye"));
    }

    #[tokio::test]
    async fn unknown_session_has_no_history() {
        let manager = manager(50);
        assert!(manager.history("ghost").await.unwrap().is_none());
        assert!(manager.context("ghost").await.unwrap().is_empty());
    }
}
