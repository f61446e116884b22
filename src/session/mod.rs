//! Voice sessions: durable, timeout-scoped conversational state
//!
//! A [`Session`] is owned by the [`SessionStore`]. Other components reach it
//! only through store accessors and never keep it past a single operation,
//! because the [`reaper`] may expire and evict it at any time.

pub mod reaper;
pub mod store;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use reaper::{SessionReaper, spawn_reaper};
pub use store::SessionStore;

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message in a conversation; immutable once appended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Value of the session's interaction counter when the turn was recorded
    pub interaction_index: u64,
}

/// Scalar preference value (voice choice, language, verbosity, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PreferenceValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl PreferenceValue {
    /// String view, for preferences such as `voice` and `language`
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Conversation state for one user connection lineage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Oldest first, bounded by the store's `max_history`
    pub turns: VecDeque<ConversationTurn>,
    pub topics: BTreeSet<String>,
    pub preferences: BTreeMap<String, PreferenceValue>,
    /// In-flight synthesis stream; never persisted
    #[serde(skip)]
    pub active_stream_id: Option<String>,
    pub interaction_count: u64,
}

impl Session {
    /// Create an empty session stamped with `now`
    #[must_use]
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at: now,
            last_active_at: now,
            turns: VecDeque::new(),
            topics: BTreeSet::new(),
            preferences: BTreeMap::new(),
            active_stream_id: None,
            interaction_count: 0,
        }
    }

    /// Record inbound activity
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_active_at {
            self.last_active_at = now;
        }
    }

    /// Whether the session has been idle for at least `timeout`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return false;
        };
        now - self.last_active_at >= timeout
    }

    /// Most recent user turn, if any
    #[must_use]
    pub fn last_user_turn(&self) -> Option<&ConversationTurn> {
        self.turns.iter().rev().find(|t| t.role == TurnRole::User)
    }

    /// Text preference by key
    #[must_use]
    pub fn preference_text(&self, key: &str) -> Option<&str> {
        self.preferences.get(key).and_then(PreferenceValue::as_text)
    }
}
