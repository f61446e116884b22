//! Session repository for durable snapshots
//!
//! One row per session keyed by id. Turns, topics and preferences are stored
//! as JSON columns; timestamps as RFC 3339 text.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use super::DbPool;
use crate::session::Session;
use crate::{Error, Result};

/// Raw row as stored, before JSON decoding
struct SessionRow {
    id: String,
    created_at: String,
    last_active_at: String,
    interaction_count: i64,
    turns: String,
    topics: String,
    preferences: String,
}

/// Session repository
#[derive(Clone)]
pub struct SessionRepo {
    pool: DbPool,
}

impl SessionRepo {
    /// Create a new session repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert or overwrite the snapshot for `session.id`
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn save(&self, session: &Session) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let turns = serde_json::to_string(&session.turns)?;
        let topics = serde_json::to_string(&session.topics)?;
        let preferences = serde_json::to_string(&session.preferences)?;
        let count = i64::try_from(session.interaction_count).unwrap_or(i64::MAX);

        conn.execute(
            "INSERT INTO voice_sessions
                (id, created_at, last_active_at, interaction_count, turns, topics, preferences, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                last_active_at = excluded.last_active_at,
                interaction_count = excluded.interaction_count,
                turns = excluded.turns,
                topics = excluded.topics,
                preferences = excluded.preferences,
                updated_at = excluded.updated_at",
            rusqlite::params![
                session.id,
                session.created_at.to_rfc3339(),
                session.last_active_at.to_rfc3339(),
                count,
                turns,
                topics,
                preferences,
                Utc::now().to_rfc3339(),
            ],
        )?;

        tracing::trace!(session_id = %session.id, turns = session.turns.len(), "session saved");
        Ok(())
    }

    /// Load a snapshot
    ///
    /// A row that cannot be decoded is reported as absent so callers start a
    /// fresh session instead of failing.
    ///
    /// # Errors
    ///
    /// Returns error if the database itself cannot be queried
    pub fn load(&self, id: &str) -> Result<Option<Session>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let row = conn
            .query_row(
                "SELECT id, created_at, last_active_at, interaction_count, turns, topics, preferences
                 FROM voice_sessions WHERE id = ?1",
                [id],
                |row| {
                    Ok(SessionRow {
                        id: row.get(0)?,
                        created_at: row.get(1)?,
                        last_active_at: row.get(2)?,
                        interaction_count: row.get(3)?,
                        turns: row.get(4)?,
                        topics: row.get(5)?,
                        preferences: row.get(6)?,
                    })
                },
            )
            .optional()?;

        let Some(row) = row else {
            return Ok(None);
        };

        match decode(row) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "unreadable session record, treating as absent");
                Ok(None)
            }
        }
    }

    /// Delete a snapshot, returning whether a row existed
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let removed = conn.execute("DELETE FROM voice_sessions WHERE id = ?1", [id])?;
        Ok(removed > 0)
    }

    /// All stored session ids, most recently active first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_ids(&self) -> Result<Vec<String>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt =
            conn.prepare("SELECT id FROM voice_sessions ORDER BY last_active_at DESC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;

        Ok(ids)
    }

    /// Ids of sessions whose last activity is at or before `cutoff`
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_idle_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn.prepare(
            "SELECT id, last_active_at FROM voice_sessions ORDER BY last_active_at ASC",
        )?;

        // Compare parsed timestamps rather than strings: offsets may differ
        let ids = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .filter_map(std::result::Result::ok)
            .filter(|(_, ts)| parse_datetime(ts).is_ok_and(|t| t <= cutoff))
            .map(|(id, _)| id)
            .collect();

        Ok(ids)
    }

    /// Number of stored sessions
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn count(&self) -> Result<usize> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM voice_sessions", [], |row| {
            row.get(0)
        })?;

        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Check the database answers queries
    ///
    /// # Errors
    ///
    /// Returns error if no connection can be obtained or the query fails
    pub fn ping(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

fn decode(row: SessionRow) -> Result<Session> {
    Ok(Session {
        id: row.id,
        created_at: parse_datetime(&row.created_at)?,
        last_active_at: parse_datetime(&row.last_active_at)?,
        turns: serde_json::from_str(&row.turns)?,
        topics: serde_json::from_str(&row.topics)?,
        preferences: serde_json::from_str(&row.preferences)?,
        active_stream_id: None,
        interaction_count: u64::try_from(row.interaction_count)
            .map_err(|_| Error::Database("negative interaction count".to_string()))?,
    })
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Database(format!("bad timestamp {s:?}: {e}")))
}
