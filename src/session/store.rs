//! Session store: the single owner of live sessions
//!
//! The active map holds one slot per session id. Each slot has its own async
//! mutex, so operations on the same session serialize while different sessions
//! proceed independently. Callers only ever see a session inside a closure
//! passed to an accessor; no reference escapes the lock.
//!
//! Lock order is always slot mutex before the map lock. Map lookups release
//! the map lock before waiting on a slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::Session;
use crate::db::SessionRepo;
use crate::{Error, Result};

struct SessionEntry {
    session: Session,
    /// Set by eviction; holders of a stale slot must look the id up again
    evicted: bool,
}

type Slot = Arc<Mutex<SessionEntry>>;

/// Owner of all live sessions, backed by the durable repository
pub struct SessionStore {
    active: RwLock<HashMap<String, Slot>>,
    repo: SessionRepo,
}

impl SessionStore {
    /// Create an empty store; nothing is loaded until first lookup
    #[must_use]
    pub fn new(repo: SessionRepo) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            repo,
        }
    }

    /// Durable repository backing this store
    #[must_use]
    pub const fn repo(&self) -> &SessionRepo {
        &self.repo
    }

    /// Return a copy of the session, creating or rehydrating it if needed
    ///
    /// Counts as activity: `last_active_at` is refreshed.
    ///
    /// # Errors
    ///
    /// Returns error if the durable store cannot be queried
    pub async fn get_or_create(&self, id: &str) -> Result<Session> {
        self.update(id, |session| session.clone()).await
    }

    /// Record activity without other changes
    ///
    /// Called for every inbound audio frame, so it does not write through;
    /// the new timestamp reaches the durable store with the next update,
    /// eviction or flush.
    ///
    /// # Errors
    ///
    /// Returns error if the durable store cannot be queried
    pub async fn touch(&self, id: &str) -> Result<()> {
        let mut entry = self
            .lock_live(id, true)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        entry.session.touch(Utc::now());
        Ok(())
    }

    /// Apply an inbound interaction to the session
    ///
    /// The session is created or rehydrated if absent, touched, mutated by
    /// `f`, and written through to the durable store.
    ///
    /// # Errors
    ///
    /// Returns error if the durable store cannot be queried
    pub async fn update<R>(&self, id: &str, f: impl FnOnce(&mut Session) -> R) -> Result<R> {
        let mut entry = self
            .lock_live(id, true)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        entry.session.touch(Utc::now());
        let out = f(&mut entry.session);

        if let Err(e) = self.repo.save(&entry.session) {
            tracing::warn!(session_id = %id, error = %e, "write-through failed, will retry on eviction");
        }

        Ok(out)
    }

    /// Mutate transient state without counting it as user activity
    ///
    /// Used for fields that are not persisted, such as the active stream id.
    ///
    /// # Errors
    ///
    /// Returns error if the durable store cannot be queried
    pub async fn modify<R>(&self, id: &str, f: impl FnOnce(&mut Session) -> R) -> Result<R> {
        let mut entry = self
            .lock_live(id, true)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        Ok(f(&mut entry.session))
    }

    /// Read a session without creating, touching or activating it
    ///
    /// Falls back to the durable store for sessions that are not active.
    ///
    /// # Errors
    ///
    /// Returns error if the durable store cannot be queried
    pub async fn read<R>(&self, id: &str, f: impl FnOnce(&Session) -> R) -> Result<Option<R>> {
        let slot = self.active.read().await.get(id).cloned();
        if let Some(slot) = slot {
            let entry = slot.lock().await;
            if !entry.evicted {
                return Ok(Some(f(&entry.session)));
            }
        }

        Ok(self.repo.load(id)?.map(|session| f(&session)))
    }

    /// Copy of the session's current state, if it exists anywhere
    ///
    /// # Errors
    ///
    /// Returns error if the durable store cannot be queried
    pub async fn snapshot(&self, id: &str) -> Result<Option<Session>> {
        self.read(id, Session::clone).await
    }

    /// Forget a session's conversation memory, keeping its id and preferences
    ///
    /// Returns `false` if the session does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if the durable store cannot be written
    pub async fn clear(&self, id: &str) -> Result<bool> {
        let Some(mut entry) = self.lock_live(id, false).await? else {
            return Ok(false);
        };

        entry.session.turns.clear();
        entry.session.topics.clear();
        entry.session.interaction_count = 0;
        self.repo.save(&entry.session)?;

        tracing::info!(session_id = %id, "session memory cleared");
        Ok(true)
    }

    /// Persist a final snapshot and drop the session from the active map
    ///
    /// Returns the persisted snapshot, or `None` if the session was not active.
    /// Reserved for the reaper; other components only mutate in place.
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot cannot be written; the session then
    /// stays active
    pub async fn remove(&self, id: &str) -> Result<Option<Session>> {
        let slot = self.active.read().await.get(id).cloned();
        let Some(slot) = slot else {
            return Ok(None);
        };

        let mut entry = slot.clone().lock_owned().await;
        if entry.evicted {
            return Ok(None);
        }

        self.evict(id, &slot, &mut entry).await?;
        Ok(Some(entry.session.clone()))
    }

    /// Evict every active session idle for at least `timeout` as of `now`
    ///
    /// The idle check runs under the session's lock, so a touch that
    /// completed before the check is always honored. Sessions with an
    /// in-flight synthesis stream are kept.
    ///
    /// Returns the ids that were evicted.
    pub async fn expire_idle(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let candidates: Vec<(String, Slot)> = self
            .active
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        let mut expired = Vec::new();
        for (id, slot) in candidates {
            let mut entry = slot.clone().lock_owned().await;
            if entry.evicted
                || entry.session.active_stream_id.is_some()
                || !entry.session.is_expired(now, timeout)
            {
                continue;
            }

            match self.evict(&id, &slot, &mut entry).await {
                Ok(()) => expired.push(id),
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "failed to persist expiring session, keeping it active");
                }
            }
        }

        expired
    }

    /// Write every active session to the durable store
    pub async fn flush_all(&self) -> usize {
        let slots: Vec<Slot> = self.active.read().await.values().cloned().collect();

        let mut saved = 0;
        for slot in slots {
            let entry = slot.lock().await;
            if entry.evicted {
                continue;
            }
            match self.repo.save(&entry.session) {
                Ok(()) => saved += 1,
                Err(e) => {
                    tracing::error!(session_id = %entry.session.id, error = %e, "failed to flush session");
                }
            }
        }

        saved
    }

    /// Whether the session is in the active map
    pub async fn is_active(&self, id: &str) -> bool {
        self.active.read().await.contains_key(id)
    }

    /// Number of sessions in the active map
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Ids in the active map
    pub async fn active_ids(&self) -> Vec<String> {
        self.active.read().await.keys().cloned().collect()
    }

    /// Save, mark evicted and remove from the map; caller holds the slot lock
    async fn evict(&self, id: &str, slot: &Slot, entry: &mut SessionEntry) -> Result<()> {
        self.repo.save(&entry.session)?;
        entry.evicted = true;

        let mut map = self.active.write().await;
        if map.get(id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            map.remove(id);
        }
        drop(map);

        tracing::info!(
            session_id = %id,
            turns = entry.session.turns.len(),
            "session persisted and evicted"
        );
        Ok(())
    }

    /// Lock the live slot for `id`, retrying if it was evicted meanwhile
    async fn lock_live(
        &self,
        id: &str,
        create: bool,
    ) -> Result<Option<OwnedMutexGuard<SessionEntry>>> {
        loop {
            let Some(slot) = self.slot(id, create).await? else {
                return Ok(None);
            };
            let guard = slot.lock_owned().await;
            if !guard.evicted {
                return Ok(Some(guard));
            }
            tracing::debug!(session_id = %id, "slot evicted while waiting, looking up again");
        }
    }

    /// Find the active slot, rehydrating from the durable store on a miss
    async fn slot(&self, id: &str, create: bool) -> Result<Option<Slot>> {
        if let Some(slot) = self.active.read().await.get(id) {
            return Ok(Some(Arc::clone(slot)));
        }

        // Load outside the map lock so other sessions are not held up by IO
        let session = match self.repo.load(id)? {
            Some(session) => {
                tracing::info!(session_id = %id, turns = session.turns.len(), "session rehydrated");
                session
            }
            None if create => {
                tracing::info!(session_id = %id, "session created");
                Session::new(id, Utc::now())
            }
            None => return Ok(None),
        };

        let mut map = self.active.write().await;
        let slot = map
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SessionEntry {
                    session,
                    evicted: false,
                }))
            })
            .clone();
        Ok(Some(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn store() -> SessionStore {
        SessionStore::new(SessionRepo::new(init_memory().unwrap()))
    }

    #[tokio::test]
    async fn get_or_create_returns_same_session() {
        let store = store();

        let first = store.get_or_create("abc").await.unwrap();
        let second = store.get_or_create("abc").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert!(second.last_active_at >= first.last_active_at);
        assert_eq!(store.active_count().await, 1);
    }

    #[tokio::test]
    async fn read_does_not_create() {
        let store = store();
        assert!(store.snapshot("ghost").await.unwrap().is_none());
        assert_eq!(store.active_count().await, 0);
    }

    #[tokio::test]
    async fn remove_persists_then_evicts() {
        let store = store();
        store
            .update("abc", |s| s.topics.insert("travel".to_string()))
            .await
            .unwrap();

        let removed = store.remove("abc").await.unwrap().unwrap();
        assert!(removed.topics.contains("travel"));
        assert!(!store.is_active("abc").await);

        // Still readable from the durable store
        let snap = store.snapshot("abc").await.unwrap().unwrap();
        assert_eq!(snap.topics, removed.topics);

        // And rehydrated on next access
        let again = store.get_or_create("abc").await.unwrap();
        assert!(again.topics.contains("travel"));
    }

    #[tokio::test]
    async fn clear_keeps_preferences() {
        let store = store();
        store
            .update("abc", |s| {
                s.topics.insert("food".to_string());
                s.interaction_count = 4;
                s.preferences.insert(
                    "voice".to_string(),
                    crate::session::PreferenceValue::Text("nova".to_string()),
                );
            })
            .await
            .unwrap();

        assert!(store.clear("abc").await.unwrap());
        let snap = store.snapshot("abc").await.unwrap().unwrap();
        assert!(snap.topics.is_empty());
        assert_eq!(snap.interaction_count, 0);
        assert_eq!(snap.preference_text("voice"), Some("nova"));

        assert!(!store.clear("missing").await.unwrap());
    }

    #[tokio::test]
    async fn modify_does_not_touch() {
        let store = store();
        let created = store.get_or_create("abc").await.unwrap();

        store
            .modify("abc", |s| s.active_stream_id = Some("tts-1".to_string()))
            .await
            .unwrap();

        let snap = store.snapshot("abc").await.unwrap().unwrap();
        assert_eq!(snap.last_active_at, created.last_active_at);
        assert_eq!(snap.active_stream_id.as_deref(), Some("tts-1"));
    }

    #[tokio::test]
    async fn concurrent_updates_on_one_session_serialize() {
        let store = Arc::new(store());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.update("shared", |s| s.interaction_count += 1).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let snap = store.snapshot("shared").await.unwrap().unwrap();
        assert_eq!(snap.interaction_count, 20);
    }
}
