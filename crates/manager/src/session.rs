//! Session registry
//!
//! A session is a named bag of page ids with timestamps and free-form
//! metadata. The registry owns the membership index; the manager asks it to
//! create, look up, rebind, and delete, and closes live handles itself.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{epoch_secs, PageId, StateStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub created_at: u64,
    pub last_accessed: u64,
    #[serde(default)]
    pub pages: BTreeSet<PageId>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Session {
    fn new(id: String, name: Option<&str>) -> Self {
        let now = epoch_secs();
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("Session {id}"));
        Self {
            id,
            name,
            created_at: now,
            last_accessed: now,
            pages: BTreeSet::new(),
            metadata: serde_json::Map::new(),
        }
    }
}

pub struct SessionRegistry {
    store: Arc<StateStore>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    /// Load the registry from persisted state.
    pub async fn open(store: Arc<StateStore>) -> Self {
        let sessions = store.load_sessions().await;
        Self {
            store,
            sessions: Mutex::new(sessions),
        }
    }

    /// Create a session with an empty member set and persist it.
    pub async fn create(&self, name: Option<&str>) -> String {
        let id = Uuid::now_v7().to_string();
        let session = Session::new(id.clone(), name);

        let mut sessions = self.sessions.lock().await;
        sessions.insert(id.clone(), session);
        self.store.save_sessions(&sessions).await;
        tracing::info!("created session {id}");
        id
    }

    /// Look up a session, refreshing its last-accessed time. When the id is
    /// not in memory the persisted file is consulted once more, so a session
    /// survives a restart even if this registry was rebuilt lazily.
    pub async fn get(&self, id: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;

        if !sessions.contains_key(id) {
            let persisted = self.store.load_sessions().await;
            if let Some(session) = persisted.get(id) {
                sessions.insert(id.to_string(), session.clone());
            }
        }

        let session = sessions.get_mut(id)?;
        session.last_accessed = epoch_secs();
        let found = session.clone();
        self.store.save_sessions(&sessions).await;
        Some(found)
    }

    /// Remove a session. The caller is responsible for its live pages.
    pub async fn remove(&self, id: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;
        let removed = sessions.remove(id)?;
        self.store.save_sessions(&sessions).await;
        tracing::info!("deleted session {id}");
        Some(removed)
    }

    /// Bind a page to a session, detaching it from any previous one. A page
    /// belongs to at most one session at a time. Returns `false` when the
    /// target session is unknown.
    pub async fn add_page(&self, page_id: &str, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        if !sessions.contains_key(session_id) {
            tracing::warn!("cannot bind page {page_id}: session {session_id} not found");
            return false;
        }

        for session in sessions.values_mut() {
            session.pages.remove(page_id);
        }
        if let Some(session) = sessions.get_mut(session_id) {
            session.pages.insert(page_id.to_string());
            session.last_accessed = epoch_secs();
        }

        self.store.save_sessions(&sessions).await;
        true
    }

    /// Member page ids of a session, or None when the session is unknown.
    pub async fn member_pages(&self, id: &str) -> Option<Vec<PageId>> {
        let sessions = self.sessions.lock().await;
        sessions.get(id).map(|s| s.pages.iter().cloned().collect())
    }

    pub async fn list(&self) -> Vec<Session> {
        let sessions = self.sessions.lock().await;
        let mut list: Vec<Session> = sessions.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }
}
