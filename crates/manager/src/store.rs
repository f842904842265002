//! Persistence store - two JSON documents under a lock
//!
//! `browser_state.json` holds page metadata, `sessions.json` the session
//! list. Both are rewritten after every mutation; durability is best-effort
//! and a corrupt or missing file is treated as empty state.
//!
//! Mutual exclusion: an in-process mutex is the authoritative guard (all
//! consumers live in one runtime). The sentinel file alongside it keeps the
//! original cross-process discipline - bounded wait, takeover of an
//! abandoned sentinel, release on drop - but correctness never depends on it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use driver::EngineKind;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::session::Session;

pub type PageId = String;

const STATE_FILE: &str = "browser_state.json";
const SESSIONS_FILE: &str = "sessions.json";
const LOCK_FILE: &str = "browser_lock";

const LOCK_RETRIES: u32 = 10;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Marker URL for a page that was never navigated.
pub const BLANK_URL: &str = "about:blank";

/// Seconds since the epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Durable description of a logical page. Never holds a live handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageMeta {
    pub created_at: u64,
    pub last_accessed: u64,
    #[serde(default)]
    pub last_updated: u64,
    pub last_url: String,
    #[serde(default)]
    pub title: String,
    pub browser_type: EngineKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl PageMeta {
    pub fn new(browser_type: EngineKind) -> Self {
        let now = epoch_secs();
        Self {
            created_at: now,
            last_accessed: now,
            last_updated: now,
            last_url: BLANK_URL.to_string(),
            title: String::new(),
            browser_type,
            session_id: None,
        }
    }

    /// Most recent of access and mutation, the basis for idle eviction.
    pub fn last_activity(&self) -> u64 {
        self.last_accessed.max(self.last_updated)
    }

    pub fn touch(&mut self) {
        self.last_accessed = epoch_secs();
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BrowserState {
    #[serde(default)]
    page_metadata: HashMap<PageId, PageMeta>,
}

pub struct StateStore {
    state_path: PathBuf,
    sessions_path: PathBuf,
    lock_path: PathBuf,
    gate: Arc<Mutex<()>>,
}

/// Held for the duration of a read-then-write sequence. Dropping it releases
/// the in-process gate and removes the sentinel.
struct StoreLock {
    _gate: OwnedMutexGuard<()>,
    sentinel: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.sentinel) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to remove lock sentinel: {e}");
            }
        }
    }
}

impl StateStore {
    pub fn new(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            state_path: dir.join(STATE_FILE),
            sessions_path: dir.join(SESSIONS_FILE),
            lock_path: dir.join(LOCK_FILE),
            gate: Arc::new(Mutex::new(())),
        })
    }

    async fn lock(&self) -> StoreLock {
        let gate = Arc::clone(&self.gate).lock_owned().await;

        // Poll-wait for a sentinel left by another process, then take over.
        let mut waited = 0;
        while self.lock_path.exists() && waited < LOCK_RETRIES {
            tokio::time::sleep(LOCK_RETRY_DELAY).await;
            waited += 1;
        }
        if self.lock_path.exists() {
            tracing::warn!("lock sentinel still present after wait, treating as abandoned");
            let _ = std::fs::remove_file(&self.lock_path);
        }

        if let Err(e) = std::fs::write(&self.lock_path, epoch_secs().to_string()) {
            tracing::warn!("failed to write lock sentinel: {e}");
        }

        StoreLock {
            _gate: gate,
            sentinel: self.lock_path.clone(),
        }
    }

    pub async fn load_pages(&self) -> HashMap<PageId, PageMeta> {
        let _lock = self.lock().await;
        match read_json::<BrowserState>(&self.state_path) {
            Some(state) => {
                tracing::info!("loaded state with {} pages", state.page_metadata.len());
                state.page_metadata
            }
            None => HashMap::new(),
        }
    }

    pub async fn save_pages(&self, pages: &HashMap<PageId, PageMeta>) {
        let _lock = self.lock().await;
        let state = BrowserState {
            page_metadata: pages.clone(),
        };
        write_json(&self.state_path, &state);
    }

    pub async fn load_sessions(&self) -> HashMap<String, Session> {
        let _lock = self.lock().await;
        match read_json::<Vec<Session>>(&self.sessions_path) {
            Some(list) => {
                tracing::info!("loaded {} sessions", list.len());
                list.into_iter().map(|s| (s.id.clone(), s)).collect()
            }
            None => HashMap::new(),
        }
    }

    pub async fn save_sessions(&self, sessions: &HashMap<String, Session>) {
        let _lock = self.lock().await;
        let list: Vec<&Session> = sessions.values().collect();
        write_json(&self.sessions_path, &list);
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        tracing::info!("no saved state at {}, starting fresh", path.display());
        return None;
    }
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("error reading {}: {e}", path.display());
            return None;
        }
    };
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::error!("corrupt state in {}: {e}", path.display());
            None
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) {
    match serde_json::to_string(value) {
        Ok(text) => {
            if let Err(e) = std::fs::write(path, text) {
                tracing::error!("error writing {}: {e}", path.display());
            }
        }
        Err(e) => tracing::error!("error serializing {}: {e}", path.display()),
    }
}
