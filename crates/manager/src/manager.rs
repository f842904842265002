//! Page manager - lifecycle of engines, contexts, and logical pages
//!
//! A logical page is a stable numeric id whose metadata outlives the live
//! browser tab behind it. Handles are resolved lazily: asking for a known id
//! whose tab is gone relaunches the engine, opens a fresh tab, and replays
//! the last recorded URL. All state transitions happen under one async lock,
//! so id allocation and engine startup are serialized.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use driver::{BrowsingContext, Driver, Engine, EngineKind, PageHandle};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::Settings;
use crate::error::{ManagerError, Result};
use crate::session::{Session, SessionRegistry};
use crate::store::{epoch_secs, PageId, PageMeta, StateStore, BLANK_URL};
use crate::telemetry::TelemetryCollector;

/// Forced cleanup never closes below this many live tabs.
pub const CLEANUP_FLOOR: usize = 3;

/// What a cleanup pass did.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub original_tab_count: usize,
    pub inactive_tabs_closed: usize,
    pub forced_tabs_closed: usize,
    pub total_closed: usize,
    pub current_tab_count: usize,
}

/// Point-in-time description of a logical page.
#[derive(Debug, Clone, Serialize)]
pub struct PageInfo {
    pub page_id: PageId,
    pub url: String,
    pub title: String,
    pub browser_type: EngineKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub is_live: bool,
    pub created_at: u64,
    pub last_accessed: u64,
    pub idle_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TabStatus {
    pub live_tabs: usize,
    pub persisted_pages: usize,
    pub max_tabs: usize,
    pub idle_tabs: usize,
    pub session_count: usize,
    /// The tab the next eviction pass would close first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_to_close: Option<PageId>,
}

struct EngineSlot {
    engine: Arc<dyn Engine>,
    context: Arc<dyn BrowsingContext>,
}

impl Clone for EngineSlot {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            context: Arc::clone(&self.context),
        }
    }
}

#[derive(Default)]
struct ManagerState {
    engines: HashMap<EngineKind, EngineSlot>,
    live: HashMap<PageId, Arc<dyn PageHandle>>,
    meta: HashMap<PageId, PageMeta>,
}

pub struct PageManager {
    settings: Settings,
    driver: Arc<dyn Driver>,
    store: Arc<StateStore>,
    registry: SessionRegistry,
    telemetry: TelemetryCollector,
    storage_dir: PathBuf,
    state: Mutex<ManagerState>,
}

impl PageManager {
    /// Open a manager over a storage directory. Persisted page metadata is
    /// loaded immediately; tabs themselves are only recreated on demand.
    pub async fn open(
        settings: Settings,
        driver: Arc<dyn Driver>,
        storage_dir: &Path,
    ) -> Result<Arc<Self>> {
        let store = Arc::new(StateStore::new(storage_dir)?);
        let registry = SessionRegistry::open(Arc::clone(&store)).await;
        let telemetry = TelemetryCollector::new(storage_dir, settings.capture_network);
        let meta = store.load_pages().await;

        Ok(Arc::new(Self {
            settings,
            driver,
            store,
            registry,
            telemetry,
            storage_dir: storage_dir.to_path_buf(),
            state: Mutex::new(ManagerState {
                engines: HashMap::new(),
                live: HashMap::new(),
                meta,
            }),
        }))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn telemetry(&self) -> &TelemetryCollector {
        &self.telemetry
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn nav_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.timeout)
    }

    /// Resolve a page handle. With an id this returns the live handle or
    /// restores the tab from persisted metadata; an id nothing is known
    /// about behaves like no id at all and allocates a fresh page under the
    /// next sequential id. An optional session id binds the page to that
    /// session, and `browser_type` overrides the configured default for new
    /// pages (and is the preferred fallback when a restore's original engine
    /// will not start).
    pub async fn get_page(
        &self,
        page_id: Option<&str>,
        session_id: Option<&str>,
        browser_type: Option<EngineKind>,
    ) -> Result<(PageId, Arc<dyn PageHandle>)> {
        self.resolve_page(page_id, session_id, browser_type, true).await
    }

    /// Resolve a page the caller already holds an id for. Unlike `get_page`,
    /// an unknown id is an error rather than a fresh allocation, so
    /// operations such as screenshots and script evaluation never target a
    /// page the caller did not mean.
    pub async fn existing_page(&self, page_id: &str) -> Result<(PageId, Arc<dyn PageHandle>)> {
        self.resolve_page(Some(page_id), None, None, false).await
    }

    async fn resolve_page(
        &self,
        page_id: Option<&str>,
        session_id: Option<&str>,
        browser_type: Option<EngineKind>,
        create_unknown: bool,
    ) -> Result<(PageId, Arc<dyn PageHandle>)> {
        let mut state = self.state.lock().await;

        let (id, handle) = match page_id {
            Some(id) if state.live.contains_key(id) => {
                let handle = Arc::clone(&state.live[id]);
                if let Some(meta) = state.meta.get_mut(id) {
                    meta.touch();
                }
                (id.to_string(), handle)
            }
            Some(id) => match state.meta.get(id).cloned() {
                Some(meta) => {
                    let handle = self
                        .restore_page(&mut state, id, meta, browser_type)
                        .await?;
                    (id.to_string(), handle)
                }
                None if create_unknown => {
                    tracing::info!("page {id} is unknown, allocating a fresh page instead");
                    let kind = browser_type.unwrap_or(self.settings.default_browser);
                    self.create_page(&mut state, kind).await?
                }
                None => return Err(ManagerError::PageNotFound(id.to_string())),
            },
            None => {
                let kind = browser_type.unwrap_or(self.settings.default_browser);
                self.create_page(&mut state, kind).await?
            }
        };

        if let Some(session_id) = session_id {
            if self.registry.add_page(&id, session_id).await {
                if let Some(meta) = state.meta.get_mut(&id) {
                    meta.session_id = Some(session_id.to_string());
                }
            }
        }

        self.store.save_pages(&state.meta).await;
        Ok((id, handle))
    }

    async fn create_page(
        &self,
        state: &mut ManagerState,
        kind: EngineKind,
    ) -> Result<(PageId, Arc<dyn PageHandle>)> {
        self.make_room(state).await;

        let (kind, slot) = self
            .ensure_engine(state, kind, &[EngineKind::Chromium])
            .await?;
        let handle = slot.context.new_page().await?;

        let id = next_page_id(state);
        self.telemetry.attach(&handle, &id);
        state.live.insert(id.clone(), Arc::clone(&handle));
        state.meta.insert(id.clone(), PageMeta::new(kind));
        tracing::info!("created page {id} on {kind}");
        Ok((id, handle))
    }

    async fn restore_page(
        &self,
        state: &mut ManagerState,
        id: &str,
        mut meta: PageMeta,
        requested: Option<EngineKind>,
    ) -> Result<Arc<dyn PageHandle>> {
        self.make_room(state).await;

        // The page's original engine first, then whatever the caller asked
        // for this time, then Chromium.
        let fallbacks = [
            requested.unwrap_or(EngineKind::Chromium),
            EngineKind::Chromium,
        ];
        let (kind, slot) = self
            .ensure_engine(state, meta.browser_type, &fallbacks)
            .await?;
        let handle = slot.context.new_page().await?;

        if meta.last_url != BLANK_URL {
            if let Err(e) = handle.goto(&meta.last_url, self.nav_timeout()).await {
                tracing::warn!("could not restore page {id} to {}: {e}", meta.last_url);
                if let Err(e) = handle.goto(BLANK_URL, self.nav_timeout()).await {
                    tracing::warn!("blank fallback failed for page {id}: {e}");
                }
            } else {
                tracing::info!("restored page {id} to {}", meta.last_url);
            }
        }

        meta.browser_type = kind;
        meta.touch();
        self.telemetry.attach(&handle, id);
        state.live.insert(id.to_string(), Arc::clone(&handle));
        state.meta.insert(id.to_string(), meta);
        Ok(handle)
    }

    /// Get or launch the engine slot for a kind. When it cannot start, the
    /// fallback kinds are tried in order (repeats skipped) with a warning,
    /// so the caller still gets a working page on a different engine. The
    /// last launch error is returned when every candidate fails.
    async fn ensure_engine(
        &self,
        state: &mut ManagerState,
        kind: EngineKind,
        fallbacks: &[EngineKind],
    ) -> Result<(EngineKind, EngineSlot)> {
        let mut err = match self.engine_slot(state, kind).await {
            Ok(slot) => return Ok((kind, slot)),
            Err(e) => e,
        };

        let mut tried = vec![kind];
        for &fallback in fallbacks {
            if tried.contains(&fallback) {
                continue;
            }
            tracing::warn!(
                "engine {} unavailable ({err}), falling back to {fallback}",
                tried[tried.len() - 1]
            );
            tried.push(fallback);
            match self.engine_slot(state, fallback).await {
                Ok(slot) => return Ok((fallback, slot)),
                Err(e) => err = e,
            }
        }
        Err(err)
    }

    async fn engine_slot(&self, state: &mut ManagerState, kind: EngineKind) -> Result<EngineSlot> {
        if let Some(slot) = state.engines.get(&kind) {
            return Ok(slot.clone());
        }
        let engine = self
            .driver
            .launch(kind, &self.settings.launch_options())
            .await?;
        let context = engine.new_context(&self.settings.context_options()).await?;
        tracing::info!("launched {kind} engine");
        state.engines.insert(kind, EngineSlot { engine, context });
        Ok(state.engines[&kind].clone())
    }

    /// Keep the live tab count below the configured maximum before opening
    /// another tab. Idle tabs go first, then least recently active ones.
    async fn make_room(&self, state: &mut ManagerState) {
        if state.live.len() < self.settings.max_tabs {
            return;
        }
        tracing::info!(
            "tab limit reached ({} live), evicting",
            state.live.len()
        );

        let idle = self.idle_page_ids(state);
        for id in idle {
            if state.live.len() < self.settings.max_tabs {
                break;
            }
            self.close_live(state, &id).await;
        }

        while state.live.len() >= self.settings.max_tabs {
            let Some(id) = least_recently_active(state) else { break };
            self.close_live(state, &id).await;
        }
    }

    fn idle_page_ids(&self, state: &ManagerState) -> Vec<PageId> {
        let now = epoch_secs();
        let mut ids: Vec<PageId> = state
            .live
            .keys()
            .filter(|id| {
                state
                    .meta
                    .get(*id)
                    .map(|m| now.saturating_sub(m.last_activity()) > self.settings.tab_idle_timeout)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        ids.sort_by_key(|id| state.meta.get(id).map(|m| m.last_activity()).unwrap_or(0));
        ids
    }

    /// Close a live tab, folding its final URL and title back into metadata
    /// first so a later restore lands where the tab left off.
    async fn close_live(&self, state: &mut ManagerState, id: &str) {
        let Some(handle) = state.live.remove(id) else { return };

        let url = handle.url().await;
        let title = handle.title().await.unwrap_or_default();
        if let Some(meta) = state.meta.get_mut(id) {
            if !url.is_empty() {
                meta.last_url = url;
            }
            meta.title = title;
            meta.last_updated = epoch_secs();
        }

        self.telemetry.detach(id);
        if let Err(e) = handle.close().await {
            tracing::warn!("error closing page {id}: {e}");
        }
        tracing::info!("closed tab for page {id}");
    }

    /// Refresh a live page's persisted URL and title.
    pub async fn update_page_metadata(&self, page_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(handle) = state.live.get(page_id).map(Arc::clone) else {
            return Err(ManagerError::PageNotFound(page_id.to_string()));
        };

        let url = handle.url().await;
        let title = handle.title().await.unwrap_or_default();
        let meta = state
            .meta
            .get_mut(page_id)
            .ok_or_else(|| ManagerError::PageNotFound(page_id.to_string()))?;
        if !url.is_empty() {
            meta.last_url = url;
        }
        meta.title = title;
        meta.last_updated = epoch_secs();

        self.store.save_pages(&state.meta).await;
        Ok(())
    }

    /// Close a page's live tab. Metadata and session membership survive, so
    /// the id stays restorable. Fails when the page has no live tab.
    pub async fn close_page(&self, page_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.live.contains_key(page_id) {
            return Err(ManagerError::PageNotFound(page_id.to_string()));
        }

        self.close_live(&mut state, page_id).await;
        self.store.save_pages(&state.meta).await;
        Ok(())
    }

    /// Close idle tabs; with `force`, additionally close least recently
    /// active tabs down to the floor. Metadata survives so every closed page
    /// can still be restored by id.
    pub async fn cleanup_tabs(&self, force: bool) -> CleanupReport {
        let mut state = self.state.lock().await;
        let original = state.live.len();

        let mut inactive = 0;
        for id in self.idle_page_ids(&state) {
            self.close_live(&mut state, &id).await;
            inactive += 1;
        }

        let mut forced = 0;
        if force {
            while state.live.len() > CLEANUP_FLOOR {
                let Some(id) = least_recently_active(&state) else { break };
                self.close_live(&mut state, &id).await;
                forced += 1;
            }
        }

        self.store.save_pages(&state.meta).await;
        let report = CleanupReport {
            original_tab_count: original,
            inactive_tabs_closed: inactive,
            forced_tabs_closed: forced,
            total_closed: inactive + forced,
            current_tab_count: state.live.len(),
        };
        tracing::info!(
            "cleanup closed {} tabs ({} idle, {} forced), {} remain",
            report.total_closed,
            inactive,
            forced,
            report.current_tab_count
        );
        report
    }

    /// Delete a session along with all of its member pages.
    pub async fn delete_session(&self, session_id: &str) -> Result<Session> {
        let members = self
            .registry
            .member_pages(session_id)
            .await
            .ok_or_else(|| ManagerError::SessionNotFound(session_id.to_string()))?;

        let mut state = self.state.lock().await;
        for id in &members {
            self.close_live(&mut state, id).await;
            state.meta.remove(id);
        }
        self.store.save_pages(&state.meta).await;
        drop(state);

        self.registry
            .remove(session_id)
            .await
            .ok_or_else(|| ManagerError::SessionNotFound(session_id.to_string()))
    }

    pub async fn live_page(&self, page_id: &str) -> Option<Arc<dyn PageHandle>> {
        let state = self.state.lock().await;
        state.live.get(page_id).map(Arc::clone)
    }

    pub async fn page_info(&self, page_id: &str) -> Result<PageInfo> {
        let state = self.state.lock().await;
        let meta = state
            .meta
            .get(page_id)
            .ok_or_else(|| ManagerError::PageNotFound(page_id.to_string()))?;
        Ok(page_info(page_id, meta, &state))
    }

    pub async fn list_pages(&self) -> Vec<PageInfo> {
        let state = self.state.lock().await;
        let mut pages: Vec<PageInfo> = state
            .meta
            .iter()
            .map(|(id, meta)| page_info(id, meta, &state))
            .collect();
        pages.sort_by(|a, b| numeric(&a.page_id).cmp(&numeric(&b.page_id)));
        pages
    }

    pub async fn tab_status(&self) -> TabStatus {
        let state = self.state.lock().await;
        let idle_tabs = self.idle_page_ids(&state).len();
        let session_count = self.registry.list().await.len();
        TabStatus {
            live_tabs: state.live.len(),
            persisted_pages: state.meta.len(),
            max_tabs: self.settings.max_tabs,
            idle_tabs,
            session_count,
            next_to_close: least_recently_active(&state),
        }
    }

    /// Persist everything and tear down tabs, contexts, and engines.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;

        let ids: Vec<PageId> = state.live.keys().cloned().collect();
        for id in ids {
            self.close_live(&mut state, &id).await;
        }
        self.store.save_pages(&state.meta).await;

        for (kind, slot) in state.engines.drain() {
            if let Err(e) = slot.context.close().await {
                tracing::warn!("error closing {kind} context: {e}");
            }
            if let Err(e) = slot.engine.close().await {
                tracing::warn!("error closing {kind} engine: {e}");
            }
        }
        tracing::info!("page manager closed");
    }

    #[cfg(test)]
    pub(crate) async fn backdate(&self, page_id: &str, secs: u64) {
        let mut state = self.state.lock().await;
        if let Some(meta) = state.meta.get_mut(page_id) {
            let then = epoch_secs().saturating_sub(secs);
            meta.last_accessed = then;
            meta.last_updated = then;
        }
    }
}

/// Smallest positive integer above every known page id.
fn next_page_id(state: &ManagerState) -> PageId {
    let max = state
        .meta
        .keys()
        .chain(state.live.keys())
        .filter_map(|id| id.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    (max + 1).to_string()
}

fn least_recently_active(state: &ManagerState) -> Option<PageId> {
    state
        .live
        .keys()
        .min_by_key(|id| state.meta.get(*id).map(|m| m.last_activity()).unwrap_or(0))
        .cloned()
}

fn page_info(id: &str, meta: &PageMeta, state: &ManagerState) -> PageInfo {
    PageInfo {
        page_id: id.to_string(),
        url: meta.last_url.clone(),
        title: meta.title.clone(),
        browser_type: meta.browser_type,
        session_id: meta.session_id.clone(),
        is_live: state.live.contains_key(id),
        created_at: meta.created_at,
        last_accessed: meta.last_accessed,
        idle_seconds: epoch_secs().saturating_sub(meta.last_activity()),
    }
}

fn numeric(id: &str) -> u64 {
    id.parse().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeDriver;
    use driver::PageEvent;

    async fn mk_manager_with(
        dir: &Path,
        settings: Settings,
    ) -> (Arc<PageManager>, Arc<FakeDriver>) {
        let fake = Arc::new(FakeDriver::new());
        let driver: Arc<dyn Driver> = Arc::clone(&fake) as Arc<dyn Driver>;
        let manager = PageManager::open(settings, driver, dir).await.unwrap();
        (manager, fake)
    }

    async fn mk_manager(dir: &Path) -> (Arc<PageManager>, Arc<FakeDriver>) {
        mk_manager_with(dir, Settings::default()).await
    }

    #[tokio::test]
    async fn test_page_ids_are_sequential() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _fake) = mk_manager(dir.path()).await;

        let (a, _) = manager.get_page(None, None, None).await.unwrap();
        let (b, _) = manager.get_page(None, None, None).await.unwrap();
        assert_eq!(a, "1");
        assert_eq!(b, "2");

        // Ids are never reused while metadata exists: max + 1, not a gap fill.
        manager.close_page("1").await.unwrap();
        let (c, _) = manager.get_page(None, None, None).await.unwrap();
        assert_eq!(c, "3");
    }

    #[tokio::test]
    async fn test_get_page_returns_same_live_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, fake) = mk_manager(dir.path()).await;

        let (id, _) = manager.get_page(None, None, None).await.unwrap();
        let _ = manager.get_page(Some(&id), None, None).await.unwrap();
        assert_eq!(fake.pages().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_id_allocates_fresh_page() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, fake) = mk_manager(dir.path()).await;

        // Asking for an id nothing is known about creates a new page under
        // the next sequential id, not under the requested one.
        let (id, _) = manager.get_page(Some("42"), None, None).await.unwrap();
        assert_eq!(id, "1");
        assert_eq!(fake.pages().len(), 1);
        assert!(matches!(
            manager.page_info("42").await,
            Err(ManagerError::PageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_existing_page_rejects_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, fake) = mk_manager(dir.path()).await;

        assert!(matches!(
            manager.existing_page("42").await,
            Err(ManagerError::PageNotFound(_))
        ));
        assert!(fake.pages().is_empty());

        // A known id resolves, live or stale.
        let (id, _) = manager.get_page(None, None, None).await.unwrap();
        manager.close_page(&id).await.unwrap();
        let (resolved, _) = manager.existing_page(&id).await.unwrap();
        assert_eq!(resolved, id);
    }

    #[tokio::test]
    async fn test_restore_after_restart_replays_last_url() {
        let dir = tempfile::tempdir().unwrap();

        let (manager, _fake) = mk_manager(dir.path()).await;
        let (id, handle) = manager.get_page(None, None, None).await.unwrap();
        handle
            .goto("https://example.com/docs", Duration::from_secs(5))
            .await
            .unwrap();
        manager.update_page_metadata(&id).await.unwrap();
        manager.close().await;

        // A new manager over the same directory restores the page by id.
        let (reopened, fake2) = mk_manager(dir.path()).await;
        let (restored_id, _) = reopened.get_page(Some(&id), None, None).await.unwrap();
        assert_eq!(restored_id, id);
        assert_eq!(
            fake2.pages()[0].visited(),
            vec!["https://example.com/docs".to_string()]
        );
    }

    #[tokio::test]
    async fn test_restore_falls_back_to_blank_on_failed_navigation() {
        let dir = tempfile::tempdir().unwrap();

        let (manager, _fake) = mk_manager(dir.path()).await;
        let (id, handle) = manager.get_page(None, None, None).await.unwrap();
        handle
            .goto("https://gone.example.com", Duration::from_secs(5))
            .await
            .unwrap();
        manager.update_page_metadata(&id).await.unwrap();
        manager.close().await;

        let (reopened, fake2) = mk_manager(dir.path()).await;
        fake2.fail_navigation_to("https://gone.example.com");
        let (_, handle) = reopened.get_page(Some(&id), None, None).await.unwrap();
        assert_eq!(handle.url().await, BLANK_URL);
    }

    #[tokio::test]
    async fn test_engine_fallback_when_kind_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, fake) = mk_manager(dir.path()).await;
        fake.mark_unavailable(EngineKind::Firefox);

        let (id, _) = manager
            .get_page(None, None, Some(EngineKind::Firefox))
            .await
            .unwrap();

        assert_eq!(fake.launches(), vec![EngineKind::Chromium]);
        let info = manager.page_info(&id).await.unwrap();
        assert_eq!(info.browser_type, EngineKind::Chromium);
    }

    #[tokio::test]
    async fn test_restore_prefers_requested_kind_over_default_fallback() {
        let dir = tempfile::tempdir().unwrap();

        let (manager, _fake) = mk_manager(dir.path()).await;
        let (id, _) = manager
            .get_page(None, None, Some(EngineKind::Firefox))
            .await
            .unwrap();
        manager.close().await;

        // The page's original engine is gone; the kind requested for this
        // call wins over the Chromium default.
        let (reopened, fake2) = mk_manager(dir.path()).await;
        fake2.mark_unavailable(EngineKind::Firefox);
        reopened
            .get_page(Some(&id), None, Some(EngineKind::Webkit))
            .await
            .unwrap();

        assert_eq!(fake2.launches(), vec![EngineKind::Webkit]);
        let info = reopened.page_info(&id).await.unwrap();
        assert_eq!(info.browser_type, EngineKind::Webkit);
    }

    #[tokio::test]
    async fn test_restored_page_still_records_telemetry() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, fake) = mk_manager(dir.path()).await;

        let (id, _) = manager.get_page(None, None, None).await.unwrap();
        fake.pages()[0].emit(PageEvent::Console {
            level: "log".to_string(),
            text: "before close".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Reopening the page gives it a new handle; its events must keep
        // landing in the same page's telemetry.
        manager.close_page(&id).await.unwrap();
        manager.get_page(Some(&id), None, None).await.unwrap();
        fake.pages()[1].emit(PageEvent::Console {
            level: "log".to_string(),
            text: "after restore".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let logs = manager.telemetry().console_logs(Some(&id));
        assert_eq!(logs[&id].len(), 2);
    }

    #[tokio::test]
    async fn test_tab_limit_evicts_least_recently_active() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            max_tabs: 3,
            ..Settings::default()
        };
        let (manager, fake) = mk_manager_with(dir.path(), settings).await;

        for _ in 0..3 {
            manager.get_page(None, None, None).await.unwrap();
        }
        manager.backdate("1", 60).await;

        // Opening a fourth page pushes out the stalest one.
        manager.get_page(None, None, None).await.unwrap();
        assert!(fake.pages()[0].is_closed());
        assert!(!fake.pages()[1].is_closed());
        assert_eq!(manager.tab_status().await.live_tabs, 3);

        // The evicted page is still restorable.
        manager.get_page(Some("1"), None, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_closes_idle_tabs() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            tab_idle_timeout: 300,
            ..Settings::default()
        };
        let (manager, fake) = mk_manager_with(dir.path(), settings).await;

        for _ in 0..4 {
            manager.get_page(None, None, None).await.unwrap();
        }
        manager.backdate("2", 400).await;
        manager.backdate("3", 500).await;

        let report = manager.cleanup_tabs(false).await;
        assert_eq!(report.original_tab_count, 4);
        assert_eq!(report.inactive_tabs_closed, 2);
        assert_eq!(report.forced_tabs_closed, 0);
        assert_eq!(report.current_tab_count, 2);
        assert!(fake.pages()[1].is_closed());
        assert!(fake.pages()[2].is_closed());
        assert!(!fake.pages()[0].is_closed());
    }

    #[tokio::test]
    async fn test_forced_cleanup_respects_floor() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _fake) = mk_manager(dir.path()).await;

        for _ in 0..6 {
            manager.get_page(None, None, None).await.unwrap();
        }

        let report = manager.cleanup_tabs(true).await;
        assert_eq!(report.forced_tabs_closed, 3);
        assert_eq!(report.current_tab_count, CLEANUP_FLOOR);

        // Already at the floor, a second pass is a no-op.
        let again = manager.cleanup_tabs(true).await;
        assert_eq!(again.total_closed, 0);
        assert_eq!(again.current_tab_count, CLEANUP_FLOOR);
    }

    #[tokio::test]
    async fn test_session_binding_recorded_in_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _fake) = mk_manager(dir.path()).await;

        let session_id = manager.sessions().create(Some("research")).await;
        let (id, _) = manager
            .get_page(None, Some(&session_id), None)
            .await
            .unwrap();

        let info = manager.page_info(&id).await.unwrap();
        assert_eq!(info.session_id.as_deref(), Some(session_id.as_str()));
        assert_eq!(
            manager.sessions().member_pages(&session_id).await.unwrap(),
            vec![id]
        );
    }

    #[tokio::test]
    async fn test_delete_session_closes_member_pages() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, fake) = mk_manager(dir.path()).await;

        let session_id = manager.sessions().create(None).await;
        let (id, _) = manager
            .get_page(None, Some(&session_id), None)
            .await
            .unwrap();
        manager.get_page(None, None, None).await.unwrap();

        manager.delete_session(&session_id).await.unwrap();

        assert!(fake.pages()[0].is_closed());
        assert!(!fake.pages()[1].is_closed());
        assert!(matches!(
            manager.page_info(&id).await,
            Err(ManagerError::PageNotFound(_))
        ));
        assert!(matches!(
            manager.delete_session(&session_id).await,
            Err(ManagerError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_close_page_goes_stale_not_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, fake) = mk_manager(dir.path()).await;

        let session_id = manager.sessions().create(None).await;
        let (id, handle) = manager
            .get_page(None, Some(&session_id), None)
            .await
            .unwrap();
        handle
            .goto("https://example.com/work", Duration::from_secs(5))
            .await
            .unwrap();
        manager.close_page(&id).await.unwrap();

        // The tab is gone, but metadata and session membership survive.
        assert!(fake.pages()[0].is_closed());
        let info = manager.page_info(&id).await.unwrap();
        assert!(!info.is_live);
        assert_eq!(info.url, "https://example.com/work");
        assert_eq!(
            manager.sessions().member_pages(&session_id).await.unwrap(),
            vec![id.clone()]
        );

        // Closing a page without a live tab reports failure.
        assert!(matches!(
            manager.close_page(&id).await,
            Err(ManagerError::PageNotFound(_))
        ));

        // And the id is still restorable afterwards.
        let (restored, _) = manager.get_page(Some(&id), None, None).await.unwrap();
        assert_eq!(restored, id);
        assert_eq!(
            fake.pages()[1].visited(),
            vec!["https://example.com/work".to_string()]
        );
    }

    #[tokio::test]
    async fn test_list_pages_and_tab_status() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _fake) = mk_manager(dir.path()).await;

        let (a, handle) = manager.get_page(None, None, None).await.unwrap();
        handle
            .goto("https://example.com", Duration::from_secs(5))
            .await
            .unwrap();
        manager.update_page_metadata(&a).await.unwrap();
        manager.get_page(None, None, None).await.unwrap();
        manager.cleanup_tabs(false).await;

        let pages = manager.list_pages().await;
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].page_id, "1");
        assert_eq!(pages[0].url, "https://example.com");
        assert!(pages[0].is_live);

        let status = manager.tab_status().await;
        assert_eq!(status.live_tabs, 2);
        assert_eq!(status.persisted_pages, 2);
        assert_eq!(status.max_tabs, 8);
    }

    #[tokio::test]
    async fn test_close_persists_final_urls() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _fake) = mk_manager(dir.path()).await;

        let (id, handle) = manager.get_page(None, None, None).await.unwrap();
        handle
            .goto("https://example.com/final", Duration::from_secs(5))
            .await
            .unwrap();
        manager.close().await;

        // The URL reached just before shutdown is what a restart sees.
        let (reopened, _fake2) = mk_manager(dir.path()).await;
        let info = reopened.page_info(&id).await.unwrap();
        assert_eq!(info.url, "https://example.com/final");
        assert!(!info.is_live);
    }
}
