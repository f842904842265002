//! Operation registry - named operations over the page manager
//!
//! Each operation is an `OpKind` variant bound to a boxed async handler at
//! registry construction. Dispatch looks the handler up and runs it; adding
//! an operation is one registration, and a handler can only report failure
//! through the structured outcome, never a panic.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use driver::EngineKind;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::manager::PageManager;
use crate::screenshot::ScreenshotHelper;

const DEFAULT_HIGHLIGHT_MS: u64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    GetPage,
    ClosePage,
    CleanupTabs,
    ListPages,
    PageInfo,
    TabStatus,
    Screenshot,
    Highlight,
    ConsoleLogs,
    PageErrors,
    NetworkRequests,
    ExecuteScript,
    CreateSession,
    GetSession,
    DeleteSession,
    ListSessions,
}

impl OpKind {
    pub const ALL: [OpKind; 16] = [
        OpKind::GetPage,
        OpKind::ClosePage,
        OpKind::CleanupTabs,
        OpKind::ListPages,
        OpKind::PageInfo,
        OpKind::TabStatus,
        OpKind::Screenshot,
        OpKind::Highlight,
        OpKind::ConsoleLogs,
        OpKind::PageErrors,
        OpKind::NetworkRequests,
        OpKind::ExecuteScript,
        OpKind::CreateSession,
        OpKind::GetSession,
        OpKind::DeleteSession,
        OpKind::ListSessions,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OpKind::GetPage => "get_page",
            OpKind::ClosePage => "close_page",
            OpKind::CleanupTabs => "cleanup_tabs",
            OpKind::ListPages => "list_pages",
            OpKind::PageInfo => "page_info",
            OpKind::TabStatus => "tab_status",
            OpKind::Screenshot => "screenshot",
            OpKind::Highlight => "highlight",
            OpKind::ConsoleLogs => "console_logs",
            OpKind::PageErrors => "page_errors",
            OpKind::NetworkRequests => "network_requests",
            OpKind::ExecuteScript => "execute_script",
            OpKind::CreateSession => "create_session",
            OpKind::GetSession => "get_session",
            OpKind::DeleteSession => "delete_session",
            OpKind::ListSessions => "list_sessions",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OpKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| format!("unknown operation: {s}"))
    }
}

/// Parameters for any operation; handlers read the fields they need and
/// report a failure outcome when a required one is missing.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct OpRequest {
    pub page_id: Option<String>,
    pub session_id: Option<String>,
    pub browser_type: Option<EngineKind>,
    pub url: Option<String>,
    pub selector: Option<String>,
    pub full_page: bool,
    pub force: bool,
    pub script: Option<String>,
    pub name: Option<String>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl OpOutcome {
    fn ok(message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

type Handler = Box<dyn Fn(OpRequest) -> BoxFuture<'static, OpOutcome> + Send + Sync>;

pub struct OpRegistry {
    handlers: HashMap<OpKind, Handler>,
}

macro_rules! register {
    ($handlers:expr, $kind:expr, $manager:ident, $shots:ident, $func:ident) => {{
        let manager = Arc::clone(&$manager);
        let shots = Arc::clone(&$shots);
        $handlers.insert(
            $kind,
            Box::new(move |req: OpRequest| {
                let manager = Arc::clone(&manager);
                let shots = Arc::clone(&shots);
                Box::pin(async move { $func(manager, shots, req).await }) as BoxFuture<'static, _>
            }) as Handler,
        );
    }};
}

impl OpRegistry {
    pub fn new(manager: Arc<PageManager>) -> Self {
        let shots = Arc::new(ScreenshotHelper::new(manager.storage_dir()));
        let mut handlers: HashMap<OpKind, Handler> = HashMap::new();

        register!(handlers, OpKind::GetPage, manager, shots, get_page);
        register!(handlers, OpKind::ClosePage, manager, shots, close_page);
        register!(handlers, OpKind::CleanupTabs, manager, shots, cleanup_tabs);
        register!(handlers, OpKind::ListPages, manager, shots, list_pages);
        register!(handlers, OpKind::PageInfo, manager, shots, page_info);
        register!(handlers, OpKind::TabStatus, manager, shots, tab_status);
        register!(handlers, OpKind::Screenshot, manager, shots, screenshot);
        register!(handlers, OpKind::Highlight, manager, shots, highlight);
        register!(handlers, OpKind::ConsoleLogs, manager, shots, console_logs);
        register!(handlers, OpKind::PageErrors, manager, shots, page_errors);
        register!(handlers, OpKind::NetworkRequests, manager, shots, network_requests);
        register!(handlers, OpKind::ExecuteScript, manager, shots, execute_script);
        register!(handlers, OpKind::CreateSession, manager, shots, create_session);
        register!(handlers, OpKind::GetSession, manager, shots, get_session);
        register!(handlers, OpKind::DeleteSession, manager, shots, delete_session);
        register!(handlers, OpKind::ListSessions, manager, shots, list_sessions);

        Self { handlers }
    }

    pub async fn dispatch(&self, kind: OpKind, req: OpRequest) -> OpOutcome {
        match self.handlers.get(&kind) {
            Some(handler) => handler(req).await,
            None => OpOutcome::fail(format!("no handler registered for {kind}")),
        }
    }
}

fn require<'a>(field: &'a Option<String>, name: &str) -> Result<&'a str, OpOutcome> {
    field
        .as_deref()
        .ok_or_else(|| OpOutcome::fail(format!("{name} is required")))
}

async fn get_page(
    manager: Arc<PageManager>,
    shots: Arc<ScreenshotHelper>,
    req: OpRequest,
) -> OpOutcome {
    let resolved = manager
        .get_page(req.page_id.as_deref(), req.session_id.as_deref(), req.browser_type)
        .await;
    let (id, handle) = match resolved {
        Ok(pair) => pair,
        Err(e) => return OpOutcome::fail(e.to_string()),
    };

    if let Some(url) = &req.url {
        let timeout = std::time::Duration::from_millis(manager.settings().timeout);
        if let Err(e) = handle.goto(url, timeout).await {
            return OpOutcome::fail(format!("page {id} ready but navigation failed: {e}"));
        }
        if let Err(e) = manager.update_page_metadata(&id).await {
            tracing::warn!("metadata refresh after navigation failed: {e}");
        }
        if manager.settings().debug_screenshots {
            match shots.capture(&manager, &id, None, false).await {
                Ok(path) => tracing::debug!("debug screenshot at {}", path.display()),
                Err(e) => tracing::warn!("debug screenshot failed: {e}"),
            }
        }
    }

    match manager.page_info(&id).await {
        Ok(info) => OpOutcome::ok(
            format!("page {id} ready"),
            serde_json::to_value(info).ok(),
        ),
        Err(e) => OpOutcome::fail(e.to_string()),
    }
}

async fn close_page(
    manager: Arc<PageManager>,
    _shots: Arc<ScreenshotHelper>,
    req: OpRequest,
) -> OpOutcome {
    let id = match require(&req.page_id, "page_id") {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };
    match manager.close_page(id).await {
        Ok(()) => OpOutcome::ok(format!("page {id} closed"), None),
        Err(e) => OpOutcome::fail(e.to_string()),
    }
}

async fn cleanup_tabs(
    manager: Arc<PageManager>,
    _shots: Arc<ScreenshotHelper>,
    req: OpRequest,
) -> OpOutcome {
    let report = manager.cleanup_tabs(req.force).await;
    OpOutcome::ok(
        format!("closed {} tabs", report.total_closed),
        serde_json::to_value(&report).ok(),
    )
}

async fn list_pages(
    manager: Arc<PageManager>,
    _shots: Arc<ScreenshotHelper>,
    _req: OpRequest,
) -> OpOutcome {
    let pages = manager.list_pages().await;
    OpOutcome::ok(
        format!("{} pages", pages.len()),
        serde_json::to_value(&pages).ok(),
    )
}

async fn page_info(
    manager: Arc<PageManager>,
    _shots: Arc<ScreenshotHelper>,
    req: OpRequest,
) -> OpOutcome {
    let id = match require(&req.page_id, "page_id") {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };
    match manager.page_info(id).await {
        Ok(info) => OpOutcome::ok(format!("page {id}"), serde_json::to_value(info).ok()),
        Err(e) => OpOutcome::fail(e.to_string()),
    }
}

async fn tab_status(
    manager: Arc<PageManager>,
    _shots: Arc<ScreenshotHelper>,
    _req: OpRequest,
) -> OpOutcome {
    let status = manager.tab_status().await;
    OpOutcome::ok(
        format!("{} of {} tabs live", status.live_tabs, status.max_tabs),
        serde_json::to_value(&status).ok(),
    )
}

async fn screenshot(
    manager: Arc<PageManager>,
    shots: Arc<ScreenshotHelper>,
    req: OpRequest,
) -> OpOutcome {
    let id = match require(&req.page_id, "page_id") {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };
    match shots
        .capture(&manager, id, req.selector.as_deref(), req.full_page)
        .await
    {
        Ok(path) => OpOutcome::ok(
            "screenshot captured",
            Some(json!({ "path": path.display().to_string() })),
        ),
        Err(e) => OpOutcome::fail(e.to_string()),
    }
}

async fn highlight(
    manager: Arc<PageManager>,
    shots: Arc<ScreenshotHelper>,
    req: OpRequest,
) -> OpOutcome {
    let id = match require(&req.page_id, "page_id") {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };
    let selector = match require(&req.selector, "selector") {
        Ok(selector) => selector,
        Err(outcome) => return outcome,
    };
    let (_, page) = match manager.existing_page(id).await {
        Ok(pair) => pair,
        Err(e) => return OpOutcome::fail(e.to_string()),
    };

    let duration = req.duration_ms.unwrap_or(DEFAULT_HIGHLIGHT_MS);
    match shots.highlight(&page, selector, duration).await {
        Ok(count) => OpOutcome::ok(
            format!("highlighted {count} elements"),
            Some(json!({ "highlighted": count })),
        ),
        Err(e) => OpOutcome::fail(e.to_string()),
    }
}

async fn console_logs(
    manager: Arc<PageManager>,
    _shots: Arc<ScreenshotHelper>,
    req: OpRequest,
) -> OpOutcome {
    let logs = manager.telemetry().console_logs(req.page_id.as_deref());
    OpOutcome::ok("console logs", serde_json::to_value(&logs).ok())
}

async fn page_errors(
    manager: Arc<PageManager>,
    _shots: Arc<ScreenshotHelper>,
    req: OpRequest,
) -> OpOutcome {
    let errors = manager.telemetry().page_errors(req.page_id.as_deref());
    OpOutcome::ok("page errors", serde_json::to_value(&errors).ok())
}

async fn network_requests(
    manager: Arc<PageManager>,
    _shots: Arc<ScreenshotHelper>,
    req: OpRequest,
) -> OpOutcome {
    if !manager.settings().capture_network {
        return OpOutcome::fail("network capture is disabled");
    }
    let requests = manager.telemetry().network_requests(req.page_id.as_deref());
    OpOutcome::ok("network requests", serde_json::to_value(&requests).ok())
}

async fn execute_script(
    manager: Arc<PageManager>,
    _shots: Arc<ScreenshotHelper>,
    req: OpRequest,
) -> OpOutcome {
    let id = match require(&req.page_id, "page_id") {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };
    let script = match require(&req.script, "script") {
        Ok(script) => script,
        Err(outcome) => return outcome,
    };
    let (_, page) = match manager.existing_page(id).await {
        Ok(pair) => pair,
        Err(e) => return OpOutcome::fail(e.to_string()),
    };

    let outcome = manager.telemetry().execute_command(&page, script).await;
    if outcome.success {
        OpOutcome::ok("script evaluated", outcome.result)
    } else {
        OpOutcome::fail(outcome.error.unwrap_or_else(|| "evaluation failed".into()))
    }
}

async fn create_session(
    manager: Arc<PageManager>,
    _shots: Arc<ScreenshotHelper>,
    req: OpRequest,
) -> OpOutcome {
    let id = manager.sessions().create(req.name.as_deref()).await;
    OpOutcome::ok(
        format!("session {id} created"),
        Some(json!({ "session_id": id })),
    )
}

async fn get_session(
    manager: Arc<PageManager>,
    _shots: Arc<ScreenshotHelper>,
    req: OpRequest,
) -> OpOutcome {
    let id = match require(&req.session_id, "session_id") {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };
    match manager.sessions().get(id).await {
        Some(session) => OpOutcome::ok(
            format!("session {id}"),
            serde_json::to_value(&session).ok(),
        ),
        None => OpOutcome::fail(format!("session not found: {id}")),
    }
}

async fn delete_session(
    manager: Arc<PageManager>,
    _shots: Arc<ScreenshotHelper>,
    req: OpRequest,
) -> OpOutcome {
    let id = match require(&req.session_id, "session_id") {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };
    match manager.delete_session(id).await {
        Ok(session) => OpOutcome::ok(
            format!("session {id} deleted"),
            Some(json!({ "closed_pages": session.pages.len() })),
        ),
        Err(e) => OpOutcome::fail(e.to_string()),
    }
}

async fn list_sessions(
    manager: Arc<PageManager>,
    _shots: Arc<ScreenshotHelper>,
    _req: OpRequest,
) -> OpOutcome {
    let sessions = manager.sessions().list().await;
    OpOutcome::ok(
        format!("{} sessions", sessions.len()),
        serde_json::to_value(&sessions).ok(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::fake::FakeDriver;
    use driver::Driver;
    use std::path::Path;

    async fn registry(dir: &Path) -> (OpRegistry, Arc<PageManager>) {
        let fake = Arc::new(FakeDriver::new());
        let driver: Arc<dyn Driver> = fake as Arc<dyn Driver>;
        let manager = PageManager::open(Settings::default(), driver, dir)
            .await
            .unwrap();
        (OpRegistry::new(Arc::clone(&manager)), manager)
    }

    fn req(pairs: Value) -> OpRequest {
        serde_json::from_value(pairs).unwrap()
    }

    #[tokio::test]
    async fn test_every_kind_has_a_handler() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _manager) = registry(dir.path()).await;
        for kind in OpKind::ALL {
            assert!(registry.handlers.contains_key(&kind), "{kind} unregistered");
        }
    }

    #[tokio::test]
    async fn test_kind_names_roundtrip() {
        for kind in OpKind::ALL {
            assert_eq!(kind.name().parse::<OpKind>().unwrap(), kind);
        }
        assert!("reticulate_splines".parse::<OpKind>().is_err());
    }

    #[tokio::test]
    async fn test_get_page_navigates_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _manager) = registry(dir.path()).await;

        let outcome = registry
            .dispatch(OpKind::GetPage, req(json!({ "url": "https://example.com" })))
            .await;
        assert!(outcome.success, "{}", outcome.message);
        let data = outcome.data.unwrap();
        assert_eq!(data["page_id"], "1");
        assert_eq!(data["url"], "https://example.com");
    }

    #[tokio::test]
    async fn test_missing_required_field_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _manager) = registry(dir.path()).await;

        let outcome = registry.dispatch(OpKind::ClosePage, OpRequest::default()).await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("page_id"));
    }

    #[tokio::test]
    async fn test_unknown_page_reports_failure_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, manager) = registry(dir.path()).await;

        let outcome = registry
            .dispatch(OpKind::Screenshot, req(json!({ "page_id": "77" })))
            .await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("not found"));

        // Id-addressed operations never conjure a page for an unknown id.
        let outcome = registry
            .dispatch(
                OpKind::ExecuteScript,
                req(json!({ "page_id": "77", "script": "1 + 1" })),
            )
            .await;
        assert!(!outcome.success);
        assert_eq!(manager.list_pages().await.len(), 0);
    }

    #[tokio::test]
    async fn test_execute_script_reports_evaluation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _manager) = registry(dir.path()).await;
        registry.dispatch(OpKind::GetPage, OpRequest::default()).await;

        let ok = registry
            .dispatch(
                OpKind::ExecuteScript,
                req(json!({ "page_id": "1", "script": "1 + 1" })),
            )
            .await;
        assert!(ok.success);

        let err = registry
            .dispatch(
                OpKind::ExecuteScript,
                req(json!({ "page_id": "1", "script": "throw new Error('no')" })),
            )
            .await;
        assert!(!err.success);
    }

    #[tokio::test]
    async fn test_session_lifecycle_through_registry() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _manager) = registry(dir.path()).await;

        let created = registry
            .dispatch(OpKind::CreateSession, req(json!({ "name": "research" })))
            .await;
        assert!(created.success);
        let session_id = created.data.unwrap()["session_id"]
            .as_str()
            .unwrap()
            .to_string();

        let page = registry
            .dispatch(OpKind::GetPage, req(json!({ "session_id": session_id })))
            .await;
        assert!(page.success);

        let deleted = registry
            .dispatch(
                OpKind::DeleteSession,
                req(json!({ "session_id": session_id })),
            )
            .await;
        assert!(deleted.success);
        assert_eq!(deleted.data.unwrap()["closed_pages"], 1);

        let gone = registry
            .dispatch(
                OpKind::GetSession,
                req(json!({ "session_id": session_id })),
            )
            .await;
        assert!(!gone.success);
    }

    #[tokio::test]
    async fn test_network_requests_gated_by_settings() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _manager) = registry(dir.path()).await;

        let outcome = registry
            .dispatch(OpKind::NetworkRequests, OpRequest::default())
            .await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("disabled"));
    }

    #[tokio::test]
    async fn test_cleanup_reports_counts() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, manager) = registry(dir.path()).await;
        for _ in 0..5 {
            manager.get_page(None, None, None).await.unwrap();
        }

        let outcome = registry
            .dispatch(OpKind::CleanupTabs, req(json!({ "force": true })))
            .await;
        assert!(outcome.success);
        let data = outcome.data.unwrap();
        assert_eq!(data["original_tab_count"], 5);
        assert_eq!(data["current_tab_count"], 3);
    }
}
