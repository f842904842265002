//! In-memory driver for tests
//!
//! Records launches, page creations, and navigations, and lets tests inject
//! unavailable engine kinds and failing URLs or emit page events.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use driver::{
    BrowsingContext, ContextOptions, Driver, DriverError, Engine, EngineKind, LaunchOptions,
    PageEvent, PageHandle, Result,
};
use serde_json::{json, Value};
use tokio::sync::broadcast;

#[derive(Default)]
pub struct FakeShared {
    pub launches: Mutex<Vec<EngineKind>>,
    pub unavailable: Mutex<HashSet<EngineKind>>,
    pub fail_navigation_to: Mutex<HashSet<String>>,
    pub pages: Mutex<Vec<(EngineKind, Arc<FakePage>)>>,
}

#[derive(Default)]
pub struct FakeDriver {
    pub shared: Arc<FakeShared>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_unavailable(&self, kind: EngineKind) {
        self.shared.unavailable.lock().unwrap().insert(kind);
    }

    pub fn fail_navigation_to(&self, url: &str) {
        self.shared
            .fail_navigation_to
            .lock()
            .unwrap()
            .insert(url.to_string());
    }

    pub fn launches(&self) -> Vec<EngineKind> {
        self.shared.launches.lock().unwrap().clone()
    }

    /// All pages ever created, in creation order.
    pub fn pages(&self) -> Vec<Arc<FakePage>> {
        self.shared
            .pages
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| Arc::clone(p))
            .collect()
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn launch(&self, kind: EngineKind, _opts: &LaunchOptions) -> Result<Arc<dyn Engine>> {
        if self.shared.unavailable.lock().unwrap().contains(&kind) {
            return Err(DriverError::Unsupported(kind.to_string()));
        }
        self.shared.launches.lock().unwrap().push(kind);
        Ok(Arc::new(FakeEngine {
            kind,
            shared: Arc::clone(&self.shared),
        }))
    }
}

pub struct FakeEngine {
    kind: EngineKind,
    shared: Arc<FakeShared>,
}

#[async_trait]
impl Engine for FakeEngine {
    async fn new_context(&self, _opts: &ContextOptions) -> Result<Arc<dyn BrowsingContext>> {
        Ok(Arc::new(FakeContext {
            kind: self.kind,
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct FakeContext {
    kind: EngineKind,
    shared: Arc<FakeShared>,
}

#[async_trait]
impl BrowsingContext for FakeContext {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>> {
        let page = FakePage::with_shared(Arc::clone(&self.shared));
        self.shared
            .pages
            .lock()
            .unwrap()
            .push((self.kind, Arc::clone(&page)));
        Ok(page)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct FakePage {
    shared: Arc<FakeShared>,
    pub gotos: Mutex<Vec<String>>,
    url: Mutex<String>,
    pub closed: AtomicBool,
    tx: broadcast::Sender<PageEvent>,
}

impl FakePage {
    pub fn new() -> Arc<Self> {
        Self::with_shared(Arc::new(FakeShared::default()))
    }

    fn with_shared(shared: Arc<FakeShared>) -> Arc<Self> {
        Arc::new(Self {
            shared,
            gotos: Mutex::new(Vec::new()),
            url: Mutex::new("about:blank".to_string()),
            closed: AtomicBool::new(false),
            // Roomy enough that a burst larger than the telemetry ring never
            // lags a subscriber.
            tx: broadcast::channel(1024).0,
        })
    }

    pub fn emit(&self, event: PageEvent) {
        let _ = self.tx.send(event);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn visited(&self) -> Vec<String> {
        self.gotos.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageHandle for FakePage {
    async fn goto(&self, url: &str, _timeout: Duration) -> Result<()> {
        if self.shared.fail_navigation_to.lock().unwrap().contains(url) {
            return Err(DriverError::Navigation(format!("{url}: refused by test")));
        }
        self.gotos.lock().unwrap().push(url.to_string());
        *self.url.lock().unwrap() = url.to_string();
        Ok(())
    }

    async fn url(&self) -> String {
        self.url.lock().unwrap().clone()
    }

    async fn title(&self) -> Result<String> {
        Ok("Fake Page".to_string())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        if expression.trim_start().starts_with("throw") {
            return Err(DriverError::Evaluation("thrown by test page".to_string()));
        }
        Ok(json!({ "echo": expression }))
    }

    async fn screenshot(&self, path: &Path, _full_page: bool) -> Result<()> {
        std::fs::write(path, b"PNG")?;
        Ok(())
    }

    async fn screenshot_element(&self, selector: &str, path: &Path) -> Result<bool> {
        if selector == "#missing" {
            return Ok(false);
        }
        std::fs::write(path, b"PNG")?;
        Ok(true)
    }

    fn events(&self) -> broadcast::Receiver<PageEvent> {
        self.tx.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
