//! Driver traits - the seam between the page manager and a real browser
//!
//! The manager never sees CDP or WebSockets, only these objects:
//! a `Driver` launches `Engine`s, an engine owns isolated `BrowsingContext`s,
//! a context opens `PageHandle`s.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::events::PageEvent;

/// Browser engine families a driver may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Chromium,
    Firefox,
    Webkit,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Chromium => "chromium",
            EngineKind::Firefox => "firefox",
            EngineKind::Webkit => "webkit",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chromium" | "chrome" => Ok(EngineKind::Chromium),
            "firefox" => Ok(EngineKind::Firefox),
            "webkit" => Ok(EngineKind::Webkit),
            other => Err(format!("unknown engine kind: {other}")),
        }
    }
}

/// Options applied when an engine process is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchOptions {
    pub headless: bool,
    /// Artificial delay before each page operation, for watchable debugging.
    pub slow_mo_ms: u64,
    pub proxy: Option<String>,
    /// Attach to an already-running engine at this DevTools URL instead of
    /// spawning a process.
    pub cdp_url: Option<String>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            slow_mo_ms: 0,
            proxy: None,
            cdp_url: None,
        }
    }
}

/// Options for an isolated browsing context (cookie/storage realm).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextOptions {
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub user_agent: Option<String>,
    pub locale: Option<String>,
    pub timezone_id: Option<String>,
    pub geolocation: Option<Geolocation>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            viewport_width: 1280,
            viewport_height: 800,
            user_agent: None,
            locale: None,
            timezone_id: None,
            geolocation: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Geolocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// Launches browser engines.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn launch(&self, kind: EngineKind, opts: &LaunchOptions) -> Result<Arc<dyn Engine>>;
}

/// One running engine process.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn new_context(&self, opts: &ContextOptions) -> Result<Arc<dyn BrowsingContext>>;
    async fn close(&self) -> Result<()>;
}

/// One isolated cookie/storage realm inside an engine.
#[async_trait]
pub trait BrowsingContext: Send + Sync {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>>;
    async fn close(&self) -> Result<()>;
}

/// A live engine-level page.
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Navigate and wait for the load event, bounded by `timeout`.
    async fn goto(&self, url: &str, timeout: Duration) -> Result<()>;

    /// Current URL as the engine reports it.
    async fn url(&self) -> String;

    async fn title(&self) -> Result<String>;

    /// Evaluate a script expression in the page, returning its value.
    async fn evaluate(&self, expression: &str) -> Result<Value>;

    /// Capture a screenshot to `path`.
    async fn screenshot(&self, path: &Path, full_page: bool) -> Result<()>;

    /// Capture a screenshot of the first element matching `selector`.
    /// Returns `false` when nothing matches.
    async fn screenshot_element(&self, selector: &str, path: &Path) -> Result<bool>;

    /// Subscribe to this page's console/error/network events.
    fn events(&self) -> broadcast::Receiver<PageEvent>;

    async fn close(&self) -> Result<()>;
}
