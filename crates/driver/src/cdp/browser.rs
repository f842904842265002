//! CDP-backed driver objects
//!
//! `CdpDriver` launches (or attaches to) an engine process, `CdpEngine` owns
//! the shared connection, `CdpContext` maps to a browser context, and
//! `CdpPage` is a flat-attached target with its own event pump.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::api::{
    BrowsingContext, ContextOptions, Driver, Engine, EngineKind, LaunchOptions, PageHandle,
};
use crate::cdp::connection::Connection;
use crate::cdp::wire::{CdpEvent, SessionId, TargetId};
use crate::error::{DriverError, Result};
use crate::events::PageEvent;

/// How long to wait for a freshly spawned engine to print its DevTools URL.
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-page broadcast capacity; telemetry keeps its own bounded buffers.
const PAGE_EVENT_CAPACITY: usize = 1024;

const BLANK_URL: &str = "about:blank";

/// Driver that speaks CDP to Chromium-family and Firefox engines.
#[derive(Debug, Default)]
pub struct CdpDriver;

impl CdpDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for CdpDriver {
    async fn launch(&self, kind: EngineKind, opts: &LaunchOptions) -> Result<Arc<dyn Engine>> {
        if kind == EngineKind::Webkit {
            // WebKit has no DevTools protocol endpoint; callers fall back to
            // another kind.
            return Err(DriverError::Unsupported(kind.to_string()));
        }

        let (conn, child) = match &opts.cdp_url {
            Some(url) => {
                tracing::info!("attaching to running {kind} engine at {url}");
                (Connection::connect(url).await?, None)
            }
            None => {
                let (child, ws_url) = spawn_engine(kind, opts).await?;
                tracing::info!("launched {kind} engine, DevTools at {ws_url}");
                (Connection::connect(&ws_url).await?, Some(child))
            }
        };

        Ok(Arc::new(CdpEngine {
            kind,
            conn,
            child: Mutex::new(child),
            slow_mo: Duration::from_millis(opts.slow_mo_ms),
        }))
    }
}

/// Spawn an engine binary and scrape the DevTools URL from its stderr.
async fn spawn_engine(kind: EngineKind, opts: &LaunchOptions) -> Result<(Child, String)> {
    let profile_dir = std::env::temp_dir().join(format!(
        "webtools-{}-{}",
        kind,
        std::process::id()
    ));
    std::fs::create_dir_all(&profile_dir)?;

    let mut last_err = None;
    for binary in binary_candidates(kind) {
        let mut cmd = Command::new(binary);
        match kind {
            EngineKind::Chromium => {
                cmd.arg("--remote-debugging-port=0")
                    .arg(format!("--user-data-dir={}", profile_dir.display()))
                    .arg("--no-first-run")
                    .arg("--no-default-browser-check");
                if opts.headless {
                    cmd.arg("--headless=new");
                }
                if let Some(proxy) = &opts.proxy {
                    cmd.arg(format!("--proxy-server={proxy}"));
                }
            }
            EngineKind::Firefox => {
                cmd.args(["--remote-debugging-port", "0"])
                    .arg("--profile")
                    .arg(&profile_dir)
                    .arg("--no-remote");
                if opts.headless {
                    cmd.arg("--headless");
                }
            }
            EngineKind::Webkit => unreachable!("rejected in launch"),
        }
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };

        match wait_for_devtools_url(&mut child).await {
            Ok(ws_url) => return Ok((child, ws_url)),
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        }
    }

    Err(DriverError::Launch(format!(
        "no usable {kind} binary found: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn binary_candidates(kind: EngineKind) -> &'static [&'static str] {
    match kind {
        EngineKind::Chromium => &["chromium", "chromium-browser", "google-chrome"],
        EngineKind::Firefox => &["firefox"],
        EngineKind::Webkit => &[],
    }
}

async fn wait_for_devtools_url(child: &mut Child) -> Result<String> {
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| DriverError::Launch("engine stderr not captured".to_string()))?;
    let mut lines = BufReader::new(stderr).lines();

    let scrape = async {
        while let Some(line) = lines.next_line().await? {
            if let Some(rest) = line.strip_prefix("DevTools listening on ") {
                return Ok(rest.trim().to_string());
            }
        }
        Err(DriverError::Launch(
            "engine exited before announcing a DevTools endpoint".to_string(),
        ))
    };

    tokio::time::timeout(LAUNCH_TIMEOUT, scrape)
        .await
        .map_err(|_| DriverError::Timeout("waiting for DevTools endpoint".to_string()))?
}

pub struct CdpEngine {
    kind: EngineKind,
    conn: Arc<Connection>,
    child: Mutex<Option<Child>>,
    slow_mo: Duration,
}

#[async_trait]
impl Engine for CdpEngine {
    async fn new_context(&self, opts: &ContextOptions) -> Result<Arc<dyn BrowsingContext>> {
        // Firefox's CDP subset may not implement browser contexts; degrade
        // to the default shared context rather than failing the launch path.
        let context_id = match self
            .conn
            .call("Target.createBrowserContext", Some(json!({})), None)
            .await
        {
            Ok(result) => result["browserContextId"].as_str().map(str::to_string),
            Err(e) => {
                tracing::warn!("{}: browser contexts unavailable ({e}), using default", self.kind);
                None
            }
        };

        Ok(Arc::new(CdpContext {
            conn: Arc::clone(&self.conn),
            context_id,
            opts: opts.clone(),
            slow_mo: self.slow_mo,
        }))
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.conn.call("Browser.close", None, None).await {
            tracing::debug!("Browser.close failed ({e}), killing process");
        }
        let _ = self.conn.close().await;
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        Ok(())
    }
}

pub struct CdpContext {
    conn: Arc<Connection>,
    /// None when the engine only offers the default shared context.
    context_id: Option<String>,
    opts: ContextOptions,
    slow_mo: Duration,
}

#[async_trait]
impl BrowsingContext for CdpContext {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>> {
        let mut params = json!({ "url": BLANK_URL });
        if let Some(id) = &self.context_id {
            params["browserContextId"] = json!(id);
        }
        let created = self.conn.call("Target.createTarget", Some(params), None).await?;
        let target_id: TargetId = created["targetId"]
            .as_str()
            .ok_or_else(|| DriverError::Protocol {
                code: 0,
                message: "createTarget reply missing targetId".to_string(),
            })?
            .to_string();

        let attached = self
            .conn
            .call(
                "Target.attachToTarget",
                Some(json!({ "targetId": target_id, "flatten": true })),
                None,
            )
            .await?;
        let session_id: SessionId = attached["sessionId"]
            .as_str()
            .ok_or_else(|| DriverError::Protocol {
                code: 0,
                message: "attachToTarget reply missing sessionId".to_string(),
            })?
            .to_string();

        // Enable the domains the page needs. Individual failures are logged
        // and tolerated; an engine may not implement every domain.
        for domain in ["Page", "Runtime", "Network"] {
            if let Err(e) = self
                .conn
                .call(&format!("{domain}.enable"), None, Some(&session_id))
                .await
            {
                tracing::warn!("{domain}.enable failed for target {target_id}: {e}");
            }
        }

        self.apply_emulation(&session_id).await;

        let page = Arc::new(CdpPage {
            conn: Arc::clone(&self.conn),
            target_id,
            session_id: session_id.clone(),
            slow_mo: self.slow_mo,
            current_url: RwLock::new(BLANK_URL.to_string()),
            event_tx: broadcast::channel(PAGE_EVENT_CAPACITY).0,
        });
        page.clone().spawn_event_pump();
        Ok(page)
    }

    async fn close(&self) -> Result<()> {
        if let Some(id) = &self.context_id {
            self.conn
                .call(
                    "Target.disposeBrowserContext",
                    Some(json!({ "browserContextId": id })),
                    None,
                )
                .await?;
        }
        Ok(())
    }
}

impl CdpContext {
    /// Viewport/user-agent/locale/timezone/geolocation are per-session
    /// overrides in CDP. All best-effort.
    async fn apply_emulation(&self, session_id: &str) {
        let overrides: Vec<(&str, Value)> = vec![
            (
                "Emulation.setDeviceMetricsOverride",
                json!({
                    "width": self.opts.viewport_width,
                    "height": self.opts.viewport_height,
                    "deviceScaleFactor": 1,
                    "mobile": false,
                }),
            ),
            (
                "Emulation.setUserAgentOverride",
                match &self.opts.user_agent {
                    Some(ua) => json!({ "userAgent": ua }),
                    None => Value::Null,
                },
            ),
            (
                "Emulation.setLocaleOverride",
                match &self.opts.locale {
                    Some(locale) => json!({ "locale": locale }),
                    None => Value::Null,
                },
            ),
            (
                "Emulation.setTimezoneOverride",
                match &self.opts.timezone_id {
                    Some(tz) => json!({ "timezoneId": tz }),
                    None => Value::Null,
                },
            ),
            (
                "Emulation.setGeolocationOverride",
                match &self.opts.geolocation {
                    Some(geo) => json!({
                        "latitude": geo.latitude,
                        "longitude": geo.longitude,
                        "accuracy": 1,
                    }),
                    None => Value::Null,
                },
            ),
        ];

        for (method, params) in overrides {
            if params.is_null() {
                continue;
            }
            if let Err(e) = self.conn.call(method, Some(params), Some(session_id)).await {
                tracing::debug!("{method} not applied: {e}");
            }
        }
    }
}

pub struct CdpPage {
    conn: Arc<Connection>,
    target_id: TargetId,
    session_id: SessionId,
    slow_mo: Duration,
    current_url: RwLock<String>,
    event_tx: broadcast::Sender<PageEvent>,
}

impl CdpPage {
    /// Forward this session's console/error/network events to subscribers
    /// and track top-frame navigations for `url()`. The pump stops when the
    /// connection closes or the target detaches, dropping `event_tx` so
    /// subscribers see the channel close.
    fn spawn_event_pump(self: Arc<Self>) {
        let mut rx = self.conn.events();
        tokio::spawn(async move {
            loop {
                let ev = match rx.recv().await {
                    Ok(ev) => ev,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("page {} event pump lagged by {n}", self.target_id);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if session_detached(&ev, &self.session_id) {
                    tracing::debug!("target {} detached, stopping event pump", self.target_id);
                    break;
                }
                if ev.session_id.as_deref() != Some(self.session_id.as_str()) {
                    continue;
                }
                if ev.method == "Page.frameNavigated" {
                    if ev.params["frame"]["parentId"].is_null() {
                        if let Some(url) = ev.params["frame"]["url"].as_str() {
                            *self.current_url.write().await = url.to_string();
                        }
                    }
                    continue;
                }
                if let Some(page_event) = translate_event(&ev) {
                    let _ = self.event_tx.send(page_event);
                }
            }
        });
    }

    async fn pace(&self) {
        if !self.slow_mo.is_zero() {
            tokio::time::sleep(self.slow_mo).await;
        }
    }

    async fn capture(&self, path: &Path, params: Value) -> Result<()> {
        let reply = self
            .conn
            .call("Page.captureScreenshot", Some(params), Some(&self.session_id))
            .await?;
        let data = reply["data"].as_str().ok_or_else(|| DriverError::Protocol {
            code: 0,
            message: "captureScreenshot reply missing data".to_string(),
        })?;
        let bytes = BASE64
            .decode(data)
            .map_err(|e| DriverError::Evaluation(format!("invalid screenshot payload: {e}")))?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }
}

/// Whether an event announces that the given session is gone. The browser
/// reports `Target.detachedFromTarget` on the root session with the detached
/// session in the params; the session itself gets `Inspector.detached`.
fn session_detached(ev: &CdpEvent, session_id: &str) -> bool {
    match ev.method.as_str() {
        "Target.detachedFromTarget" => ev.params["sessionId"].as_str() == Some(session_id),
        "Inspector.detached" => ev.session_id.as_deref() == Some(session_id),
        _ => false,
    }
}

/// Map a raw session event to the page-level vocabulary.
fn translate_event(ev: &CdpEvent) -> Option<PageEvent> {
    match ev.method.as_str() {
        "Runtime.consoleAPICalled" => {
            let level = ev.params["type"].as_str().unwrap_or("log").to_string();
            let text = ev.params["args"]
                .as_array()
                .map(|args| {
                    args.iter()
                        .map(|arg| match &arg["value"] {
                            Value::String(s) => s.clone(),
                            Value::Null => {
                                arg["description"].as_str().unwrap_or("").to_string()
                            }
                            other => other.to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .unwrap_or_default();
            Some(PageEvent::Console { level, text })
        }
        "Runtime.exceptionThrown" => {
            let details = &ev.params["exceptionDetails"];
            let message = details["exception"]["description"]
                .as_str()
                .or_else(|| details["text"].as_str())
                .unwrap_or("uncaught exception")
                .to_string();
            Some(PageEvent::PageError { message })
        }
        "Network.requestWillBeSent" => Some(PageEvent::Request {
            method: ev.params["request"]["method"].as_str().unwrap_or("").to_string(),
            url: ev.params["request"]["url"].as_str().unwrap_or("").to_string(),
            resource_type: ev.params["type"].as_str().unwrap_or("other").to_string(),
        }),
        _ => None,
    }
}

#[async_trait]
impl PageHandle for CdpPage {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<()> {
        self.pace().await;
        let loaded = self.conn.events();
        let reply = self
            .conn
            .call("Page.navigate", Some(json!({ "url": url })), Some(&self.session_id))
            .await?;
        if let Some(err) = reply["errorText"].as_str() {
            if !err.is_empty() {
                return Err(DriverError::Navigation(format!("{url}: {err}")));
            }
        }
        *self.current_url.write().await = url.to_string();

        // about:blank fires no load event worth waiting for.
        if url != BLANK_URL {
            Connection::wait_on(loaded, "Page.loadEventFired", Some(&self.session_id), timeout)
                .await?;
        }
        Ok(())
    }

    async fn url(&self) -> String {
        self.current_url.read().await.clone()
    }

    async fn title(&self) -> Result<String> {
        let reply = self
            .conn
            .call(
                "Target.getTargetInfo",
                Some(json!({ "targetId": self.target_id })),
                None,
            )
            .await?;
        Ok(reply["targetInfo"]["title"].as_str().unwrap_or("").to_string())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        self.pace().await;
        let reply = self
            .conn
            .call(
                "Runtime.evaluate",
                Some(json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                })),
                Some(&self.session_id),
            )
            .await?;

        if !reply["exceptionDetails"].is_null() {
            let details = &reply["exceptionDetails"];
            let message = details["exception"]["description"]
                .as_str()
                .or_else(|| details["text"].as_str())
                .unwrap_or("evaluation failed")
                .to_string();
            return Err(DriverError::Evaluation(message));
        }
        Ok(reply["result"]["value"].clone())
    }

    async fn screenshot(&self, path: &Path, full_page: bool) -> Result<()> {
        self.pace().await;
        self.capture(
            path,
            json!({ "format": "png", "captureBeyondViewport": full_page }),
        )
        .await
    }

    async fn screenshot_element(&self, selector: &str, path: &Path) -> Result<bool> {
        self.pace().await;
        // Embed the selector as a JSON string literal so quoting is safe.
        let selector_js = serde_json::to_string(selector)?;
        let rect = self
            .evaluate(&format!(
                "(() => {{
                    const el = document.querySelector({selector_js});
                    if (!el) return null;
                    const r = el.getBoundingClientRect();
                    return {{ x: r.x, y: r.y, width: r.width, height: r.height }};
                }})()"
            ))
            .await?;
        if rect.is_null() {
            return Ok(false);
        }

        self.capture(
            path,
            json!({
                "format": "png",
                "clip": {
                    "x": rect["x"],
                    "y": rect["y"],
                    "width": rect["width"],
                    "height": rect["height"],
                    "scale": 1,
                },
            }),
        )
        .await?;
        Ok(true)
    }

    fn events(&self) -> broadcast::Receiver<PageEvent> {
        self.event_tx.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.conn
            .call(
                "Target.closeTarget",
                Some(json!({ "targetId": self.target_id })),
                None,
            )
            .await?;
        Ok(())
    }
}
