//! Telemetry collector - per-page console/error/network capture
//!
//! Attaches once per page, drains the page's event stream in a spawned task,
//! and records each event twice: a bounded in-memory ring per page and one
//! JSON line in a per-page-per-category log file. Nothing here may fail the
//! page operation that triggered an event; write errors are logged and
//! dropped.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use driver::{PageEvent, PageHandle};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::store::epoch_secs;

/// Records retained in memory per page and category. Oldest-first eviction.
pub const MAX_RECORDS_PER_PAGE: usize = 500;

const LOG_SUBDIR: &str = "console_logs";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub timestamp: u64,
    #[serde(flatten)]
    pub event: PageEvent,
}

/// Result of evaluating caller-supplied script in a page.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct TelemetryCollector {
    inner: Arc<Inner>,
}

struct Inner {
    log_dir: PathBuf,
    capture_network: bool,
    /// Running recorder task per page id. Presence means events from the
    /// current handle are being drained.
    attached: DashMap<String, JoinHandle<()>>,
    console: DashMap<String, VecDeque<TelemetryRecord>>,
    errors: DashMap<String, VecDeque<TelemetryRecord>>,
    network: DashMap<String, VecDeque<TelemetryRecord>>,
}

impl TelemetryCollector {
    pub fn new(storage_dir: &std::path::Path, capture_network: bool) -> Self {
        let log_dir = storage_dir.join(LOG_SUBDIR);
        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            tracing::error!("failed to create telemetry dir {}: {e}", log_dir.display());
        }
        Self {
            inner: Arc::new(Inner {
                log_dir,
                capture_network,
                attached: DashMap::new(),
                console: DashMap::new(),
                errors: DashMap::new(),
                network: DashMap::new(),
            }),
        }
    }

    /// Subscribe to a page's events. Attaching again while a recorder is
    /// already running for the id is a no-op, so the same handle never
    /// double-records; after [`TelemetryCollector::detach`] a fresh attach
    /// subscribes to the new handle.
    pub fn attach(&self, page: &Arc<dyn PageHandle>, page_id: &str) {
        if self.inner.attached.contains_key(page_id) {
            return;
        }
        let mut rx = page.events();
        let inner = Arc::clone(&self.inner);
        let id = page_id.to_string();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => inner.record(&id, event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("telemetry for page {id} lagged by {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        inner.attached.remove(&id);
                        break;
                    }
                }
            }
        });
        self.inner.attached.insert(page_id.to_string(), task);
    }

    /// Stop recording for a page. Recorded history stays; the next attach
    /// (a restored tab's new handle) subscribes afresh.
    pub fn detach(&self, page_id: &str) {
        if let Some((_, task)) = self.inner.attached.remove(page_id) {
            task.abort();
        }
    }

    pub fn console_logs(&self, page_id: Option<&str>) -> HashMap<String, Vec<TelemetryRecord>> {
        collect(&self.inner.console, page_id)
    }

    pub fn page_errors(&self, page_id: Option<&str>) -> HashMap<String, Vec<TelemetryRecord>> {
        collect(&self.inner.errors, page_id)
    }

    pub fn network_requests(&self, page_id: Option<&str>) -> HashMap<String, Vec<TelemetryRecord>> {
        if !self.inner.capture_network {
            return HashMap::new();
        }
        collect(&self.inner.network, page_id)
    }

    /// Evaluate caller-supplied script in a page. The evaluation error, if
    /// any, is captured in the outcome rather than propagated.
    pub async fn execute_command(&self, page: &Arc<dyn PageHandle>, source: &str) -> CommandOutcome {
        match page.evaluate(source).await {
            Ok(value) => CommandOutcome {
                success: true,
                result: Some(value),
                error: None,
            },
            Err(e) => CommandOutcome {
                success: false,
                result: None,
                error: Some(e.to_string()),
            },
        }
    }
}

impl Inner {
    fn record(&self, page_id: &str, event: PageEvent) {
        if matches!(event, PageEvent::Request { .. }) && !self.capture_network {
            return;
        }
        let category = event.category();
        let record = TelemetryRecord {
            timestamp: epoch_secs(),
            event,
        };

        let buffers = match category {
            "console" => &self.console,
            "errors" => &self.errors,
            _ => &self.network,
        };
        let mut ring = buffers.entry(page_id.to_string()).or_default();
        ring.push_back(record.clone());
        while ring.len() > MAX_RECORDS_PER_PAGE {
            ring.pop_front();
        }
        drop(ring);

        self.append_line(page_id, category, &record);
    }

    fn append_line(&self, page_id: &str, category: &str, record: &TelemetryRecord) {
        let path = self.log_dir.join(format!("{category}_{page_id}.jsonl"));
        let result = serde_json::to_string(record).map(|line| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut file| writeln!(file, "{line}"))
        });
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("error writing telemetry log {}: {e}", path.display()),
            Err(e) => tracing::error!("error serializing telemetry record: {e}"),
        }
    }
}

fn collect(
    buffers: &DashMap<String, VecDeque<TelemetryRecord>>,
    page_id: Option<&str>,
) -> HashMap<String, Vec<TelemetryRecord>> {
    match page_id {
        Some(id) => buffers
            .get(id)
            .map(|ring| {
                let mut out = HashMap::new();
                out.insert(id.to_string(), ring.iter().cloned().collect());
                out
            })
            .unwrap_or_default(),
        None => buffers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().iter().cloned().collect()))
            .collect(),
    }
}
