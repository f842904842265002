//! Per-page event stream
//!
//! Pages publish console messages, uncaught errors, and outgoing requests on
//! a tokio broadcast channel. Use enums, not trait objects.

use serde::{Deserialize, Serialize};

/// Events a page emits while it is alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageEvent {
    /// A console API call (console.log, console.error, ...).
    Console { level: String, text: String },

    /// An uncaught exception in page script.
    PageError { message: String },

    /// An outgoing network request.
    Request {
        method: String,
        url: String,
        resource_type: String,
    },
}

impl PageEvent {
    /// Telemetry category this event belongs to.
    pub fn category(&self) -> &'static str {
        match self {
            PageEvent::Console { .. } => "console",
            PageEvent::PageError { .. } => "errors",
            PageEvent::Request { .. } => "network",
        }
    }
}
