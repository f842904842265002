//! Error types for driver operations
//!
//! Simple, flat error hierarchy. No over-engineering.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriverError>;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to launch engine: {0}")]
    Launch(String),

    #[error("engine kind not supported by this driver: {0}")]
    Unsupported(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {code} - {message}")]
    Protocol { code: i64, message: String },

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("script evaluation failed: {0}")]
    Evaluation(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("connection closed")]
    Closed,

    #[error("invalid DevTools endpoint: {0}")]
    Endpoint(String),
}
