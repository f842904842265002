//! Error types for manager operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ManagerError>;

#[derive(Debug, Error)]
pub enum ManagerError {
    /// Engine launch and other driver failures. Launch failures are fatal
    /// to the requesting operation; there is no page pool without an engine.
    #[error(transparent)]
    Driver(#[from] driver::DriverError),

    #[error("page not found: {0}")]
    PageNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
