//! Persistent page and session management on top of the browser driver.
//!
//! Pages are stable numeric ids whose metadata (last URL, title, timestamps,
//! engine kind, session membership) is persisted as JSON and survives both
//! tab eviction and process restarts. The [`manager::PageManager`] resolves
//! ids to live handles, relaunching engines and replaying last URLs on
//! demand; [`ops::OpRegistry`] exposes the whole surface as named
//! operations with structured outcomes.

pub mod config;
pub mod error;
pub mod manager;
pub mod ops;
pub mod screenshot;
pub mod session;
pub mod store;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod fake;

pub use config::Settings;
pub use error::{ManagerError, Result};
pub use manager::{CleanupReport, PageInfo, PageManager, TabStatus, CLEANUP_FLOOR};
pub use ops::{OpKind, OpOutcome, OpRegistry, OpRequest};
pub use screenshot::ScreenshotHelper;
pub use session::{Session, SessionRegistry};
pub use store::{PageId, PageMeta, StateStore, BLANK_URL};
pub use telemetry::{CommandOutcome, TelemetryCollector, TelemetryRecord, MAX_RECORDS_PER_PAGE};
