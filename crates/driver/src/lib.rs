//! Browser Automation Driver
//!
//! The narrow interface the page manager consumes: launch an engine, open an
//! isolated context, open pages, navigate, evaluate, screenshot, and receive
//! per-page events. The CDP implementation talks to a real browser over one
//! shared WebSocket; everything above it only sees the traits.

pub mod api;
pub mod cdp;
pub mod error;
pub mod events;

pub use api::{
    BrowsingContext, ContextOptions, Driver, Engine, EngineKind, Geolocation, LaunchOptions,
    PageHandle,
};
pub use cdp::CdpDriver;
pub use error::{DriverError, Result};
pub use events::PageEvent;
