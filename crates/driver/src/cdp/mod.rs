//! CDP (Chrome DevTools Protocol) backend
//!
//! One WebSocket per engine, multiplexed sessions. Request/response matching
//! by call id, events fanned out on a broadcast channel.

pub mod browser;
pub mod connection;
pub mod wire;

pub use browser::CdpDriver;
pub use connection::Connection;
