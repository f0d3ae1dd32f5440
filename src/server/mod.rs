//! Session server: HTTP surface and the WebSocket session protocol.

pub mod api;
pub mod github;
#[allow(clippy::module_inception)]
pub mod server;
pub mod ws;

pub use server::{ServerConfig, build_router, start_server};
