pub mod config;
pub mod container;
pub mod engine;
pub mod errors;
pub mod fallback;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod shadow;
pub mod sync;
pub mod terminal;
