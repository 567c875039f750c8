//! Asynchronous Language Server Protocol client
//!
//! Spawns a language server, speaks JSON-RPC over its stdio and keeps the
//! client's view of open documents in sync with it.

pub mod config;
pub mod io;
pub mod logging;
pub mod lsp;

#[cfg(test)]
pub mod test_utils;

pub use config::{ConfigError, ServerConfig, ServerConfigBuilder};
pub use lsp::{ClientState, LspClient, LspError, TrackedDocument};
