//! LSP layer - framing, JSON-RPC and the client engine
//!
//! - **Framing**: `Content-Length` headers over a raw transport
//! - **Protocol**: request correlation and server-initiated message dispatch
//! - **Client**: process lifecycle, handshake, documents and typed requests

pub mod client;
pub mod documents;
pub mod error;
pub mod framing;
pub mod protocol;

pub use client::{ClientState, LspClient, NotificationHandler};
pub use documents::{DocumentStore, TrackedDocument};
pub use error::LspError;
pub use protocol::{JsonRpcConnection, JsonRpcError};
