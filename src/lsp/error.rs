//! Errors surfaced by the LSP client engine

use crate::config::ConfigError;
use crate::io::process::ProcessError;
use crate::lsp::protocol::JsonRpcError;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum LspError {
    #[error("LSP client already started")]
    AlreadyStarted,

    #[error("LSP client not started")]
    NotStarted,

    #[error("LSP client not initialized")]
    NotInitialized,

    #[error("Document not found: {uri}")]
    DocumentNotFound { uri: String },

    /// The server exited or its stream ended while a request was outstanding
    #[error("Connection to language server closed")]
    TransportClosed,

    /// Error response sent by the server
    #[error("Language server error ({code}): {message}")]
    Protocol {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("LSP request timed out: {method}")]
    Timeout { method: String },

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid message from language server: {0}")]
    InvalidMessage(String),
}

impl From<JsonRpcError> for LspError {
    fn from(error: JsonRpcError) -> Self {
        match error {
            JsonRpcError::Server {
                code,
                message,
                data,
            } => LspError::Protocol {
                code,
                message,
                data,
            },
            JsonRpcError::TransportClosed => LspError::TransportClosed,
            JsonRpcError::Timeout { method } => LspError::Timeout { method },
            JsonRpcError::InvalidMessage(reason) => LspError::InvalidMessage(reason),
            JsonRpcError::Serialization(e) | JsonRpcError::Deserialization(e) => {
                LspError::Serialization(e)
            }
        }
    }
}
