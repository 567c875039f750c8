//! JSON-RPC 2.0 connection
//!
//! Correlates outgoing requests with their responses by identifier, answers
//! requests initiated by the server through a method dispatch table, and
//! fails every outstanding request once the channel goes away.

use crate::io::transport::Transport;
use crate::lsp::framing::LspFraming;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{Level, debug, trace, warn};

/// JSON-RPC version tag carried by every message
pub const JSONRPC_VERSION: &str = "2.0";

// ============================================================================
// JSON-RPC Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    /// `Some(Value::Null)` serializes as `"result": null`, which is how
    /// void results must be written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC 2.0 error codes the client answers server requests with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum JsonRpcErrorCode {
    MethodNotFound = -32601,
    InvalidParams = -32602,
}

impl JsonRpcErrorObject {
    pub fn new(code: JsonRpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code as i32,
            message: message.into(),
            data: None,
        }
    }
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: JsonRpcErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::failure(
            id,
            JsonRpcErrorObject::new(
                JsonRpcErrorCode::MethodNotFound,
                format!("Method not found: {method}"),
            ),
        )
    }
}

/// Any message that can arrive from the peer
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// Classify a message body by the presence of `method` and `id`
    pub fn parse(body: &str) -> Result<Self, JsonRpcError> {
        let value: Value = serde_json::from_str(body).map_err(JsonRpcError::Deserialization)?;

        let has_method = value.get("method").is_some();
        let has_id = value.get("id").is_some_and(|id| !id.is_null());

        let message = match (has_method, has_id) {
            (true, true) => Self::Request(
                serde_json::from_value(value).map_err(JsonRpcError::Deserialization)?,
            ),
            (true, false) => Self::Notification(
                serde_json::from_value(value).map_err(JsonRpcError::Deserialization)?,
            ),
            (false, _) if value.get("result").is_some() || value.get("error").is_some() => {
                Self::Response(
                    serde_json::from_value(value).map_err(JsonRpcError::Deserialization)?,
                )
            }
            (false, _) => {
                return Err(JsonRpcError::InvalidMessage(
                    "message has neither method nor result".to_string(),
                ));
            }
        };
        Ok(message)
    }
}

// ============================================================================
// JSON-RPC Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum JsonRpcError {
    /// Well-formed error response from the peer
    #[error("JSON-RPC server error ({code}): {message}")]
    Server {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    /// The channel ended before a response arrived
    #[error("Transport closed")]
    TransportClosed,

    #[error("Request timed out: {method}")]
    Timeout { method: String },

    #[error("Invalid JSON-RPC message: {0}")]
    InvalidMessage(String),

    #[error("Serialization error: {0}")]
    Serialization(serde_json::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(serde_json::Error),
}

// ============================================================================
// JSON-RPC Connection
// ============================================================================

/// Handler for a request or notification initiated by the peer
///
/// The return value becomes the response for requests and is discarded for
/// notifications.
pub type MethodHandler =
    Arc<dyn Fn(Option<Value>) -> Result<Value, JsonRpcErrorObject> + Send + Sync>;

type PendingRequests = Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>;

enum Outbound {
    Frame(String),
    Close,
}

/// State shared between the connection handle and its I/O task
struct Shared {
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: PendingRequests,
    handlers: RwLock<HashMap<String, MethodHandler>>,
    closed: AtomicBool,
}

impl Shared {
    fn enqueue<M: Serialize>(&self, message: &M) -> Result<(), JsonRpcError> {
        let body = serde_json::to_string(message).map_err(JsonRpcError::Serialization)?;
        self.outbound
            .send(Outbound::Frame(body))
            .map_err(|_| JsonRpcError::TransportClosed)
    }

    /// Mark closed, then drop every pending sender so waiters see
    /// `TransportClosed`
    fn fail_pending(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<_> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().collect(),
            Err(_) => Vec::new(),
        };
        if !drained.is_empty() {
            debug!("Failing {} pending request(s): transport closed", drained.len());
        }
    }

    fn remove_pending(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }

    fn handler(&self, method: &str) -> Option<MethodHandler> {
        self.handlers
            .read()
            .ok()
            .and_then(|handlers| handlers.get(method).cloned())
    }

    fn dispatch(&self, body: &str) {
        let message = match JsonRpcMessage::parse(body) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping unparseable message from server: {}", e);
                return;
            }
        };

        match message {
            JsonRpcMessage::Response(response) => {
                let Some(id) = response.id.as_u64() else {
                    debug!("Response with foreign id {:?} ignored", response.id);
                    return;
                };
                let sender = self.pending.lock().ok().and_then(|mut p| p.remove(&id));
                match sender {
                    Some(sender) => {
                        if sender.send(response).is_err() {
                            debug!("Waiter for request {} is gone", id);
                        }
                    }
                    None => debug!("Response for unknown request {}", id),
                }
            }
            JsonRpcMessage::Request(request) => {
                crate::log_lsp_message!(
                    Level::DEBUG,
                    "incoming",
                    request.method.as_str(),
                    &request.params
                );
                let response = match self.handler(&request.method) {
                    Some(handler) => match handler(request.params) {
                        Ok(result) => JsonRpcResponse::success(request.id, result),
                        Err(error) => JsonRpcResponse::failure(request.id, error),
                    },
                    None => {
                        debug!("No handler for server request {}", request.method);
                        JsonRpcResponse::method_not_found(request.id, &request.method)
                    }
                };
                if let Err(e) = self.enqueue(&response) {
                    warn!("Could not answer server request: {}", e);
                }
            }
            JsonRpcMessage::Notification(notification) => {
                match self.handler(&notification.method) {
                    Some(handler) => {
                        let _ = handler(notification.params);
                    }
                    None => trace!("Unhandled notification {}", notification.method),
                }
            }
        }
    }
}

/// Bidirectional JSON-RPC channel over a framed transport
///
/// Created idle: frames queued before [`start_listening`] are written once
/// it is called, and handlers registered before it are guaranteed to see
/// the very first inbound message.
///
/// [`start_listening`]: JsonRpcConnection::start_listening
pub struct JsonRpcConnection<T: Transport> {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    /// Framed transport and outbound queue, until the I/O task takes them
    idle: Mutex<Option<(LspFraming<T>, mpsc::UnboundedReceiver<Outbound>)>>,
}

impl<T: Transport + 'static> JsonRpcConnection<T> {
    pub fn new(transport: T) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                outbound,
                pending: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
            next_id: AtomicU64::new(1),
            idle: Mutex::new(Some((LspFraming::new(transport), outbound_rx))),
        }
    }

    /// Install the handler for peer-initiated `method`, replacing any earlier one
    pub fn register_handler<F>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Value>) -> Result<Value, JsonRpcErrorObject> + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.shared.handlers.write() {
            handlers.insert(method.to_string(), Arc::new(handler));
        }
    }

    /// Spawn the I/O task. Later calls are no-ops.
    pub fn start_listening(&self) {
        let idle = self.idle.lock().ok().and_then(|mut idle| idle.take());
        let Some((transport, outbound_rx)) = idle else {
            debug!("JsonRpcConnection: already listening or disposed");
            return;
        };
        tokio::spawn(Self::io_loop(
            transport,
            outbound_rx,
            Arc::clone(&self.shared),
        ));
    }

    async fn io_loop(
        mut transport: LspFraming<T>,
        mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
        shared: Arc<Shared>,
    ) {
        loop {
            tokio::select! {
                command = outbound_rx.recv() => match command {
                    Some(Outbound::Frame(body)) => {
                        trace!("JsonRpcConnection: -> {}", body);
                        if let Err(e) = transport.send(&body).await {
                            warn!("Failed to write to server: {}", e);
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = transport.close().await;
                        break;
                    }
                },
                inbound = transport.receive() => match inbound {
                    Ok(body) => {
                        trace!("JsonRpcConnection: <- {}", body);
                        shared.dispatch(&body);
                    }
                    Err(e) => {
                        debug!("Server channel ended: {}", e);
                        break;
                    }
                },
            }
        }

        shared.fail_pending();
        trace!("JsonRpcConnection: I/O task finished");
    }

    /// Send a request and wait for its correlated response
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, JsonRpcError> {
        self.send_request_with_timeout(method, params, None).await
    }

    /// Like [`send_request`](Self::send_request), giving up after `timeout`
    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, JsonRpcError> {
        if self.is_closed() {
            return Err(JsonRpcError::TransportClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        crate::log_lsp_message!(Level::DEBUG, "outgoing", method, &params);
        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Value::from(id),
            method: method.to_string(),
            params,
        };

        let (response_tx, response_rx) = oneshot::channel();
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.insert(id, response_tx);
        }
        // fail_pending may have drained the map before our insert
        if self.is_closed() {
            self.shared.remove_pending(id);
            return Err(JsonRpcError::TransportClosed);
        }
        if let Err(e) = self.shared.enqueue(&request) {
            self.shared.remove_pending(id);
            return Err(e);
        }

        let response = match timeout {
            None => response_rx.await,
            Some(limit) => match tokio::time::timeout(limit, response_rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.shared.remove_pending(id);
                    return Err(JsonRpcError::Timeout {
                        method: method.to_string(),
                    });
                }
            },
        }
        .map_err(|_| JsonRpcError::TransportClosed)?;

        if let Some(error) = response.error {
            return Err(JsonRpcError::Server {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Queue a one-way message. Fails only once the channel is closed.
    pub fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), JsonRpcError> {
        if self.is_closed() {
            return Err(JsonRpcError::TransportClosed);
        }

        crate::log_lsp_message!(Level::DEBUG, "outgoing", method, &params);
        self.shared.enqueue(&JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        })
    }

    /// Close the channel. Idempotent.
    ///
    /// Frames already queued are still written before the transport closes;
    /// requests still waiting fail with `TransportClosed`.
    pub fn dispose(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("JsonRpcConnection: disposing");

        let _ = self.shared.outbound.send(Outbound::Close);
        if let Ok(mut idle) = self.idle.lock() {
            idle.take();
        }
        self.shared.fail_pending();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl<T: Transport> Drop for JsonRpcConnection<T> {
    fn drop(&mut self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shared.outbound.send(Outbound::Close);
        }
    }
}
