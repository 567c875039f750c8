//! LSP client engine
//!
//! Owns one language server process and the JSON-RPC connection on its
//! stdio, drives the `initialize` handshake, keeps the client's view of open
//! documents and exposes completion, hover, definition and diagnostics.
//!
//! ```text
//! Unstarted -> Starting -> Started -> Ready -> Terminated
//! ```
//!
//! Process exit moves any state to `Terminated`, disposing the connection
//! so that in-flight requests fail with [`LspError::TransportClosed`].

use async_trait::async_trait;
use lsp_types::notification::{self, Notification};
use lsp_types::request::{self, Request};
use lsp_types::{
    ClientCapabilities, ClientInfo, CompletionClientCapabilities, CompletionParams,
    CompletionResponse, ConfigurationParams, Diagnostic, DiagnosticClientCapabilities,
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DocumentDiagnosticParams, DocumentDiagnosticReport, DocumentDiagnosticReportResult,
    GotoCapability, GotoDefinitionParams, GotoDefinitionResponse, Hover, HoverClientCapabilities,
    HoverParams, InitializeParams, InitializeResult, InitializedParams, LogMessageParams,
    MarkupKind, MessageType, Position, ServerCapabilities, TextDocumentClientCapabilities,
    TextDocumentIdentifier, TextDocumentItem, TextDocumentPositionParams,
    TextDocumentSyncClientCapabilities, Uri, VersionedTextDocumentIdentifier, WorkspaceFolder,
};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::io::process::{
    ChildProcessManager, ProcessExitEvent, ProcessExitHandler, ProcessManager, StderrMonitor,
    StopMode,
};
use crate::io::transport::StdioTransport;
use crate::lsp::documents::{DocumentStore, TrackedDocument};
use crate::lsp::error::LspError;
use crate::lsp::protocol::{JsonRpcConnection, JsonRpcErrorCode, JsonRpcErrorObject};

/// How long the server gets to exit on its own after `exit` before it is killed
const EXIT_GRACE_PERIOD: Duration = Duration::from_millis(500);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

type Connection = JsonRpcConnection<StdioTransport>;

/// Handler for notifications sent by the server
pub type NotificationHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;

// ============================================================================
// Session State
// ============================================================================

/// Externally visible lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unstarted,
    Starting,
    /// Process running, `initialize` not yet completed
    Started,
    Ready,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Unstarted,
    Starting,
    Started,
    Terminated,
}

#[derive(Default)]
struct Session {
    phase: Phase,
    connection: Option<Arc<Connection>>,
    initialized: bool,
    init_result: Option<InitializeResult>,
}

impl Session {
    /// Connection of a ready session
    ///
    /// Readiness is re-derived on every call: the connection must exist, must
    /// not have been closed underneath us, and the handshake must be done.
    fn ready_connection(&self) -> Option<Arc<Connection>> {
        if self.phase != Phase::Started || !self.initialized {
            return None;
        }
        self.connection
            .as_ref()
            .filter(|connection| !connection.is_closed())
            .cloned()
    }
}

fn lock_session(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tears the session down when the server process exits
struct SessionExitHandler {
    session: Arc<Mutex<Session>>,
}

#[async_trait]
impl ProcessExitHandler for SessionExitHandler {
    async fn on_process_exit(&self, event: ProcessExitEvent) {
        let connection = {
            let mut session = lock_session(&self.session);
            session.phase = Phase::Terminated;
            session.connection.take()
        };

        if event.is_clean() {
            info!("Language server exited (pid {:?})", event.pid);
        } else {
            warn!(
                "Language server exited unexpectedly (pid {:?}, code {:?})",
                event.pid, event.code
            );
        }

        if let Some(connection) = connection {
            connection.dispose();
        }
    }
}

// ============================================================================
// LSP Client
// ============================================================================

/// Client for one language server process
///
/// Methods take `&self`; share the client behind an `Arc` to use it from
/// several tasks. Only one `start`/`initialize` sequence runs at a time,
/// while requests interleave freely.
pub struct LspClient<P = ChildProcessManager>
where
    P: ProcessManager + StderrMonitor + 'static,
{
    config: ServerConfig,
    process: tokio::sync::Mutex<P>,
    session: Arc<Mutex<Session>>,
    documents: Mutex<DocumentStore>,
    notification_handlers: Mutex<Vec<(String, NotificationHandler)>>,

    /// Serializes start, initialize and shutdown
    lifecycle: tokio::sync::Mutex<()>,
}

impl LspClient {
    /// Client that spawns `config.command` on [`start`](Self::start)
    pub fn new(config: ServerConfig) -> Self {
        let process = ChildProcessManager::new(
            config.command.clone(),
            config.args.clone(),
            Some(config.working_directory.clone()),
        );
        Self::with_process(config, process)
    }
}

impl<P> LspClient<P>
where
    P: ProcessManager + StderrMonitor + 'static,
{
    pub fn with_process(config: ServerConfig, process: P) -> Self {
        Self {
            config,
            process: tokio::sync::Mutex::new(process),
            session: Arc::new(Mutex::new(Session::default())),
            documents: Mutex::new(DocumentStore::new()),
            notification_handlers: Mutex::new(Vec::new()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        lock_session(&self.session)
    }

    fn documents(&self) -> MutexGuard<'_, DocumentStore> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Spawn the server and start listening on its stdio
    pub async fn start(&self) -> Result<(), LspError> {
        let _guard = self.lifecycle.lock().await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> Result<(), LspError> {
        {
            let mut session = self.session();
            if session.phase != Phase::Unstarted {
                return Err(LspError::AlreadyStarted);
            }
            session.phase = Phase::Starting;
        }

        info!(
            "Starting language server: {} {:?}",
            self.config.command, self.config.args
        );

        let mut process = self.process.lock().await;

        let stderr_handler = self.config.stderr_handler.clone();
        process.on_stderr_line(move |line| {
            warn!(target: "lsp_session::server", "{}", line);
            if let Some(handler) = &stderr_handler {
                handler(line);
            }
        });
        process.on_process_exit(Arc::new(SessionExitHandler {
            session: Arc::clone(&self.session),
        }));

        if let Err(e) = process.start().await {
            error!("Failed to start language server: {}", e);
            self.session().phase = Phase::Unstarted;
            return Err(e.into());
        }

        let transport = match process.create_stdio_transport() {
            Ok(transport) => transport,
            Err(e) => {
                process.kill_sync();
                self.session().phase = Phase::Unstarted;
                return Err(e.into());
            }
        };
        drop(process);

        let connection = Arc::new(JsonRpcConnection::new(transport));
        self.register_handlers(&connection);
        connection.start_listening();

        let mut session = self.session();
        if session.phase == Phase::Terminated {
            warn!("Language server exited during startup");
            connection.dispose();
            return Ok(());
        }
        session.phase = Phase::Started;
        session.connection = Some(connection);
        debug!("Language server started, awaiting initialize");
        Ok(())
    }

    /// Install handlers for server-initiated messages
    ///
    /// Runs before the connection starts listening so nothing the server
    /// sends first can slip past them.
    fn register_handlers(&self, connection: &Connection) {
        connection.register_handler(request::RegisterCapability::METHOD, |_| {
            debug!("Acknowledging client/registerCapability");
            Ok(Value::Null)
        });
        connection.register_handler(request::UnregisterCapability::METHOD, |_| {
            debug!("Acknowledging client/unregisterCapability");
            Ok(Value::Null)
        });
        connection.register_handler(request::WorkDoneProgressCreate::METHOD, |_| Ok(Value::Null));
        connection.register_handler(request::WorkspaceConfiguration::METHOD, |params| {
            let params: ConfigurationParams = params
                .and_then(|params| serde_json::from_value(params).ok())
                .ok_or_else(|| {
                    JsonRpcErrorObject::new(
                        JsonRpcErrorCode::InvalidParams,
                        "workspace/configuration expects an items list",
                    )
                })?;
            Ok(Value::Array(vec![Value::Null; params.items.len()]))
        });
        connection.register_handler(notification::LogMessage::METHOD, |params| {
            if let Some(params) =
                params.and_then(|p| serde_json::from_value::<LogMessageParams>(p).ok())
            {
                forward_log_message(&params);
            }
            Ok(Value::Null)
        });

        let handlers = self
            .notification_handlers
            .lock()
            .map(|handlers| handlers.clone())
            .unwrap_or_default();
        for (method, handler) in handlers {
            connection.register_handler(&method, move |params| {
                handler(params);
                Ok(Value::Null)
            });
        }
    }

    /// Route server notifications for `method` to `handler`
    ///
    /// Takes effect immediately on a running connection and on any later one.
    pub fn on_server_notification<F>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        let handler: NotificationHandler = Arc::new(handler);
        if let Ok(mut handlers) = self.notification_handlers.lock() {
            handlers.push((method.to_string(), Arc::clone(&handler)));
        }
        let connection = self.session().connection.clone();
        if let Some(connection) = connection {
            connection.register_handler(method, move |params| {
                handler(params);
                Ok(Value::Null)
            });
        }
    }

    /// Perform the `initialize` / `initialized` handshake
    ///
    /// Calls after a successful handshake return the retained result without
    /// touching the wire.
    pub async fn initialize(&self) -> Result<InitializeResult, LspError> {
        let _guard = self.lifecycle.lock().await;
        self.initialize_locked().await
    }

    async fn initialize_locked(&self) -> Result<InitializeResult, LspError> {
        let connection = {
            let session = self.session();
            match session.phase {
                Phase::Unstarted | Phase::Starting => return Err(LspError::NotStarted),
                Phase::Terminated => return Err(LspError::TransportClosed),
                Phase::Started => {}
            }
            if session.initialized {
                if let Some(result) = &session.init_result {
                    return Ok(result.clone());
                }
            }
            session
                .connection
                .clone()
                .ok_or(LspError::TransportClosed)?
        };

        info!("Initializing language server");
        let params = self.initialize_params()?;
        let result = self
            .request::<request::Initialize>(&connection, params)
            .await?;
        debug!("Server capabilities: {:?}", result.capabilities);

        self.notify::<notification::Initialized>(&connection, InitializedParams {})?;

        let mut session = self.session();
        session.initialized = true;
        session.init_result = Some(result.clone());
        info!("Language server ready");
        Ok(result)
    }

    #[allow(deprecated)]
    fn initialize_params(&self) -> Result<InitializeParams, LspError> {
        let root_uri = self.config.root_uri()?;

        Ok(InitializeParams {
            process_id: Some(std::process::id()),
            root_uri: Some(root_uri.clone()),
            capabilities: ClientCapabilities {
                text_document: Some(TextDocumentClientCapabilities {
                    synchronization: Some(TextDocumentSyncClientCapabilities {
                        dynamic_registration: Some(false),
                        ..Default::default()
                    }),
                    completion: Some(CompletionClientCapabilities {
                        dynamic_registration: Some(false),
                        ..Default::default()
                    }),
                    hover: Some(HoverClientCapabilities {
                        dynamic_registration: Some(false),
                        content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
                    }),
                    definition: Some(GotoCapability {
                        dynamic_registration: Some(false),
                        link_support: Some(false),
                    }),
                    diagnostic: Some(DiagnosticClientCapabilities {
                        dynamic_registration: Some(false),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            workspace_folders: Some(vec![WorkspaceFolder {
                uri: root_uri,
                name: self.config.workspace_name(),
            }]),
            client_info: Some(ClientInfo {
                name: self.config.client_name.clone(),
                version: Some(self.config.client_version.clone()),
            }),
            ..Default::default()
        })
    }

    /// Start and initialize if that has not happened yet
    ///
    /// Concurrent callers wait for the attempt already in flight.
    pub async fn ensure_ready(&self) -> Result<(), LspError> {
        if self.is_ready() {
            return Ok(());
        }

        let _guard = self.lifecycle.lock().await;
        let unstarted = self.session().phase == Phase::Unstarted;
        if unstarted {
            self.start_locked().await?;
        }
        self.initialize_locked().await?;
        Ok(())
    }

    /// Orderly `shutdown` / `exit` handshake, then process cleanup
    ///
    /// The process is killed and documents are cleared even if the handshake
    /// fails. No-op before start and after termination.
    pub async fn shutdown(&self) -> Result<(), LspError> {
        let _guard = self.lifecycle.lock().await;

        let (connection, initialized) = {
            let mut session = self.session();
            match session.phase {
                Phase::Unstarted | Phase::Terminated => return Ok(()),
                Phase::Starting | Phase::Started => {}
            }
            (session.connection.take(), session.initialized)
        };

        info!("Shutting down language server");
        if let Some(connection) = connection {
            if initialized {
                if let Err(e) = self.request::<request::Shutdown>(&connection, ()).await {
                    warn!("Shutdown request failed: {}", e);
                }
            }
            if let Err(e) = self.notify::<notification::Exit>(&connection, ()) {
                debug!("Could not send exit notification: {}", e);
            }
            connection.dispose();
        }

        self.stop_process(EXIT_GRACE_PERIOD).await;
        self.documents().clear();
        self.terminate();
        Ok(())
    }

    /// Release the connection and kill the process. Idempotent.
    pub async fn dispose(&self) -> Result<(), LspError> {
        let (connection, started) = {
            let mut session = self.session();
            (session.connection.take(), session.phase != Phase::Unstarted)
        };
        if let Some(connection) = connection {
            connection.dispose();
        }

        self.stop_process(Duration::ZERO).await;
        self.documents().clear();
        if started {
            self.terminate();
        }
        Ok(())
    }

    fn terminate(&self) {
        let mut session = self.session();
        session.phase = Phase::Terminated;
        session.initialized = false;
    }

    /// Give the process `grace` to exit by itself, the same again after
    /// SIGTERM, then kill it. A zero grace kills right away.
    async fn stop_process(&self, grace: Duration) {
        let mut process = self.process.lock().await;

        if !grace.is_zero() {
            if exits_within(&*process, grace).await {
                return;
            }
            debug!("Language server still running after exit, terminating");
            if let Err(e) = process.stop(StopMode::Graceful).await {
                warn!("Failed to terminate language server: {}", e);
            }
            if exits_within(&*process, grace).await {
                return;
            }
        }

        if process.is_running() {
            debug!("Killing language server");
            if let Err(e) = process.stop(StopMode::Force).await {
                warn!("Failed to stop language server: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    pub fn is_ready(&self) -> bool {
        self.session().ready_connection().is_some()
    }

    pub fn state(&self) -> ClientState {
        let session = self.session();
        match session.phase {
            Phase::Unstarted => ClientState::Unstarted,
            Phase::Starting => ClientState::Starting,
            Phase::Started if session.ready_connection().is_some() => ClientState::Ready,
            Phase::Started => ClientState::Started,
            Phase::Terminated => ClientState::Terminated,
        }
    }

    /// Capabilities announced by the server in its `initialize` response
    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.session()
            .init_result
            .as_ref()
            .map(|result| result.capabilities.clone())
    }

    fn ready_connection(&self) -> Result<Arc<Connection>, LspError> {
        self.session()
            .ready_connection()
            .ok_or(LspError::NotInitialized)
    }

    // ------------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------------

    /// Track a document and announce it with `textDocument/didOpen` when ready
    pub fn open_document(
        &self,
        uri: Uri,
        language_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(), LspError> {
        let item = {
            let mut documents = self.documents();
            let document = documents.open(uri, language_id.into(), text.into());
            TextDocumentItem {
                uri: document.uri.clone(),
                language_id: document.language_id.clone(),
                version: document.version,
                text: document.text.clone(),
            }
        };

        let connection = self.session().ready_connection();
        match connection {
            Some(connection) => self.notify::<notification::DidOpenTextDocument>(
                &connection,
                DidOpenTextDocumentParams {
                    text_document: item,
                },
            ),
            None => {
                debug!("Not ready, tracking {} locally", item.uri.as_str());
                Ok(())
            }
        }
    }

    /// Replace the full text of a tracked document, returning its new version
    pub fn update_document(&self, uri: &Uri, text: impl Into<String>) -> Result<i32, LspError> {
        let (version, change) = self
            .documents()
            .update(uri, text.into())
            .ok_or_else(|| LspError::DocumentNotFound {
                uri: uri.as_str().to_string(),
            })?;

        let connection = self.session().ready_connection();
        if let Some(connection) = connection {
            self.notify::<notification::DidChangeTextDocument>(
                &connection,
                DidChangeTextDocumentParams {
                    text_document: VersionedTextDocumentIdentifier {
                        uri: uri.clone(),
                        version,
                    },
                    content_changes: vec![change],
                },
            )?;
        }
        Ok(version)
    }

    /// Stop tracking a document. Closing an untracked document does nothing.
    pub fn close_document(&self, uri: &Uri) -> Result<(), LspError> {
        if self.documents().close(uri).is_none() {
            debug!("Close of untracked document {}", uri.as_str());
            return Ok(());
        }

        let connection = self.session().ready_connection();
        match connection {
            Some(connection) => self.notify::<notification::DidCloseTextDocument>(
                &connection,
                DidCloseTextDocumentParams {
                    text_document: TextDocumentIdentifier { uri: uri.clone() },
                },
            ),
            None => Ok(()),
        }
    }

    /// Snapshot of a tracked document
    pub fn document(&self, uri: &Uri) -> Option<TrackedDocument> {
        self.documents().get(uri).cloned()
    }

    pub fn open_documents(&self) -> Vec<Uri> {
        self.documents().uris()
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    pub async fn get_completions(
        &self,
        uri: &Uri,
        line: u32,
        character: u32,
    ) -> Result<Option<CompletionResponse>, LspError> {
        let connection = self.ready_connection()?;
        self.request::<request::Completion>(
            &connection,
            CompletionParams {
                text_document_position: position_params(uri, line, character),
                work_done_progress_params: Default::default(),
                partial_result_params: Default::default(),
                context: None,
            },
        )
        .await
    }

    pub async fn get_hover(
        &self,
        uri: &Uri,
        line: u32,
        character: u32,
    ) -> Result<Option<Hover>, LspError> {
        let connection = self.ready_connection()?;
        self.request::<request::HoverRequest>(
            &connection,
            HoverParams {
                text_document_position_params: position_params(uri, line, character),
                work_done_progress_params: Default::default(),
            },
        )
        .await
    }

    pub async fn get_definition(
        &self,
        uri: &Uri,
        line: u32,
        character: u32,
    ) -> Result<Option<GotoDefinitionResponse>, LspError> {
        let connection = self.ready_connection()?;
        self.request::<request::GotoDefinition>(
            &connection,
            GotoDefinitionParams {
                text_document_position_params: position_params(uri, line, character),
                work_done_progress_params: Default::default(),
                partial_result_params: Default::default(),
            },
        )
        .await
    }

    /// Pull diagnostics for a document
    ///
    /// A full report yields its items. Unchanged reports, partial results and
    /// a null response all yield an empty list.
    pub async fn get_diagnostics(&self, uri: &Uri) -> Result<Vec<Diagnostic>, LspError> {
        let connection = self.ready_connection()?;
        let params = DocumentDiagnosticParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
            identifier: None,
            previous_result_id: None,
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        let value = self
            .call(
                &connection,
                request::DocumentDiagnosticRequest::METHOD,
                serde_json::to_value(params)?,
            )
            .await?;
        let report: Option<DocumentDiagnosticReportResult> = serde_json::from_value(value)?;

        Ok(match report {
            Some(DocumentDiagnosticReportResult::Report(DocumentDiagnosticReport::Full(full))) => {
                full.full_document_diagnostic_report.items
            }
            Some(DocumentDiagnosticReportResult::Report(
                DocumentDiagnosticReport::Unchanged(_),
            )) => {
                debug!("Diagnostics unchanged for {}", uri.as_str());
                Vec::new()
            }
            Some(DocumentDiagnosticReportResult::Partial(_)) | None => Vec::new(),
        })
    }

    // ------------------------------------------------------------------------
    // Wire helpers
    // ------------------------------------------------------------------------

    async fn request<R: Request>(
        &self,
        connection: &Connection,
        params: R::Params,
    ) -> Result<R::Result, LspError> {
        let value = self
            .call(connection, R::METHOD, serde_json::to_value(params)?)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn call(
        &self,
        connection: &Connection,
        method: &str,
        params: Value,
    ) -> Result<Value, LspError> {
        let params = (!params.is_null()).then_some(params);
        Ok(connection
            .send_request_with_timeout(method, params, self.config.request_timeout)
            .await?)
    }

    fn notify<N: Notification>(
        &self,
        connection: &Connection,
        params: N::Params,
    ) -> Result<(), LspError> {
        let params = serde_json::to_value(params)?;
        let params = (!params.is_null()).then_some(params);
        Ok(connection.send_notification(N::METHOD, params)?)
    }
}

impl<P> Drop for LspClient<P>
where
    P: ProcessManager + StderrMonitor + 'static,
{
    fn drop(&mut self) {
        if let Some(connection) = self.session().connection.take() {
            connection.dispose();
        }
        self.process.get_mut().kill_sync();
    }
}

/// Poll until the process stops or `grace` runs out; true if it stopped
async fn exits_within<P: ProcessManager>(process: &P, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    while process.is_running() && Instant::now() < deadline {
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    !process.is_running()
}

fn position_params(uri: &Uri, line: u32, character: u32) -> TextDocumentPositionParams {
    TextDocumentPositionParams {
        text_document: TextDocumentIdentifier { uri: uri.clone() },
        position: Position::new(line, character),
    }
}

/// Re-emit a `window/logMessage` notification through tracing
fn forward_log_message(params: &LogMessageParams) {
    let message = params.message.as_str();
    if params.typ == MessageType::ERROR {
        error!(target: "lsp_session::server", "{}", message);
    } else if params.typ == MessageType::WARNING {
        warn!(target: "lsp_session::server", "{}", message);
    } else if params.typ == MessageType::INFO {
        info!(target: "lsp_session::server", "{}", message);
    } else {
        debug!(target: "lsp_session::server", "{}", message);
    }
}
