//! Test utilities and global setup
//!
//! Provides an in-process fake language server for engine tests, plus
//! centralized test logging configuration.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::io::process::{
    ProcessError, ProcessExitEvent, ProcessExitHandler, ProcessManager, StderrMonitor, StopMode,
};
use crate::io::transport::StdioTransport;

/// Pid reported in exit events of the fake server
pub const FAKE_PID: u32 = 4242;

const WAIT_LIMIT: Duration = Duration::from_secs(5);
const PIPE_CAPACITY: usize = 64 * 1024;

// ============================================================================
// Fake Language Server
// ============================================================================

/// How the fake server answers a request
#[derive(Debug, Clone)]
pub enum Reply {
    Result(Value),
    Error { code: i32, message: String },
    /// Never answer
    Silent,
}

#[derive(Default)]
struct ServerState {
    received: Mutex<Vec<Value>>,
    replies: Mutex<HashMap<String, Reply>>,
    greeting: Mutex<Vec<Value>>,
    push: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    exit_handler: Mutex<Option<Arc<dyn ProcessExitHandler>>>,
    ignore_exit: AtomicBool,
    running: AtomicBool,
    starts: AtomicUsize,
}

/// Scripted language server on the far side of an in-memory pipe
///
/// Records every message the client sends, answers requests from a reply
/// table (`initialize` gets a small capability set, anything unscripted gets
/// `null`), and exits on `exit` or when its stdin closes.
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<ServerState>,
}

impl FakeServer {
    /// Script the reply for every later request to `method`
    pub fn reply(&self, method: &str, reply: Reply) {
        self.state
            .replies
            .lock()
            .unwrap()
            .insert(method.to_string(), reply);
    }

    /// Queue a message written as soon as the server starts, before it reads
    pub fn push_on_start(&self, message: Value) {
        self.state.greeting.lock().unwrap().push(message);
    }

    /// Send a message to the client now
    pub fn push(&self, message: Value) {
        let push = self.state.push.lock().unwrap();
        push.as_ref()
            .expect("fake server is not running")
            .send(message)
            .unwrap();
    }

    /// Keep running after the `exit` notification
    pub fn ignore_exit(&self) {
        self.state.ignore_exit.store(true, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().unwrap().clone()
    }

    /// Requests and notifications the client sent for `method`
    pub fn messages(&self, method: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|message| message.get("method").and_then(Value::as_str) == Some(method))
            .collect()
    }

    /// The client's answer to the server request `id`
    pub fn response_to(&self, id: &Value) -> Option<Value> {
        self.received()
            .into_iter()
            .find(|message| message.get("method").is_none() && message.get("id") == Some(id))
    }

    /// Wait until at least `count` messages for `method` have arrived
    pub async fn wait_for(&self, method: &str, count: usize) -> Vec<Value> {
        let deadline = Instant::now() + WAIT_LIMIT;
        loop {
            let found = self.messages(method);
            if found.len() >= count {
                return found;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {count} `{method}` message(s), got {}",
                found.len()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_for_response(&self, id: &Value) -> Value {
        let deadline = Instant::now() + WAIT_LIMIT;
        loop {
            if let Some(response) = self.response_to(id) {
                return response;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for a response to {id}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// How many times the process was started
    pub fn start_count(&self) -> usize {
        self.state.starts.load(Ordering::SeqCst)
    }

    /// Simulate the process dying: close the pipes and report the exit
    pub async fn exit(&self, code: Option<i32>) {
        self.kill();
        self.report_exit(code).await;
    }

    fn kill(&self) {
        if let Some(kill) = self.state.kill.lock().unwrap().take() {
            let _ = kill.send(());
        }
    }

    /// Fire the exit handler once per run
    async fn report_exit(&self, code: Option<i32>) {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handler = self.state.exit_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler
                .on_process_exit(ProcessExitEvent {
                    pid: Some(FAKE_PID),
                    code,
                })
                .await;
        }
    }

    fn spawn(&self, stream: DuplexStream) {
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        *self.state.push.lock().unwrap() = Some(push_tx);
        *self.state.kill.lock().unwrap() = Some(kill_tx);
        self.state.running.store(true, Ordering::SeqCst);
        self.state.starts.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(self.clone().run(stream, push_rx, kill_rx));
    }

    async fn run(
        self,
        stream: DuplexStream,
        mut push_rx: mpsc::UnboundedReceiver<Value>,
        mut kill_rx: oneshot::Receiver<()>,
    ) {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let greeting: Vec<Value> = self.state.greeting.lock().unwrap().drain(..).collect();
        for message in &greeting {
            write_frame(&mut writer, message).await;
        }

        let mut buffer = Vec::new();
        let mut chunk = vec![0u8; 4096];
        let code = loop {
            tokio::select! {
                _ = &mut kill_rx => return,
                Some(message) = push_rx.recv() => write_frame(&mut writer, &message).await,
                read = reader.read(&mut chunk) => match read {
                    Ok(0) | Err(_) => break Some(0),
                    Ok(n) => {
                        buffer.extend_from_slice(&chunk[..n]);
                        let mut exited = false;
                        while let Some(message) = take_frame(&mut buffer) {
                            if self.handle(message, &mut writer).await {
                                exited = true;
                                break;
                            }
                        }
                        if exited {
                            break Some(0);
                        }
                    }
                },
            }
        };

        drop(writer);
        drop(reader);
        self.report_exit(code).await;
    }

    /// Record and answer one message. Returns true on `exit`.
    async fn handle(&self, message: Value, writer: &mut WriteHalf<DuplexStream>) -> bool {
        self.state.received.lock().unwrap().push(message.clone());

        let method = message.get("method").and_then(Value::as_str);
        let id = message.get("id").filter(|id| !id.is_null()).cloned();
        match (method, id) {
            (Some(method), Some(id)) => {
                let response = match self.reply_for(method) {
                    Reply::Result(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                    Reply::Error { code, message } => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": code, "message": message}
                    }),
                    Reply::Silent => return false,
                };
                write_frame(writer, &response).await;
                false
            }
            (Some("exit"), None) => !self.state.ignore_exit.load(Ordering::SeqCst),
            _ => false,
        }
    }

    fn reply_for(&self, method: &str) -> Reply {
        if let Some(reply) = self.state.replies.lock().unwrap().get(method) {
            return reply.clone();
        }
        match method {
            "initialize" => Reply::Result(json!({
                "capabilities": {
                    "textDocumentSync": 1,
                    "hoverProvider": true,
                    "completionProvider": {},
                    "definitionProvider": true
                },
                "serverInfo": {"name": "fake-language-server"}
            })),
            _ => Reply::Result(Value::Null),
        }
    }
}

async fn write_frame(writer: &mut WriteHalf<DuplexStream>, message: &Value) {
    let body = message.to_string();
    let frame = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
    let _ = writer.write_all(frame.as_bytes()).await;
    let _ = writer.flush().await;
}

/// Split one complete frame off the front of `buffer`
fn take_frame(buffer: &mut Vec<u8>) -> Option<Value> {
    let header_end = buffer.windows(4).position(|window| window == b"\r\n\r\n")?;
    let header = std::str::from_utf8(&buffer[..header_end]).expect("frame header is not UTF-8");
    let length: usize = header
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length:"))
        .and_then(|value| value.trim().parse().ok())
        .expect("frame header has no valid Content-Length");

    let body_start = header_end + 4;
    if buffer.len() < body_start + length {
        return None;
    }
    let frame: Vec<u8> = buffer.drain(..body_start + length).collect();
    let body = serde_json::from_slice(&frame[body_start..]).unwrap_or_else(|e| {
        panic!(
            "client sent a frame that is not JSON ({e}): {}",
            String::from_utf8_lossy(&frame[body_start..])
        )
    });
    Some(body)
}

// ============================================================================
// Mock Process Manager
// ============================================================================

/// Process manager whose "process" is a [`FakeServer`] task
pub struct MockProcessManager {
    server: FakeServer,
    transport: Option<StdioTransport>,
    spawn_fails: bool,
}

impl MockProcessManager {
    pub fn new() -> (Self, FakeServer) {
        let server = FakeServer::default();
        let manager = Self {
            server: server.clone(),
            transport: None,
            spawn_fails: false,
        };
        (manager, server)
    }

    /// A manager whose `start()` fails like a missing executable
    pub fn failing() -> (Self, FakeServer) {
        let (mut manager, server) = Self::new();
        manager.spawn_fails = true;
        (manager, server)
    }
}

#[async_trait]
impl ProcessManager for MockProcessManager {
    async fn start(&mut self) -> Result<(), ProcessError> {
        if self.server.is_running() {
            return Err(ProcessError::AlreadyStarted);
        }
        if self.spawn_fails {
            return Err(ProcessError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "fake-language-server: not found",
            )));
        }

        let (client_end, server_end) = tokio::io::duplex(PIPE_CAPACITY);
        let (stdout, stdin) = tokio::io::split(client_end);
        self.transport = Some(StdioTransport::new(stdin, stdout));
        self.server.spawn(server_end);
        Ok(())
    }

    async fn stop(&mut self, _mode: StopMode) -> Result<(), ProcessError> {
        if !self.server.is_running() {
            return Err(ProcessError::NotStarted);
        }
        self.transport.take();
        self.server.exit(None).await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.server.is_running()
    }

    fn create_stdio_transport(&mut self) -> Result<StdioTransport, ProcessError> {
        self.transport.take().ok_or(ProcessError::NotStarted)
    }

    fn on_process_exit(&mut self, handler: Arc<dyn ProcessExitHandler>) {
        *self.server.state.exit_handler.lock().unwrap() = Some(handler);
    }

    fn kill_sync(&mut self) {
        self.transport.take();
        self.server.kill();
        self.server.state.running.store(false, Ordering::SeqCst);
    }
}

impl StderrMonitor for MockProcessManager {
    fn on_stderr_line<F>(&mut self, _handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
    }
}

// ============================================================================
// Test Logging
// ============================================================================

/// Test logging utilities
#[cfg(feature = "test-logging")]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally - safe to call multiple times
    ///
    /// Respects `RUST_LOG`, defaulting to debug for this crate and info for
    /// tokio. Output goes through the test writer so it is captured per test.
    ///
    /// ```bash
    /// RUST_LOG=lsp_session=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok();
        });
    }

    #[ctor::ctor]
    fn init_test_logging() {
        init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_frame_waits_for_complete_body() {
        let mut buffer = b"Content-Length: 14\r\n\r\n{\"id\":".to_vec();
        assert!(take_frame(&mut buffer).is_none());

        buffer.extend_from_slice(b"1,\"a\":2}Content-Length: 2\r\n\r\n{}");
        assert_eq!(take_frame(&mut buffer), Some(json!({"id": 1, "a": 2})));
        assert_eq!(take_frame(&mut buffer), Some(json!({})));
        assert!(buffer.is_empty());
    }

    #[test]
    #[should_panic(expected = "not JSON")]
    fn test_take_frame_rejects_malformed_body() {
        let mut buffer = b"Content-Length: 4\r\n\r\n{\"id".to_vec();
        take_frame(&mut buffer);
    }

    #[tokio::test]
    async fn test_fake_server_exits_when_stdin_closes() {
        let (mut process, server) = MockProcessManager::new();
        process.start().await.unwrap();
        assert!(process.is_running());
        assert!(matches!(
            process.start().await,
            Err(ProcessError::AlreadyStarted)
        ));

        let transport = process.create_stdio_transport().unwrap();
        assert!(process.create_stdio_transport().is_err());

        // Closing stdin makes the fake exit like a real server would
        drop(transport);
        let deadline = Instant::now() + WAIT_LIMIT;
        while server.is_running() {
            assert!(Instant::now() < deadline, "fake server did not exit");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(server.start_count(), 1);
    }
}
