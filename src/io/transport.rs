//! Transport layer - raw bidirectional byte channel
//!
//! Moves text between the client and a language server process without any
//! knowledge of message framing. Framing lives one layer up in
//! [`crate::lsp::framing`].

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, trace, warn};

// ============================================================================
// Constants
// ============================================================================

/// Size of a single read from the server's stdout
const READ_CHUNK_SIZE: usize = 4096;

/// Initial capacity of the pending-bytes buffer
const PENDING_BYTES_CAPACITY: usize = 8192;

/// Stand-in for undecodable input bytes; single byte so framing offsets hold
const INVALID_BYTE_REPLACEMENT: u8 = b'?';

/// Core transport trait for bidirectional text exchange
#[async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Write a chunk of text to the peer
    async fn send(&mut self, message: &str) -> Result<(), Self::Error>;

    /// Wait for the next chunk of text from the peer
    async fn receive(&mut self) -> Result<String, Self::Error>;

    /// Close both directions
    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Whether the transport can still be used
    fn is_connected(&self) -> bool;
}

// ============================================================================
// Stdio Transport
// ============================================================================

/// Error types for stdio transport
#[derive(Debug, thiserror::Error)]
pub enum StdioTransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Channel error: {0}")]
    Channel(String),
}

/// Transport over a writer (server stdin) and a reader (server stdout)
///
/// Reading and writing happen in two background tasks so that a slow peer
/// never blocks the caller. Any `AsyncRead`/`AsyncWrite` pair works, which is
/// how tests drive the client through in-memory pipes.
#[derive(Debug)]
pub struct StdioTransport {
    /// Queue feeding the writer task
    outgoing: Option<mpsc::UnboundedSender<String>>,

    /// Chunks produced by the reader task
    incoming: Option<mpsc::UnboundedReceiver<String>>,

    connected: bool,
}

/// Bytes read from the peer that do not yet form complete UTF-8 sequences
struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    fn new() -> Self {
        Self {
            pending: Vec::with_capacity(PENDING_BYTES_CAPACITY),
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Take the longest prefix that is valid UTF-8
    ///
    /// A trailing incomplete multi-byte sequence stays buffered until the
    /// rest of it arrives. Bytes that can never decode are replaced one for
    /// one with `?`, keeping byte offsets and Content-Length intact.
    fn take_valid(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }

        let valid_up_to = loop {
            let error = match std::str::from_utf8(&self.pending).map(str::len) {
                Ok(len) => break len,
                Err(e) => e,
            };
            let Some(invalid_len) = error.error_len() else {
                break error.valid_up_to();
            };

            let start = error.valid_up_to();
            warn!(
                "StdioTransport: replacing {} invalid UTF-8 byte(s) at offset {}",
                invalid_len, start
            );
            self.pending[start..start + invalid_len].fill(INVALID_BYTE_REPLACEMENT);
        };
        if valid_up_to == 0 {
            return None;
        }

        let bytes: Vec<u8> = self.pending.drain(..valid_up_to).collect();
        if self.pending.capacity() > PENDING_BYTES_CAPACITY * 2 {
            self.pending.shrink_to(PENDING_BYTES_CAPACITY);
        }
        String::from_utf8(bytes).ok()
    }
}

impl StdioTransport {
    /// Create a transport and spawn its reader and writer tasks
    pub fn new<W, R>(writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();

        tokio::spawn(Self::writer_task(writer, outgoing_rx));
        tokio::spawn(Self::reader_task(reader, incoming_tx));

        Self {
            outgoing: Some(outgoing),
            incoming: Some(incoming),
            connected: true,
        }
    }

    /// Drains the outgoing queue into the writer
    ///
    /// Exits once every sender is dropped, after writing whatever was
    /// already queued. Dropping the writer closes the server's stdin.
    async fn writer_task<W>(mut writer: W, mut queue: mpsc::UnboundedReceiver<String>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(chunk) = queue.recv().await {
            trace!("StdioTransport: writing {} bytes", chunk.len());

            if let Err(e) = writer.write_all(chunk.as_bytes()).await {
                error!("Failed to write to server stdin: {}", e);
                break;
            }
            if let Err(e) = writer.flush().await {
                error!("Failed to flush server stdin: {}", e);
                break;
            }
        }

        let _ = writer.shutdown().await;
        trace!("StdioTransport: writer task finished");
    }

    /// Forwards UTF-8 safe chunks of the reader to the incoming queue
    async fn reader_task<R>(reader: R, sink: mpsc::UnboundedSender<String>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut reader = BufReader::new(reader);
        let mut accumulator = Utf8Accumulator::new();
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];

        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => {
                    trace!("StdioTransport: server stdout reached EOF");
                    if let Some(rest) = accumulator.take_valid() {
                        let _ = sink.send(rest);
                    }
                    if !accumulator.pending.is_empty() {
                        error!(
                            "StdioTransport: {} undecodable bytes left at EOF",
                            accumulator.pending.len()
                        );
                    }
                    break;
                }
                Ok(n) => {
                    accumulator.push(&chunk[..n]);
                    while let Some(text) = accumulator.take_valid() {
                        if sink.send(text).is_err() {
                            trace!("StdioTransport: receiver dropped, stopping reader");
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to read from server stdout: {}", e);
                    break;
                }
            }
        }

        trace!("StdioTransport: reader task finished");
    }
}

#[async_trait]
impl Transport for StdioTransport {
    type Error = StdioTransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(StdioTransportError::Disconnected);
        }

        self.outgoing
            .as_ref()
            .ok_or(StdioTransportError::Disconnected)?
            .send(message.to_string())
            .map_err(|e| StdioTransportError::Channel(e.to_string()))
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(StdioTransportError::Disconnected);
        }

        self.incoming
            .as_mut()
            .ok_or(StdioTransportError::Disconnected)?
            .recv()
            .await
            .ok_or(StdioTransportError::Disconnected)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        self.outgoing.take();
        self.incoming.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Mock Transport
// ============================================================================

/// Error type for mock transport
#[derive(Debug, thiserror::Error)]
pub enum MockTransportError {
    #[error("Transport is disconnected")]
    Disconnected,
    #[error("No more scripted chunks available")]
    Exhausted,
}

/// Scripted transport for unit tests
///
/// Records everything sent and replays a fixed list of inbound chunks.
#[derive(Debug, Default)]
pub struct MockTransport {
    sent: Arc<Mutex<Vec<String>>>,
    inbound: VecDeque<String>,
    closed: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock that yields `chunks` in order from `receive()`
    pub fn with_inbound(chunks: Vec<String>) -> Self {
        Self {
            inbound: chunks.into(),
            ..Self::default()
        }
    }

    /// Shared view of the sent chunks, usable after the mock is moved
    pub fn sent_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.sent)
    }

    pub fn sent_messages(&self) -> Vec<String> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        if self.closed {
            return Err(MockTransportError::Disconnected);
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message.to_string());
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if self.closed {
            return Err(MockTransportError::Disconnected);
        }
        self.inbound.pop_front().ok_or(MockTransportError::Exhausted)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.closed = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stdio_transport_over_duplex() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (mut server_read, mut server_write) = tokio::io::split(server_io);

        let mut transport = StdioTransport::new(client_write, client_read);

        transport.send("ping").await.unwrap();
        let mut buf = [0u8; 4];
        server_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server_write.write_all(b"pong").await.unwrap();
        let received = transport.receive().await.unwrap();
        assert_eq!(received, "pong");

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        assert!(transport.send("late").await.is_err());
    }

    #[tokio::test]
    async fn test_stdio_transport_reports_eof() {
        let (client_io, server_io) = tokio::io::duplex(64);
        let (client_read, client_write) = tokio::io::split(client_io);
        let mut transport = StdioTransport::new(client_write, client_read);

        drop(server_io);

        assert!(matches!(
            transport.receive().await,
            Err(StdioTransportError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_mock_transport_records_and_replays() {
        let mut transport = MockTransport::with_inbound(vec!["a".to_string(), "b".to_string()]);

        transport.send("one").await.unwrap();
        transport.send("two").await.unwrap();
        assert_eq!(transport.sent_messages(), vec!["one", "two"]);

        assert_eq!(transport.receive().await.unwrap(), "a");
        assert_eq!(transport.receive().await.unwrap(), "b");
        assert!(matches!(
            transport.receive().await,
            Err(MockTransportError::Exhausted)
        ));

        transport.close().await.unwrap();
        assert!(transport.send("three").await.is_err());
    }

    #[test]
    fn test_accumulator_holds_split_code_point() {
        let mut acc = Utf8Accumulator::new();

        acc.push(&[0xE4, 0xB8]);
        assert!(acc.take_valid().is_none());

        acc.push(&[0x96]);
        assert_eq!(acc.take_valid().as_deref(), Some("世"));
        assert!(acc.pending.is_empty());
    }

    #[test]
    fn test_accumulator_releases_valid_prefix() {
        let mut acc = Utf8Accumulator::new();

        acc.push(b"key: ");
        acc.push(&[0xF0, 0x9F]);
        assert_eq!(acc.take_valid().as_deref(), Some("key: "));
        assert!(acc.take_valid().is_none());

        acc.push(&[0x8C, 0x8D]);
        assert_eq!(acc.take_valid().as_deref(), Some("🌍"));
    }

    #[test]
    fn test_accumulator_replaces_invalid_bytes() {
        let mut acc = Utf8Accumulator::new();

        acc.push(b"a\xFFb\xC3(c");
        assert_eq!(acc.take_valid().as_deref(), Some("a?b?(c"));
        assert!(acc.pending.is_empty());

        acc.push(&[0xFF, 0xE4, 0xB8]);
        assert_eq!(acc.take_valid().as_deref(), Some("?"));
        assert_eq!(acc.pending, vec![0xE4, 0xB8]);
    }
}
