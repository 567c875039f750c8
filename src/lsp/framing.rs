//! LSP message framing
//!
//! Wraps a raw [`Transport`] so that each `send`/`receive` carries exactly
//! one JSON-RPC message body:
//!
//! ```text
//! Content-Length: <bytes>\r\n
//! \r\n
//! <body>
//! ```

use crate::io::transport::Transport;
use async_trait::async_trait;
use std::collections::VecDeque;
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum LspFramingError<T: std::error::Error + Send + Sync + 'static> {
    #[error("Transport error: {0}")]
    Transport(T),

    #[error("Invalid LSP message format: {0}")]
    InvalidFormat(String),

    #[error("Invalid content length: {0}")]
    InvalidContentLength(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Upper bound on a single message body
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_TERMINATOR: &str = "\r\n\r\n";

/// Content-Length framing over any transport
pub struct LspFraming<T: Transport> {
    transport: T,

    /// Raw text received but not yet split into messages
    receive_buffer: String,

    /// Complete message bodies not yet handed out
    ready: VecDeque<String>,
}

impl<T: Transport> LspFraming<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            receive_buffer: String::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Frame a message body with its header
    pub fn frame(body: &str) -> String {
        format!("Content-Length: {}{}{}", body.len(), HEADER_TERMINATOR, body)
    }

    /// Split one complete message off the front of the buffer, if present
    fn try_parse_message(&mut self) -> Result<Option<String>, LspFramingError<T::Error>> {
        let Some(header_end) = self.receive_buffer.find(HEADER_TERMINATOR) else {
            return Ok(None);
        };

        let content_length = parse_content_length(&self.receive_buffer[..header_end])?;
        let body_start = header_end + HEADER_TERMINATOR.len();
        let available = self.receive_buffer.len() - body_start;

        if available < content_length {
            trace!(
                "LspFraming: waiting for {} more bytes",
                content_length - available
            );
            return Ok(None);
        }

        let body_end = body_start + content_length;
        let body = self
            .receive_buffer
            .get(body_start..body_end)
            .ok_or_else(|| {
                LspFramingError::InvalidFormat(
                    "Content-Length does not end on a character boundary".to_string(),
                )
            })?
            .to_string();
        self.receive_buffer.drain(..body_end);

        trace!("LspFraming: parsed message ({} bytes)", content_length);
        Ok(Some(body))
    }
}

/// Read the Content-Length value out of a header block
///
/// Other headers (`Content-Type`) are accepted and ignored.
fn parse_content_length<E>(header: &str) -> Result<usize, LspFramingError<E>>
where
    E: std::error::Error + Send + Sync + 'static,
{
    for line in header.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("Content-Length") {
            continue;
        }

        let value = value.trim();
        let length = value
            .parse::<usize>()
            .map_err(|_| LspFramingError::InvalidContentLength(value.to_string()))?;
        if length > MAX_MESSAGE_SIZE {
            return Err(LspFramingError::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            });
        }
        return Ok(length);
    }

    Err(LspFramingError::InvalidFormat(
        "Missing Content-Length header".to_string(),
    ))
}

#[async_trait]
impl<T: Transport> Transport for LspFraming<T> {
    type Error = LspFramingError<T::Error>;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        trace!("LspFraming: sending message ({} bytes)", message.len());
        self.transport
            .send(&Self::frame(message))
            .await
            .map_err(LspFramingError::Transport)
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        loop {
            if let Some(message) = self.ready.pop_front() {
                return Ok(message);
            }

            let chunk = self
                .transport
                .receive()
                .await
                .map_err(LspFramingError::Transport)?;
            self.receive_buffer.push_str(&chunk);

            while let Some(message) = self.try_parse_message()? {
                self.ready.push_back(message);
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.transport
            .close()
            .await
            .map_err(LspFramingError::Transport)
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}
