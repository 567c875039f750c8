//! Client-side view of open documents
//!
//! Every update replaces the whole text. Versions are local to this client
//! and only exist to satisfy `textDocument/didChange`.

use lsp_types::{Position, Range, TextDocumentContentChangeEvent, Uri};
use std::collections::HashMap;

/// The client's belief about one open file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedDocument {
    pub uri: Uri,
    pub language_id: String,
    /// Starts at 1, incremented on every update
    pub version: i32,
    pub text: String,
}

impl TrackedDocument {
    pub fn new(uri: Uri, language_id: String, text: String) -> Self {
        Self {
            uri,
            language_id,
            version: 1,
            text,
        }
    }

    /// Number of lines, counting a trailing empty line after a final break
    pub fn line_count(&self) -> usize {
        last_line(&self.text).0 + 1
    }

    /// Range covering the whole current text
    ///
    /// The end character is measured in UTF-16 code units, the protocol's
    /// default position encoding.
    pub fn full_range(&self) -> Range {
        let (line, text) = last_line(&self.text);
        Range {
            start: Position::new(0, 0),
            end: Position::new(line as u32, text.encode_utf16().count() as u32),
        }
    }
}

/// Index and content of the last line
///
/// `\r\n`, `\r` and `\n` each end a line.
fn last_line(text: &str) -> (usize, &str) {
    let bytes = text.as_bytes();
    let mut line = 0;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\n' => {
                line += 1;
                start = i + 1;
            }
            b'\r' => {
                if bytes.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
                line += 1;
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    (line, &text[start..])
}

/// Open documents keyed by URI
#[derive(Debug, Default)]
pub struct DocumentStore {
    documents: HashMap<Uri, TrackedDocument>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a document at version 1, replacing any previous entry
    pub fn open(&mut self, uri: Uri, language_id: String, text: String) -> &TrackedDocument {
        let document = TrackedDocument::new(uri.clone(), language_id, text);
        self.documents.insert(uri.clone(), document);
        &self.documents[&uri]
    }

    /// Replace the text of a tracked document
    ///
    /// Returns the new version and the change event describing the
    /// replacement of the previous content, or `None` if `uri` is untracked.
    pub fn update(
        &mut self,
        uri: &Uri,
        text: String,
    ) -> Option<(i32, TextDocumentContentChangeEvent)> {
        let document = self.documents.get_mut(uri)?;
        let change = TextDocumentContentChangeEvent {
            range: Some(document.full_range()),
            range_length: None,
            text: text.clone(),
        };
        document.version += 1;
        document.text = text;
        Some((document.version, change))
    }

    pub fn close(&mut self, uri: &Uri) -> Option<TrackedDocument> {
        self.documents.remove(uri)
    }

    pub fn get(&self, uri: &Uri) -> Option<&TrackedDocument> {
        self.documents.get(uri)
    }

    pub fn uris(&self) -> Vec<Uri> {
        self.documents.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.documents.clear();
    }
}
