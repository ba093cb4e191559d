//! Incremental server-sent-events decoder.
//!
//! Bytes arrive in arbitrary chunks. Complete lines are split on `\n`
//! (a trailing `\r` is dropped), `data:` lines accumulate, and a blank line
//! dispatches the accumulated data as one [`StreamFrame::Data`]. Comment
//! lines (`:` prefix) surface as [`StreamFrame::KeepAlive`]. The `event`,
//! `id` and `retry` fields are accepted and ignored.

use crate::backend::StreamFrame;
use crate::error::{StreamError, StreamResult};

/// Longest line accepted by default, in bytes.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Stateful decoder; feed it chunks in order.
#[derive(Debug)]
pub struct SseDecoder {
    pending: Vec<u8>,
    data: Option<String>,
    max_line: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            data: None,
            max_line: MAX_LINE_BYTES,
        }
    }
}

impl SseDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the longest accepted line.
    #[must_use]
    pub const fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }

    /// Feed one chunk and return every frame it completes.
    ///
    /// An unterminated line longer than the limit is discarded along with
    /// any partial event, and reported as [`StreamError::MalformedFrame`]
    /// after the frames completed by this chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamResult<StreamFrame>> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let mut line = &self.pending[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            if let Some(frame) = self.process_line(&line) {
                frames.push(Ok(frame));
            }
            start = end + 1;
        }
        self.pending.drain(..start);

        if self.pending.len() > self.max_line {
            self.pending.clear();
            self.data = None;
            frames.push(Err(StreamError::MalformedFrame(format!(
                "line exceeds {} bytes",
                self.max_line
            ))));
        }
        frames
    }

    /// Bytes buffered without a terminating newline.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn process_line(&mut self, line: &str) -> Option<StreamFrame> {
        if line.is_empty() {
            return self.data.take().map(StreamFrame::Data);
        }
        if line.starts_with(':') {
            return Some(StreamFrame::KeepAlive);
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            }
        }
        None
    }
}
