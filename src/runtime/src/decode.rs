//! Incremental decoding of newline-delimited build messages.
//!
//! Response chunks arrive with arbitrary boundaries, so a message may be split
//! across several chunks or several messages may share one. The decoder keeps
//! the buffered bytes between calls and hands out one message at a time, so a
//! consumer that stops at the first failure never sees lines past it.

use futures::StreamExt;
use kiln_core::error::{KilnError, Result};
use kiln_core::message::BuildMessage;

use crate::engine::{ByteStream, MessageStream};

/// Splits a byte stream into lines and decodes each line as a [`BuildMessage`].
#[derive(Debug, Default)]
pub struct MessageDecoder {
    /// Bytes received but not yet decoded
    pending: Vec<u8>,
    /// Number of lines consumed so far, blank ones included
    lines: usize,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a chunk of response bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Decode the next complete line, skipping blank ones.
    ///
    /// Returns `None` once no complete line is buffered.
    pub fn next_message(&mut self) -> Option<Result<BuildMessage>> {
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.lines += 1;
            if let Some(decoded) = self.decode_line(&line) {
                return Some(decoded);
            }
        }
        None
    }

    /// Decode whatever remains after the input ends without a final newline.
    ///
    /// Call after [`next_message`](Self::next_message) has returned `None`.
    pub fn finish(&mut self) -> Option<Result<BuildMessage>> {
        let line = std::mem::take(&mut self.pending);
        if trim_ascii(&line).is_empty() {
            return None;
        }
        self.lines += 1;
        self.decode_line(&line)
    }

    /// Number of lines consumed so far.
    pub fn lines(&self) -> usize {
        self.lines
    }

    fn decode_line(&self, line: &[u8]) -> Option<Result<BuildMessage>> {
        let trimmed = trim_ascii(line);
        if trimmed.is_empty() {
            return None;
        }
        Some(self.parse(trimmed))
    }

    fn parse(&self, line: &[u8]) -> Result<BuildMessage> {
        let value: serde_json::Value =
            serde_json::from_slice(line).map_err(|e| KilnError::DecodeError {
                line: self.lines,
                reason: e.to_string(),
            })?;
        if !value.is_object() {
            return Err(KilnError::DecodeError {
                line: self.lines,
                reason: format!("expected a JSON object, got {}", value),
            });
        }

        serde_json::from_value(value).map_err(|e| KilnError::DecodeError {
            line: self.lines,
            reason: e.to_string(),
        })
    }
}

/// Decode a raw response body into messages, lazily.
///
/// A chunk is only pulled from `bytes` once every message buffered so far
/// has been handed out. A transport error ends the stream after it is
/// yielded.
pub fn decode_stream(bytes: ByteStream<'_>) -> MessageStream<'_> {
    let state = (bytes, MessageDecoder::new(), false);
    futures::stream::unfold(state, |(mut bytes, mut decoder, mut ended)| async move {
        loop {
            if let Some(decoded) = decoder.next_message() {
                return Some((decoded, (bytes, decoder, ended)));
            }
            if ended {
                return None;
            }
            match bytes.next().await {
                Some(Ok(chunk)) => decoder.push(&chunk),
                Some(Err(e)) => return Some((Err(e), (bytes, MessageDecoder::new(), true))),
                None => {
                    ended = true;
                    if let Some(decoded) = decoder.finish() {
                        return Some((decoded, (bytes, decoder, ended)));
                    }
                }
            }
        }
    })
    .boxed()
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}
