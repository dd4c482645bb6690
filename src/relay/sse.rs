//! Incremental parser for the relay's blank-line delimited event stream.
//!
//! Each chunk may carry several `field: value` lines; only `data:` lines
//! are used. Multiple `data:` lines are joined with `\n`. Bytes are
//! buffered until a chunk is complete, so multi-byte characters split
//! across network reads decode correctly. A partial chunk that grows past
//! [`MAX_CHUNK_BYTES`] is discarded up to its terminating blank line.

use serde_json::Value;
use tracing::{debug, warn};

/// Largest partial chunk held while waiting for its blank line.
pub const MAX_CHUNK_BYTES: usize = 1_048_576;

/// Buffers raw bytes and yields decoded `data:` payloads.
#[derive(Debug, Default)]
pub struct SseChunkParser {
    buffer: Vec<u8>,
    /// Set while skipping the rest of an oversized chunk.
    discarding: bool,
}

impl SseChunkParser {
    /// Feed bytes and drain every complete chunk's JSON payload.
    /// Chunks without data, with `[DONE]`, with malformed JSON, or over
    /// [`MAX_CHUNK_BYTES`] are skipped.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Value> {
        self.buffer.extend(bytes.iter().copied().filter(|byte| *byte != b'\r'));
        let mut payloads = Vec::new();

        while let Some(split) = find_blank_line(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..split + 2).collect();
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            let frame = String::from_utf8_lossy(&frame[..split]);

            let Some(data) = extract_data(&frame) else {
                continue;
            };
            if data == "[DONE]" {
                continue;
            }
            match serde_json::from_str::<Value>(&data) {
                Ok(value) => payloads.push(value),
                Err(err) => debug!(%err, "dropping malformed stream chunk"),
            }
        }

        if self.buffer.len() > MAX_CHUNK_BYTES {
            warn!(
                buffered = self.buffer.len(),
                limit = MAX_CHUNK_BYTES,
                "stream chunk too large, discarding"
            );
            let keep_newline = self.buffer.last() == Some(&b'\n');
            self.buffer.clear();
            if keep_newline {
                self.buffer.push(b'\n');
            }
            self.discarding = true;
        }

        payloads
    }

    /// Parse a complete stream body in one call.
    #[must_use]
    pub fn parse_all(input: &str) -> Vec<Value> {
        Self::default().feed(input.as_bytes())
    }

    /// Whether no partial chunk is buffered.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace)
    }
}

fn find_blank_line(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

fn extract_data(frame: &str) -> Option<String> {
    let lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect();

    (!lines.is_empty()).then(|| lines.join("\n"))
}
