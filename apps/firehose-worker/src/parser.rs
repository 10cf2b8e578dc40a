use crate::error::StreamError;
use serde_json::Value as JsonValue;

const SSE_DATA_PREFIX: &[u8] = b"data:";

/// Splits an arbitrarily chunked byte stream into newline-terminated lines.
///
/// The only state is the trailing fragment of the last chunk. One splitter
/// lives per upstream connection and is dropped with it.
#[derive(Debug)]
pub struct LineSplitter {
    buffer: Vec<u8>,
    max_buffered: usize,
}

impl LineSplitter {
    pub fn new(max_buffered: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_buffered: max_buffered.max(1),
        }
    }

    /// Appends `chunk` and returns every line it completed, without the separator.
    ///
    /// Fails when the unterminated remainder grows past the configured cap; the
    /// buffer is reset before returning so the splitter never holds more than that.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, StreamError> {
        let mut scan_from = self.buffer.len();
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut line_start = 0;
        while let Some(offset) = self.buffer[scan_from..].iter().position(|b| *b == b'\n') {
            let end = scan_from + offset;
            lines.push(self.buffer[line_start..end].to_vec());
            line_start = end + 1;
            scan_from = line_start;
        }
        if line_start > 0 {
            self.buffer.drain(..line_start);
        }

        if self.buffer.len() > self.max_buffered {
            let buffered = self.buffer.len();
            self.buffer = Vec::new();
            return Err(StreamError::LineBufferOverflow {
                buffered,
                limit: self.max_buffered,
            });
        }
        Ok(lines)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Cheap substring check run before JSON parsing. An empty filter accepts everything.
pub fn passes_line_filter(line: &[u8], filter: &str) -> bool {
    let needle = filter.as_bytes();
    if needle.is_empty() {
        return true;
    }
    line.windows(needle.len()).any(|window| window == needle)
}

/// Decodes one candidate line into a JSON object.
///
/// Blank lines, keep-alives and anything that is not a JSON object yield `None`.
/// SSE framing (`data: {...}`) and `\r\n` endings are accepted.
pub fn decode_line(line: &[u8]) -> Option<JsonValue> {
    let mut payload = line.trim_ascii();
    if let Some(rest) = payload.strip_prefix(SSE_DATA_PREFIX) {
        payload = rest.trim_ascii();
    }
    if payload.first() != Some(&b'{') {
        return None;
    }

    let mut owned = payload.to_vec();
    match simd_json::serde::from_slice::<JsonValue>(&mut owned) {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) => None,
        Err(err) => {
            tracing::trace!(error = %err, "dropping malformed upstream line");
            None
        }
    }
}
