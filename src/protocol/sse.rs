//! Incremental server-sent-events framing.
//!
//! Frames end at a blank line. Multiple `data:` lines in one frame are joined
//! with `\n`; comment lines (`:`) and `[DONE]` payloads are skipped.

/// Buffers partial chunks and yields complete `data` payloads.
#[derive(Debug, Default)]
pub struct SseStreamParser {
    buffer: String,
    /// Bytes of a UTF-8 sequence split across chunk boundaries.
    pending: Vec<u8>,
}

impl SseStreamParser {
    /// Feed raw bytes and drain every complete payload.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let valid_up_to = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let complete: Vec<u8> = self.pending.drain(..valid_up_to).collect();
        self.buffer.push_str(&String::from_utf8_lossy(&complete));
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut payloads = Vec::new();
        while let Some(split) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..split + 2).collect();
            if let Some(payload) = frame_payload(&frame) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flush whatever is left once the byte stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.buffer.push_str(&String::from_utf8_lossy(&rest));
        }
        let frame = std::mem::take(&mut self.buffer);
        frame_payload(&frame)
    }

    /// Parse a complete SSE body in one shot.
    pub fn parse_all(input: &str) -> Vec<String> {
        let mut parser = Self::default();
        let mut out = parser.feed(input.as_bytes());
        out.extend(parser.finish());
        out
    }
}

fn frame_payload(frame: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in frame.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            data_lines.push(value);
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    let payload = data_lines.join("\n");
    if payload.trim().is_empty() || payload.trim() == "[DONE]" {
        return None;
    }
    Some(payload)
}
