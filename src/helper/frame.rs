//! Content-Length framing
//!
//! The helper speaks length-prefixed JSON over a byte stream:
//! `Content-Length: <n>\r\n\r\n<n bytes of payload>`. The decoder owns an
//! accumulation buffer, so frames may arrive split at any byte boundary,
//! including inside a multi-byte UTF-8 sequence, and multiple frames may
//! arrive in one read.

use tracing::warn;

/// Frames read per `drain_batch` call before yielding back to the runtime.
pub const BATCH_LIMIT: usize = 16;

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

/// Encode one payload with its framing header.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("Content-Length: {}\r\n\r\n", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out
}

/// Locate the header/payload separator: `\r\n\r\n`, or a bare `\n\n` from
/// less careful peers. Returns (header_end, payload_start).
fn find_separator(buf: &[u8]) -> Option<(usize, usize)> {
    for i in 0..buf.len() {
        if buf[i..].starts_with(b"\r\n\r\n") {
            return Some((i, i + 4));
        }
        if buf[i..].starts_with(b"\n\n") {
            return Some((i, i + 2));
        }
    }
    None
}

fn parse_content_len(header: &[u8]) -> Option<usize> {
    let header = std::str::from_utf8(header).ok()?;
    for line in header.lines() {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case("content-length") {
            return value.trim().parse().ok();
        }
    }
    None
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly read bytes to the accumulation buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete payload, if the buffer holds one.
    ///
    /// A malformed header is skipped past its separator so one bad frame
    /// cannot wedge the stream.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let (header_end, payload_start) = find_separator(&self.buf)?;
            let Some(len) = parse_content_len(&self.buf[..header_end]) else {
                warn!(
                    "discarding malformed frame header: {:?}",
                    String::from_utf8_lossy(&self.buf[..header_end])
                );
                self.buf.drain(..payload_start);
                continue;
            };
            if self.buf.len() < payload_start + len {
                return None;
            }
            let payload = self.buf[payload_start..payload_start + len].to_vec();
            self.buf.drain(..payload_start + len);
            return Some(payload);
        }
    }

    /// Decode up to `BATCH_LIMIT` frames. The caller should yield to the
    /// runtime between batches when `has_more` still holds.
    pub fn drain_batch(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while out.len() < BATCH_LIMIT {
            match self.next_frame() {
                Some(frame) => out.push(frame),
                None => break,
            }
        }
        out
    }

    /// Could another complete frame already be buffered?
    pub fn has_more(&self) -> bool {
        match find_separator(&self.buf) {
            Some((header_end, payload_start)) => match parse_content_len(&self.buf[..header_end]) {
                Some(len) => self.buf.len() >= payload_start + len,
                // Malformed header: next_frame will consume it.
                None => true,
            },
            None => false,
        }
    }
}
