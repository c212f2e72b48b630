//! Incremental event stream decoder.
//!
//! The transport may deliver partial frames; the decoder buffers raw bytes
//! and yields each event as soon as its frame is complete, in arrival
//! order, without ever holding more than the unfinished tail in memory.

use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

use crate::error::KestrelError;
use crate::types::StreamEvent;

/// Stateful SSE frame decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: BytesMut,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of transport bytes, returning every event whose frame
    /// completed. Malformed frames are skipped and logged, never fatal.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some((end, sep_len)) = find_frame_boundary(&self.buf) {
            let frame = self.buf.split_to(end + sep_len);
            let frame = &frame[..end];
            match parse_frame(frame) {
                Some(event) => events.push(event),
                None => {
                    if !frame.is_empty() {
                        tracing::warn!(
                            frame = %String::from_utf8_lossy(frame),
                            "skipping malformed stream frame"
                        );
                    }
                }
            }
        }

        events
    }

    /// Bytes buffered for a frame that has not completed yet.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

/// Adapt a fallible byte stream into a fallible event stream.
///
/// Transport errors pass through; decoding never fails the stream.
pub fn decode_stream(
    bytes: impl Stream<Item = Result<Bytes, KestrelError>> + Send + 'static,
) -> BoxStream<'static, Result<StreamEvent, KestrelError>> {
    let decoded = async_stream::stream! {
        let mut decoder = SseDecoder::new();
        let mut inner = std::pin::pin!(bytes);
        while let Some(item) = inner.next().await {
            match item {
                Ok(chunk) => {
                    for event in decoder.feed(&chunk) {
                        yield Ok(event);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    };
    Box::pin(decoded)
}

/// Find the end of the first complete frame: offset of the blank-line
/// separator and its length (`\n\n` or `\r\n\r\n`, whichever comes first).
fn find_frame_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Parse one complete frame into an event. Returns `None` for comment-only,
/// empty, or malformed frames.
fn parse_frame(frame: &[u8]) -> Option<StreamEvent> {
    let text = match std::str::from_utf8(frame) {
        Ok(text) => text,
        Err(_) => return None,
    };

    let mut data_lines: Vec<&str> = Vec::new();
    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.strip_prefix(' ').unwrap_or(data));
        }
        // `event:` and `id:` lines are advisory here — the envelope's own
        // `type` tag and `seq` field are authoritative.
    }

    if data_lines.is_empty() {
        return None;
    }

    let data = data_lines.join("\n");
    match serde_json::from_str::<StreamEvent>(&data) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(error = %e, "unrecognized stream event payload");
            None
        }
    }
}
