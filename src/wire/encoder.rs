//! Event stream encoder (server-sent event framing).

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

use crate::error::KestrelError;
use crate::types::StreamEvent;

/// Serialize one event as a named SSE frame.
///
/// The frame carries the event name, the sequence number as the SSE id, and
/// the full envelope as the data payload:
///
/// ```text
/// event: token
/// id: 3
/// data: {"run_id":"…","seq":3,"timestamp":"…","type":"token","delta":"Your"}
/// ```
pub fn encode_frame(event: &StreamEvent) -> Result<Bytes, KestrelError> {
    let data = serde_json::to_string(event)?;
    let mut frame = String::with_capacity(data.len() + 48);
    frame.push_str("event: ");
    frame.push_str(event.event_name());
    frame.push('\n');
    frame.push_str("id: ");
    frame.push_str(&event.seq.to_string());
    frame.push('\n');
    frame.push_str("data: ");
    frame.push_str(&data);
    frame.push_str("\n\n");
    Ok(Bytes::from(frame.into_bytes()))
}

/// Adapt a run's event stream into wire frames for a serving layer.
pub fn encode_stream(
    events: impl Stream<Item = StreamEvent> + Send + 'static,
) -> BoxStream<'static, Result<Bytes, KestrelError>> {
    let framed = async_stream::stream! {
        let mut inner = std::pin::pin!(events);
        while let Some(event) = inner.next().await {
            yield encode_frame(&event);
        }
    };
    Box::pin(framed)
}
