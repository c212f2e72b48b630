//! Wire protocol: SSE framing of the run event stream.

pub mod decoder;
pub mod encoder;

pub use decoder::{decode_stream, SseDecoder};
pub use encoder::{encode_frame, encode_stream};
