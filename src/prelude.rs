//! Commonly used exports.

pub use crate::agent::{RunHandle, RunRequest, TurnRunner};
pub use crate::client::{ChatSession, HttpRunTransport, RunTransport, SubmitOutcome};
pub use crate::config::KestrelConfig;
pub use crate::error::{KestrelError, Result};
pub use crate::provider::{ModelProvider, ProviderFactory, TurnDelta, TurnRequest};
pub use crate::tools::{AnalystTool, Tool, ToolDispatcher};
pub use crate::types::{
    Conversation, ConversationId, ConversationMode, EventPayload, InfoPayload, ModelId,
    ModelMessage, RunId, RunStatus, StreamEvent, TokenCounts, TranscriptMessage,
};
pub use crate::wire::{decode_stream, encode_frame, SseDecoder};
