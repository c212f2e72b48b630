//! Model provider seam.
//!
//! Concrete network providers are external collaborators; the run loop only
//! depends on [`ModelProvider`] and reaches implementations through a
//! [`ProviderFactory`], which is also the seam the retry gateway switches
//! across when it falls back to a secondary model.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::KestrelError;
use crate::types::{ConversationMode, ModelId, ModelMessage, ToolCall};

/// Tool definition advertised to the provider API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A request for one model turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub messages: Vec<ModelMessage>,
    pub mode: ConversationMode,
    pub tools: Vec<ToolDefinition>,
}

/// Type of delta emitted while a turn streams.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnEventType {
    /// Incremental answer text.
    TextDelta,
    /// Tool call being assembled.
    ToolCallDelta,
    /// Turn finished.
    Done,
    /// Error during the stream.
    Error,
}

/// Why a turn stopped, reported on the final delta.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Error,
}

/// A delta emitted during a streaming turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDelta {
    /// The incremental text chunk.
    pub text: String,
    /// Delta type.
    pub event_type: TurnEventType,
    /// Tool call carried by a `ToolCallDelta`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    /// Finish reason (only on the final delta).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

impl TurnDelta {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            event_type: TurnEventType::TextDelta,
            tool_call: None,
            finish_reason: None,
        }
    }

    pub fn tool_call(call: ToolCall) -> Self {
        Self {
            text: String::new(),
            event_type: TurnEventType::ToolCallDelta,
            tool_call: Some(call),
            finish_reason: None,
        }
    }

    pub fn done(finish_reason: FinishReason) -> Self {
        Self {
            text: String::new(),
            event_type: TurnEventType::Done,
            tool_call: None,
            finish_reason: Some(finish_reason),
        }
    }

    /// Final delta carrying a complete, non-streamed answer text. Used by
    /// providers whose terminal frame repeats the full response; the run
    /// loop falls back to it when zero text deltas were streamed.
    pub fn done_with_text(finish_reason: FinishReason, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            event_type: TurnEventType::Done,
            tool_call: None,
            finish_reason: Some(finish_reason),
        }
    }
}

/// Stream of deltas for one model turn.
pub type TurnStream = BoxStream<'static, Result<TurnDelta, KestrelError>>;

/// Core trait implemented by model providers.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name, for diagnostics.
    fn provider_name(&self) -> &str;

    /// The model this provider instance serves.
    fn model_id(&self) -> &ModelId;

    /// Open a streaming turn.
    async fn stream_turn(&self, request: &TurnRequest) -> Result<TurnStream, KestrelError>;
}

/// Constructs providers by model id.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, model: &ModelId) -> Result<Arc<dyn ModelProvider>, KestrelError>;
}
