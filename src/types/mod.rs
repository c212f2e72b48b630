//! Shared types: runs, events, messages, conversations, model identity.

pub mod conversation;
pub mod event;
pub mod message;
pub mod run;

pub use conversation::{Conversation, ConversationId, ConversationMode};
pub use event::{EventPayload, InfoPayload, StreamEvent};
pub use message::{
    ContentPart, ModelMessage, Role, ToolCall, ToolResult, TranscriptMessage,
};
pub use run::{RunId, RunOutcome, RunStatus, TokenCounts};

use serde::{Deserialize, Serialize};

/// Identifier of a servable model, e.g. `"atlas-pro"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ModelId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for ModelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
