//! Conversation identity and mode.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Unique conversation identifier, minted by the backend on the first turn.
pub type ConversationId = Uuid;

/// Response tone/behavior for a conversation.
///
/// Switched by a dedicated synchronous call, never mid-run.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConversationMode {
    /// Direct, numbers-first portfolio analysis.
    #[default]
    Analysis,
    /// Forward-looking allocation and what-if planning.
    Planning,
    /// Explanatory answers that unpack the concepts involved.
    Education,
}

/// A conversation as the protocol sees it: identity, active mode, and an
/// optional page/context payload attached by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub mode: ConversationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_context: Option<serde_json::Value>,
}

impl Conversation {
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            mode: ConversationMode::default(),
            page_context: None,
        }
    }
}
