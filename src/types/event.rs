//! Wire event types.
//!
//! Event names and payload shapes are a compatibility contract: adding a
//! field is safe, renaming or removing one is a breaking change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::conversation::ConversationId;
use super::run::{RunId, TokenCounts};
use super::ModelId;

/// Envelope for one wire event.
///
/// Sequence numbers start at 1 for a run's first event and increase by
/// exactly one per event; the payload is immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamEvent {
    pub run_id: RunId,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl StreamEvent {
    /// The wire name of this event.
    pub fn event_name(&self) -> &'static str {
        self.payload.event_name()
    }

    /// Whether this event terminates its run.
    pub fn is_terminal(&self) -> bool {
        matches!(self.payload, EventPayload::Done { .. } | EventPayload::Error { .. })
    }
}

/// One tagged variant per wire event type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Start {
        conversation_id: ConversationId,
        run_id: RunId,
    },
    MessageCreated {
        user_message_id: String,
        assistant_message_id: String,
        conversation_id: ConversationId,
        run_id: RunId,
    },
    Token {
        delta: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        tool_args: serde_json::Value,
    },
    ToolResult {
        tool_call_id: String,
        result: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
    Info {
        #[serde(flatten)]
        info: InfoPayload,
    },
    Done {
        final_text: String,
        tool_calls_count: u32,
        token_counts: TokenCounts,
    },
    Error {
        message: String,
    },
}

impl EventPayload {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::MessageCreated { .. } => "message_created",
            Self::Token { .. } => "token",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Info { .. } => "info",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}

/// Advisory payloads describing internal retry/fallback activity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "info_type", rename_all = "snake_case")]
pub enum InfoPayload {
    RetryScheduled {
        attempt: u32,
        max_attempts: u32,
        retry_in_ms: u64,
    },
    ModelSwitch {
        from: ModelId,
        to: ModelId,
        attempt: u32,
    },
}

impl InfoPayload {
    /// Human-readable description, used by the client for transient notices.
    pub fn describe(&self) -> String {
        match self {
            Self::RetryScheduled {
                attempt,
                max_attempts,
                retry_in_ms,
            } => format!(
                "Connection hiccup — retrying (attempt {attempt} of {max_attempts}) in {}s",
                *retry_in_ms as f64 / 1000.0
            ),
            Self::ModelSwitch { from, to, .. } => {
                format!("Switched from {from} to {to} to keep your analysis moving")
            }
        }
    }
}
