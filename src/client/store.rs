//! Durable, ordered transcript of conversation messages.

use uuid::Uuid;

use crate::types::{ConversationId, Role, RunId, TranscriptMessage};

/// Append-only transcript keyed by backend-assigned identifiers.
///
/// The assistant message of the active run is the sole mutation target for
/// streamed content; once the run terminates its linkage is cleared and no
/// further mutation of it occurs.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<TranscriptMessage>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[TranscriptMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append the user message (locally-held content) and the empty
    /// assistant message for a freshly created run.
    pub fn begin_run(
        &mut self,
        conversation_id: ConversationId,
        run_id: RunId,
        user_message_id: impl Into<String>,
        assistant_message_id: impl Into<String>,
        user_text: impl Into<String>,
    ) {
        let mut user = TranscriptMessage::new(
            user_message_id,
            Some(conversation_id),
            Role::User,
            user_text,
        );
        user.run_id = Some(run_id);
        self.messages.push(user);

        let mut assistant =
            TranscriptMessage::new(assistant_message_id, Some(conversation_id), Role::Assistant, "");
        assistant.run_id = Some(run_id);
        self.messages.push(assistant);
    }

    /// Project the run buffer's current text into the assistant message.
    pub fn project_partial(&mut self, run_id: RunId, text: &str) {
        if let Some(message) = self.assistant_for_run_mut(run_id) {
            message.content = text.to_string();
        }
    }

    /// Finalize the assistant message and clear its run linkage.
    pub fn finalize(&mut self, run_id: RunId, final_text: String) {
        if let Some(message) = self.assistant_for_run_mut(run_id) {
            message.content = final_text;
            message.run_id = None;
        }
        self.clear_run_linkage(run_id);
    }

    /// Record a run failure on the assistant message, preserving any
    /// streamed text. Returns `false` if the run has no assistant message
    /// yet (it failed before `message_created`).
    pub fn fail_run(&mut self, run_id: RunId, reason: &str) -> bool {
        let Some(message) = self.assistant_for_run_mut(run_id) else {
            return false;
        };
        if message.content.is_empty() {
            message.content = reason.to_string();
        } else {
            message.content.push_str("\n\n");
            message.content.push_str(reason);
        }
        message.error = Some(reason.to_string());
        message.run_id = None;
        self.clear_run_linkage(run_id);
        true
    }

    /// Append a transient system notice (retry/fallback advisories,
    /// watchdog diagnostics). Not part of the analytical transcript.
    pub fn push_notice(&mut self, conversation_id: Option<ConversationId>, text: impl Into<String>) {
        let mut notice = TranscriptMessage::new(
            format!("notice-{}", Uuid::new_v4()),
            conversation_id,
            Role::System,
            text,
        );
        notice.transient = true;
        self.messages.push(notice);
    }

    /// Detach a run from its messages without touching content. Used on
    /// consumer-initiated aborts, where streamed text stays as-is.
    pub fn release_run(&mut self, run_id: RunId) {
        self.clear_run_linkage(run_id);
    }

    /// Discard everything. Used when the backend no longer recognizes the
    /// conversation.
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn assistant_for_run(&self, run_id: RunId) -> Option<&TranscriptMessage> {
        self.messages
            .iter()
            .find(|m| m.role == Role::Assistant && m.run_id == Some(run_id))
    }

    fn assistant_for_run_mut(&mut self, run_id: RunId) -> Option<&mut TranscriptMessage> {
        self.messages
            .iter_mut()
            .find(|m| m.role == Role::Assistant && m.run_id == Some(run_id))
    }

    fn clear_run_linkage(&mut self, run_id: RunId) {
        for message in &mut self.messages {
            if message.run_id == Some(run_id) {
                message.run_id = None;
            }
        }
    }
}
