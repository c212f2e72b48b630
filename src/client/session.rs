//! Client session coordinator.
//!
//! One `ChatSession` owns the transcript store, run buffer, send queue and
//! watchdog behind a single state object; every mutation flows through the
//! event-application path, keyed by run, so nothing else touches run state
//! concurrently.

use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::KestrelConfig;
use crate::error::KestrelError;
use crate::types::{
    Conversation, ConversationMode, EventPayload, RunId, RunStatus, StreamEvent,
    TranscriptMessage,
};
use crate::wire::decode_stream;

use super::buffer::RunBuffer;
use super::queue::SendQueue;
use super::store::MessageStore;
use super::transport::RunTransport;
use super::watchdog::Watchdog;

/// What happened to a submitted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// No run was active; a new run was initiated.
    Started,
    /// A run is in flight; the message waits in the send queue.
    Queued,
}

/// The run currently owned by the session.
#[derive(Debug)]
struct ActiveRun {
    /// Local generation counter guarding against events from a superseded
    /// transport being applied to a newer run.
    epoch: u64,
    run_id: Option<RunId>,
    status: RunStatus,
    buffer: Option<RunBuffer>,
    user_text: String,
    last_seq: Option<u64>,
}

struct SessionState {
    conversation: Option<Conversation>,
    mode: ConversationMode,
    page_context: Option<serde_json::Value>,
    store: MessageStore,
    queue: SendQueue,
    active: Option<ActiveRun>,
    /// A driver task exists and will drain the queue. Guards the window
    /// between a run's terminal event and the driver's next queue pop.
    driving: bool,
    transport_active: bool,
    cancel: Option<CancellationToken>,
    watchdog: Watchdog,
    next_epoch: u64,
}

impl SessionState {
    fn begin_active(&mut self, text: &str) -> u64 {
        self.next_epoch += 1;
        self.active = Some(ActiveRun {
            epoch: self.next_epoch,
            run_id: None,
            status: RunStatus::Pending,
            buffer: None,
            user_text: text.to_string(),
            last_seq: None,
        });
        self.cancel = Some(CancellationToken::new());
        self.next_epoch
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.active.as_ref().is_some_and(|a| a.epoch == epoch)
    }

    /// Apply one decoded event. Returns `true` once the run is terminal
    /// (or the event belongs to a superseded run).
    fn apply_event(&mut self, epoch: u64, event: StreamEvent) -> bool {
        if !self.is_current(epoch) {
            return true;
        }

        if let Some(active) = self.active.as_ref() {
            if let Some(last) = active.last_seq {
                if event.seq != last + 1 {
                    let message =
                        format!("event sequence gap (expected {}, got {})", last + 1, event.seq);
                    tracing::warn!(run_id = %event.run_id, "{message}");
                    self.fail_active(&message);
                    return true;
                }
            }
        }
        if let Some(active) = self.active.as_mut() {
            active.last_seq = Some(event.seq);
        }

        match event.payload {
            EventPayload::Start {
                conversation_id,
                run_id,
            } => {
                if self.conversation.is_none() {
                    let mut conversation = Conversation::new(conversation_id);
                    conversation.mode = self.mode;
                    conversation.page_context = self.page_context.clone();
                    self.conversation = Some(conversation);
                }
                if let Some(active) = self.active.as_mut() {
                    active.run_id = Some(run_id);
                    active.status = RunStatus::Streaming;
                    active.buffer = Some(RunBuffer::new(run_id));
                }
                false
            }
            EventPayload::MessageCreated {
                user_message_id,
                assistant_message_id,
                conversation_id,
                run_id,
            } => {
                let user_text = self
                    .active
                    .as_ref()
                    .map(|a| a.user_text.clone())
                    .unwrap_or_default();
                self.store.begin_run(
                    conversation_id,
                    run_id,
                    user_message_id,
                    assistant_message_id,
                    user_text,
                );
                false
            }
            EventPayload::Token { delta } => {
                let Some(active) = self.active.as_mut() else {
                    return true;
                };
                let (Some(run_id), Some(buffer)) = (active.run_id, active.buffer.as_mut()) else {
                    tracing::warn!("token before start event, ignoring");
                    return false;
                };
                buffer.push(&delta);
                let text = buffer.text().to_string();
                self.store.project_partial(run_id, &text);
                false
            }
            EventPayload::ToolCall { tool_name, .. } => {
                tracing::debug!(tool = %tool_name, "tool call in flight");
                false
            }
            EventPayload::ToolResult {
                tool_call_id,
                is_error,
                ..
            } => {
                tracing::debug!(%tool_call_id, is_error, "tool call resolved");
                false
            }
            EventPayload::Info { info } => {
                let conversation_id = self.conversation.as_ref().map(|c| c.id);
                self.store.push_notice(conversation_id, info.describe());
                false
            }
            EventPayload::Done { final_text, .. } => {
                if let Some(active) = self.active.as_ref() {
                    if let (Some(run_id), Some(buffer)) = (active.run_id, active.buffer.as_ref()) {
                        let resolved = buffer.resolve_final(&final_text);
                        self.store.finalize(run_id, resolved);
                    }
                }
                self.finish_active();
                true
            }
            EventPayload::Error { message } => {
                self.fail_active(&message);
                true
            }
        }
    }

    /// Record a failure on the active run's assistant message, preserving
    /// streamed text, then terminate it.
    fn fail_active(&mut self, reason: &str) {
        let recorded = self
            .active
            .as_ref()
            .and_then(|a| a.run_id)
            .map(|run_id| self.store.fail_run(run_id, reason))
            .unwrap_or(false);
        if !recorded {
            let conversation_id = self.conversation.as_ref().map(|c| c.id);
            self.store.push_notice(conversation_id, reason.to_string());
        }
        self.finish_active();
    }

    /// Transport-level failure: stale conversations reset everything,
    /// anything else fails the active run.
    fn handle_failure(&mut self, err: &KestrelError) {
        if matches!(err, KestrelError::StaleConversation(_)) {
            tracing::warn!(error = %err, "conversation no longer recognized, resetting local state");
            self.store.clear();
            self.conversation = None;
            self.queue.clear();
            self.transport_active = false;
            self.finish_active();
            self.store.push_notice(
                None,
                "This conversation is no longer available. Please resend your message to start a new one.",
            );
        } else {
            self.fail_active(&err.to_string());
        }
    }

    /// Consumer-initiated abort: streamed content stays as-is.
    fn force_abort(&mut self) {
        if let Some(run_id) = self.active.as_ref().and_then(|a| a.run_id) {
            self.store.release_run(run_id);
        }
        self.finish_active();
    }

    /// Watchdog expiry. Returns `true` if the run was force-aborted.
    fn watchdog_fire(&mut self) -> bool {
        self.watchdog.clear_fired();
        let Some(active) = self.active.as_ref() else {
            return false;
        };
        if self.transport_active {
            return false;
        }
        tracing::warn!(
            run_id = ?active.run_id,
            status = ?active.status,
            "run reports streaming with no active transport, forcing abort"
        );
        if let Some(run_id) = active.run_id {
            self.store.release_run(run_id);
        }
        let conversation_id = self.conversation.as_ref().map(|c| c.id);
        self.active = None;
        self.store
            .push_notice(conversation_id, "The response stalled and was abandoned. Please try again.");
        true
    }

    fn finish_active(&mut self) {
        self.watchdog.disarm();
        self.active = None;
    }
}

/// Client-side coordinator for one conversation.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct ChatSession {
    transport: Arc<dyn RunTransport>,
    state: Arc<Mutex<SessionState>>,
    idle_notify: Arc<Notify>,
}

impl ChatSession {
    pub fn new(transport: Arc<dyn RunTransport>, config: KestrelConfig) -> Self {
        Self {
            transport,
            state: Arc::new(Mutex::new(SessionState {
                conversation: None,
                mode: ConversationMode::default(),
                page_context: None,
                store: MessageStore::new(),
                queue: SendQueue::new(),
                active: None,
                driving: false,
                transport_active: false,
                cancel: None,
                watchdog: Watchdog::new(config.watchdog_ceiling),
                next_epoch: 0,
            })),
            idle_notify: Arc::new(Notify::new()),
        }
    }

    /// Submit user input. Initiates a run immediately when none is active;
    /// otherwise the input waits in the send queue and is dispatched, in
    /// order, as runs terminate.
    pub async fn send(&self, text: impl Into<String>) -> SubmitOutcome {
        let text = text.into();
        {
            let mut state = self.state.lock().await;
            if state.active.is_some() || state.driving {
                state.queue.push(text);
                return SubmitOutcome::Queued;
            }
            state.driving = true;
            state.begin_active(&text);
        }
        let session = self.clone();
        tokio::spawn(async move {
            session.drive(text).await;
        });
        SubmitOutcome::Started
    }

    /// Abort the active run. Streamed content is left as-is, queued input
    /// is released. Returns `false` if no run was active.
    pub async fn abort(&self) -> bool {
        let token = {
            let mut state = self.state.lock().await;
            if state.active.is_none() {
                return false;
            }
            state.force_abort();
            state.cancel.take()
        };
        if let Some(token) = token {
            token.cancel();
        }
        true
    }

    /// Switch the conversation mode (synchronous call, never part of a run).
    pub async fn set_mode(&self, mode: ConversationMode) -> Result<(), KestrelError> {
        let conversation_id = {
            let mut state = self.state.lock().await;
            state.mode = mode;
            match state.conversation.as_mut() {
                Some(conversation) => {
                    conversation.mode = mode;
                    Some(conversation.id)
                }
                None => None,
            }
        };
        if let Some(id) = conversation_id {
            self.transport.set_mode(id, mode).await?;
        }
        Ok(())
    }

    /// Attach a page/context payload carried on subsequent runs.
    pub async fn set_page_context(&self, context: serde_json::Value) {
        let mut state = self.state.lock().await;
        if let Some(conversation) = state.conversation.as_mut() {
            conversation.page_context = Some(context.clone());
        }
        state.page_context = Some(context);
    }

    /// Every transcript message, including transient notices.
    pub async fn messages(&self) -> Vec<TranscriptMessage> {
        self.state.lock().await.store.messages().to_vec()
    }

    /// The durable transcript (transient notices excluded).
    pub async fn transcript(&self) -> Vec<TranscriptMessage> {
        self.state
            .lock()
            .await
            .store
            .messages()
            .iter()
            .filter(|m| !m.transient)
            .cloned()
            .collect()
    }

    pub async fn conversation(&self) -> Option<Conversation> {
        self.state.lock().await.conversation.clone()
    }

    pub async fn is_busy(&self) -> bool {
        self.state.lock().await.active.is_some()
    }

    /// Status of the active run, if any.
    pub async fn run_status(&self) -> Option<RunStatus> {
        self.state
            .lock()
            .await
            .active
            .as_ref()
            .map(|active| active.status)
    }

    /// Wait until no run is active and the send queue is drained.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle_notify.notified();
            {
                let state = self.state.lock().await;
                if state.active.is_none() && state.queue.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Abort any in-flight run and discard all local conversation state.
    pub async fn reset(&self) {
        let token = {
            let mut state = self.state.lock().await;
            state.queue.clear();
            if state.active.is_some() {
                state.force_abort();
            }
            state.store.clear();
            state.conversation = None;
            state.page_context = None;
            state.transport_active = false;
            state.cancel.take()
        };
        if let Some(token) = token {
            token.cancel();
        }
    }

    // -- Internal driver --

    /// Run loop: drives the active run to terminal, then releases queued
    /// input in order until the queue is empty.
    async fn drive(self, mut text: String) {
        loop {
            self.run_once(&text).await;
            let next = {
                let mut state = self.state.lock().await;
                state.transport_active = false;
                match state.queue.pop() {
                    Some(next) => {
                        state.begin_active(&next);
                        Some(next)
                    }
                    None => {
                        state.cancel = None;
                        state.driving = false;
                        None
                    }
                }
            };
            match next {
                Some(next) => text = next,
                None => break,
            }
        }
        self.idle_notify.notify_waiters();
    }

    async fn run_once(&self, text: &str) {
        let (epoch, cancel, conversation_id, mode, page_context) = {
            let mut state = self.state.lock().await;
            let Some(active) = state.active.as_mut() else {
                return;
            };
            active.status = RunStatus::Streaming;
            let epoch = active.epoch;
            let cancel = state
                .cancel
                .get_or_insert_with(CancellationToken::new)
                .clone();
            let session = self.clone();
            state.watchdog.arm(async move {
                session.watchdog_expired().await;
            });
            (
                epoch,
                cancel,
                state.conversation.as_ref().map(|c| c.id),
                state.mode,
                state.page_context.clone(),
            )
        };

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            opened = self
                .transport
                .begin_run(conversation_id, text, mode, page_context.as_ref()) => opened,
        };

        let stream = match opened {
            Ok(stream) => stream,
            Err(err) => {
                let mut state = self.state.lock().await;
                if state.is_current(epoch) {
                    state.handle_failure(&err);
                }
                return;
            }
        };

        {
            let mut state = self.state.lock().await;
            if !state.is_current(epoch) {
                return;
            }
            state.transport_active = true;
        }

        let mut events = decode_stream(stream);
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                item = events.next() => item,
            };
            match item {
                None => {
                    let mut state = self.state.lock().await;
                    if state.is_current(epoch) {
                        state.transport_active = false;
                        state.handle_failure(&KestrelError::Stream(
                            "event stream closed before a terminal event".into(),
                        ));
                    }
                    return;
                }
                Some(Err(err)) => {
                    let mut state = self.state.lock().await;
                    if state.is_current(epoch) {
                        state.transport_active = false;
                        state.handle_failure(&err);
                    }
                    return;
                }
                Some(Ok(event)) => {
                    let mut state = self.state.lock().await;
                    if state.apply_event(epoch, event) {
                        return;
                    }
                }
            }
        }
    }

    async fn watchdog_expired(&self) {
        let token = {
            let mut state = self.state.lock().await;
            if !state.watchdog_fire() {
                return;
            }
            state.cancel.take()
        };
        if let Some(token) = token {
            token.cancel();
        }
        self.idle_notify.notify_waiters();
    }
}
