//! The per-run orchestration loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Duration};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::config::KestrelConfig;
use crate::provider::{ProviderFactory, TurnEventType, TurnRequest};
use crate::tools::ToolDispatcher;
use crate::types::{
    ContentPart, ConversationId, ConversationMode, EventPayload, ModelMessage, Role, RunId,
    RunOutcome, StreamEvent, TokenCounts, ToolCall,
};

use super::retry::ModelGateway;

/// Typed, ordered event stream for one run.
pub type RunEventStream = UnboundedReceiverStream<StreamEvent>;

/// Request payload to start a run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: RunId,
    pub conversation_id: ConversationId,
    pub user_text: String,
    /// Prior turns of the conversation, oldest first.
    pub history: Vec<ModelMessage>,
    pub mode: ConversationMode,
    pub page_context: Option<serde_json::Value>,
}

impl RunRequest {
    pub fn new(conversation_id: ConversationId, user_text: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            conversation_id,
            user_text: user_text.into(),
            history: Vec::new(),
            mode: ConversationMode::default(),
            page_context: None,
        }
    }

    pub fn with_history(mut self, history: Vec<ModelMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_mode(mut self, mode: ConversationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_page_context(mut self, context: serde_json::Value) -> Self {
        self.page_context = Some(context);
        self
    }
}

/// Handle for an in-flight run.
///
/// Dropping the handle aborts the run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    abort_tx: Option<oneshot::Sender<()>>,
    result_rx: oneshot::Receiver<RunOutcome>,
}

impl RunHandle {
    fn new(run_id: RunId) -> (Self, oneshot::Receiver<()>, oneshot::Sender<RunOutcome>) {
        let (abort_tx, abort_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        (
            Self {
                run_id,
                abort_tx: Some(abort_tx),
                result_rx,
            },
            abort_rx,
            result_tx,
        )
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Signal cancellation. Returns `false` if the run already finished.
    pub fn abort(&mut self) -> bool {
        if let Some(tx) = self.abort_tx.take() {
            return tx.send(()).is_ok();
        }
        false
    }

    /// Wait for the run's terminal outcome.
    pub async fn wait(self) -> RunOutcome {
        self.result_rx
            .await
            .unwrap_or_else(|_| RunOutcome::aborted())
    }
}

/// Drives one conversational turn: alternates between the model provider
/// (through the retry gateway) and the tool dispatcher until the model
/// produces a final answer, emitting the ordered event stream as it goes.
pub struct TurnRunner {
    config: KestrelConfig,
    factory: Arc<dyn ProviderFactory>,
    dispatcher: Arc<ToolDispatcher>,
}

impl TurnRunner {
    pub fn new(
        config: KestrelConfig,
        factory: Arc<dyn ProviderFactory>,
        dispatcher: Arc<ToolDispatcher>,
    ) -> Self {
        Self {
            config,
            factory,
            dispatcher,
        }
    }

    /// Accept a turn: spawn the run task and hand back the abort/wait
    /// handle plus the event stream the consumer subscribes to.
    pub fn start(&self, request: RunRequest) -> (RunHandle, RunEventStream) {
        let (handle, mut abort_rx, result_tx) = RunHandle::new(request.run_id);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let emitter = EventEmitter::new(request.run_id, event_tx);

        let config = self.config.clone();
        let factory = self.factory.clone();
        let dispatcher = self.dispatcher.clone();

        tokio::spawn(async move {
            tracing::debug!(
                run_id = %request.run_id,
                conversation_id = %request.conversation_id,
                mode = %request.mode,
                "run accepted"
            );

            emitter.emit(EventPayload::Start {
                conversation_id: request.conversation_id,
                run_id: request.run_id,
            });

            let user_message_id = Uuid::new_v4().to_string();
            let assistant_message_id = Uuid::new_v4().to_string();
            emitter.emit(EventPayload::MessageCreated {
                user_message_id,
                assistant_message_id,
                conversation_id: request.conversation_id,
                run_id: request.run_id,
            });

            let mut messages = build_context(&request);
            let mut gateway = ModelGateway::new(&config, factory);
            let tool_defs = dispatcher.definitions();

            let mut answer = String::new();
            let mut fallback_text = String::new();
            let mut token_counts = TokenCounts::default();
            let mut tool_calls_count = 0u32;
            let mut iteration = 0usize;

            loop {
                iteration += 1;
                if iteration > config.max_tool_iterations {
                    emitter.emit(EventPayload::Error {
                        message: "exceeded maximum tool iterations".to_string(),
                    });
                    let _ = result_tx.send(RunOutcome::failed("exceeded maximum tool iterations"));
                    return;
                }

                let turn_request = TurnRequest {
                    messages: messages.clone(),
                    mode: request.mode,
                    tools: tool_defs.clone(),
                };

                let mut stream = tokio::select! {
                    _ = &mut abort_rx => {
                        let _ = result_tx.send(RunOutcome::aborted());
                        return;
                    }
                    opened = gateway.open_turn(&turn_request, |payload| emitter.emit(payload)) => {
                        match opened {
                            Ok(stream) => stream,
                            Err(err) => {
                                emitter.emit(EventPayload::Error {
                                    message: err.to_string(),
                                });
                                let _ = result_tx.send(RunOutcome::failed(err.to_string()));
                                return;
                            }
                        }
                    }
                };

                let mut iteration_text = String::new();
                let mut calls = CallAccumulator::default();
                let idle_timeout_ms = config.stream_idle_timeout_ms;
                let mut idle_sleep = (idle_timeout_ms > 0)
                    .then(|| Box::pin(time::sleep(Duration::from_millis(idle_timeout_ms))));

                loop {
                    tokio::select! {
                        _ = &mut abort_rx => {
                            let _ = result_tx.send(RunOutcome::aborted());
                            return;
                        }
                        _ = idle_sleep.as_mut().unwrap(), if idle_sleep.is_some() => {
                            emitter.emit(EventPayload::Error {
                                message: "stream idle timeout".to_string(),
                            });
                            let _ = result_tx.send(RunOutcome::failed("stream idle timeout"));
                            return;
                        }
                        delta = stream.next() => {
                            let Some(delta) = delta else { break; };
                            let delta = match delta {
                                Ok(delta) => delta,
                                Err(err) => {
                                    emitter.emit(EventPayload::Error {
                                        message: err.to_string(),
                                    });
                                    let _ = result_tx.send(RunOutcome::failed(err.to_string()));
                                    return;
                                }
                            };
                            if let Some(ref mut sleep) = idle_sleep {
                                sleep.as_mut().reset(
                                    time::Instant::now() + Duration::from_millis(idle_timeout_ms),
                                );
                            }
                            match delta.event_type {
                                TurnEventType::TextDelta => {
                                    if !delta.text.is_empty() {
                                        iteration_text.push_str(&delta.text);
                                        answer.push_str(&delta.text);
                                        if iteration == 1 {
                                            token_counts.initial += 1;
                                        } else {
                                            token_counts.continuation += 1;
                                        }
                                        emitter.emit(EventPayload::Token { delta: delta.text });
                                    }
                                }
                                TurnEventType::ToolCallDelta => {
                                    if let Some(call) = delta.tool_call {
                                        calls.absorb(call);
                                    }
                                }
                                TurnEventType::Error => {
                                    let message = if delta.text.is_empty() {
                                        "stream error".to_string()
                                    } else {
                                        delta.text
                                    };
                                    emitter.emit(EventPayload::Error { message: message.clone() });
                                    let _ = result_tx.send(RunOutcome::failed(message));
                                    return;
                                }
                                TurnEventType::Done => {
                                    if !delta.text.is_empty() {
                                        fallback_text = delta.text;
                                    }
                                    break;
                                }
                            }
                        }
                    }
                }

                let calls = calls.into_ordered();
                tracing::debug!(
                    run_id = %request.run_id,
                    iteration,
                    tool_calls = calls.len(),
                    text_len = iteration_text.len(),
                    "model turn complete"
                );

                if calls.is_empty() {
                    let final_text = if answer.is_empty() {
                        fallback_text
                    } else {
                        answer
                    };
                    emitter.emit(EventPayload::Done {
                        final_text,
                        tool_calls_count,
                        token_counts,
                    });
                    let _ = result_tx.send(RunOutcome::done());
                    return;
                }

                let mut assistant_content: Vec<ContentPart> = Vec::new();
                if !iteration_text.is_empty() {
                    assistant_content.push(ContentPart::Text {
                        text: iteration_text,
                    });
                }
                for call in &calls {
                    assistant_content.push(ContentPart::ToolCall(call.clone()));
                }
                messages.push(ModelMessage {
                    role: Role::Assistant,
                    content: assistant_content,
                    timestamp: Some(Utc::now()),
                });

                for call in &calls {
                    emitter.emit(EventPayload::ToolCall {
                        tool_call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        tool_args: call.arguments.clone(),
                    });
                }

                let results = tokio::select! {
                    _ = &mut abort_rx => {
                        let _ = result_tx.send(RunOutcome::aborted());
                        return;
                    }
                    results = dispatcher.dispatch_batch(&calls) => results,
                };

                for result in results {
                    emitter.emit(EventPayload::ToolResult {
                        tool_call_id: result.tool_call_id.clone(),
                        result: result.result.clone(),
                        is_error: result.is_error,
                    });
                    messages.push(ModelMessage::tool_result(result));
                    tool_calls_count += 1;
                }
            }
        });

        (handle, UnboundedReceiverStream::new(event_rx))
    }
}

/// Stamps sequence numbers and forwards events to the run's channel.
struct EventEmitter {
    run_id: RunId,
    seq: AtomicU64,
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl EventEmitter {
    fn new(run_id: RunId, tx: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self {
            run_id,
            seq: AtomicU64::new(1),
            tx,
        }
    }

    fn emit(&self, payload: EventPayload) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(StreamEvent {
            run_id: self.run_id,
            seq,
            timestamp: Utc::now(),
            payload,
        });
    }
}

/// Collects tool-call deltas, preserving first-seen order while letting a
/// later delta for the same call id replace its arguments.
#[derive(Default)]
struct CallAccumulator {
    order: Vec<String>,
    calls: HashMap<String, ToolCall>,
}

impl CallAccumulator {
    fn absorb(&mut self, call: ToolCall) {
        if !self.calls.contains_key(&call.id) {
            self.order.push(call.id.clone());
        }
        self.calls.insert(call.id.clone(), call);
    }

    fn into_ordered(mut self) -> Vec<ToolCall> {
        self.order
            .iter()
            .filter_map(|id| self.calls.remove(id))
            .collect()
    }
}

fn build_context(request: &RunRequest) -> Vec<ModelMessage> {
    let mut messages = vec![ModelMessage::system(system_prompt(request.mode))];
    if let Some(ref context) = request.page_context {
        messages.push(ModelMessage::system(format!(
            "The user is currently viewing: {context}"
        )));
    }
    messages.extend(request.history.iter().cloned());
    messages.push(ModelMessage::user(request.user_text.clone()));
    messages
}

fn system_prompt(mode: ConversationMode) -> &'static str {
    match mode {
        ConversationMode::Analysis => {
            "You are a portfolio analyst. Answer with concrete figures from the \
             user's holdings, using the available data tools before estimating."
        }
        ConversationMode::Planning => {
            "You are a portfolio planner. Frame answers around allocation \
             targets and what-if outcomes, using the available data tools."
        }
        ConversationMode::Education => {
            "You are a patient financial educator. Explain the concepts behind \
             each answer in plain language alongside the numbers."
        }
    }
}
