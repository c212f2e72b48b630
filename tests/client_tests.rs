//! Tests for the client session: stream consumption, transcript
//! reconciliation, send queueing, watchdog recovery.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{event_at, script_events, wait_for_messages, ScriptedTransport, TransportScript};
use pretty_assertions::assert_eq;
use tokio::sync::Notify;
use uuid::Uuid;

use kestrel::client::{ChatSession, SubmitOutcome};
use kestrel::config::KestrelConfig;
use kestrel::error::KestrelError;
use kestrel::types::{
    ConversationMode, EventPayload, Role, RunId, StreamEvent, TokenCounts,
};

struct RunScript {
    run_id: RunId,
    conversation_id: Uuid,
}

impl RunScript {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
        }
    }

    fn with_conversation(conversation_id: Uuid) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            conversation_id,
        }
    }

    fn start(&self) -> EventPayload {
        EventPayload::Start {
            conversation_id: self.conversation_id,
            run_id: self.run_id,
        }
    }

    fn message_created(&self, user_id: &str, assistant_id: &str) -> EventPayload {
        EventPayload::MessageCreated {
            user_message_id: user_id.to_string(),
            assistant_message_id: assistant_id.to_string(),
            conversation_id: self.conversation_id,
            run_id: self.run_id,
        }
    }

    fn done(&self, final_text: &str, initial: u32, continuation: u32) -> EventPayload {
        EventPayload::Done {
            final_text: final_text.to_string(),
            tool_calls_count: 0,
            token_counts: TokenCounts {
                initial,
                continuation,
            },
        }
    }

    fn simple_answer(&self, user_id: &str, assistant_id: &str, text: &str) -> Vec<StreamEvent> {
        script_events(
            self.run_id,
            vec![
                self.start(),
                self.message_created(user_id, assistant_id),
                EventPayload::Token {
                    delta: text.to_string(),
                },
                self.done(text, 1, 0),
            ],
        )
    }
}

fn token(text: &str) -> EventPayload {
    EventPayload::Token {
        delta: text.to_string(),
    }
}

fn session_with(scripts: Vec<TransportScript>) -> (ChatSession, Arc<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport::new(scripts));
    let session = ChatSession::new(transport.clone(), KestrelConfig::default());
    (session, transport)
}

// Scenario A: streamed tokens are concatenated into the final message.
#[tokio::test]
async fn streamed_tokens_become_the_assistant_message() {
    let run = RunScript::new();
    let events = script_events(
        run.run_id,
        vec![
            run.start(),
            run.message_created("u1", "a1"),
            token("Your"),
            token(" largest position is X"),
            run.done("Your largest position is X", 2, 0),
        ],
    );
    let (session, _) = session_with(vec![TransportScript::Events(events)]);

    assert_eq!(
        session.send("What's my largest position?").await,
        SubmitOutcome::Started
    );
    session.wait_for_idle().await;

    let transcript = session.transcript().await;
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role, Role::User);
    assert_eq!(transcript[0].id, "u1");
    assert_eq!(transcript[0].content, "What's my largest position?");
    assert_eq!(transcript[1].role, Role::Assistant);
    assert_eq!(transcript[1].id, "a1");
    assert_eq!(transcript[1].content, "Your largest position is X");
    assert_eq!(transcript[1].run_id, None);
    assert_eq!(transcript[1].error, None);

    let conversation = session.conversation().await.unwrap();
    assert_eq!(conversation.id, run.conversation_id);
}

// Streamed text wins even when the backend's final_text disagrees.
#[tokio::test]
async fn streamed_text_is_authoritative_over_final_text() {
    let run = RunScript::new();
    let events = script_events(
        run.run_id,
        vec![
            run.start(),
            run.message_created("u1", "a1"),
            token("streamed answer"),
            run.done("a different backend rendering", 1, 0),
        ],
    );
    let (session, _) = session_with(vec![TransportScript::Events(events)]);

    session.send("question").await;
    session.wait_for_idle().await;

    let transcript = session.transcript().await;
    assert_eq!(transcript[1].content, "streamed answer");
}

// Scenario B: assistant message reflects post-tool narration.
#[tokio::test]
async fn tool_events_precede_narration_in_the_transcript() {
    let run = RunScript::new();
    let events = script_events(
        run.run_id,
        vec![
            run.start(),
            run.message_created("u1", "a1"),
            EventPayload::ToolCall {
                tool_call_id: "tc-1".into(),
                tool_name: "get_portfolio_complete".into(),
                tool_args: serde_json::json!({}),
            },
            EventPayload::ToolResult {
                tool_call_id: "tc-1".into(),
                result: serde_json::json!({ "positions": [] }),
                is_error: false,
            },
            token("After checking your portfolio: cash is 12%."),
            run.done("After checking your portfolio: cash is 12%.", 0, 1),
        ],
    );
    let (session, _) = session_with(vec![TransportScript::Events(events)]);

    session.send("How much cash am I holding?").await;
    session.wait_for_idle().await;

    let transcript = session.transcript().await;
    assert_eq!(
        transcript[1].content,
        "After checking your portfolio: cash is 12%."
    );
}

// Scenario C: zero streamed tokens falls back to the backend final text.
#[tokio::test]
async fn zero_token_run_uses_backend_final_text_exactly() {
    let run = RunScript::new();
    let events = script_events(
        run.run_id,
        vec![
            run.start(),
            run.message_created("u1", "a1"),
            EventPayload::ToolResult {
                tool_call_id: "tc-1".into(),
                result: serde_json::json!({}),
                is_error: false,
            },
            run.done("Backend final fallback", 0, 0),
        ],
    );
    let (session, _) = session_with(vec![TransportScript::Events(events)]);

    session.send("Summary?").await;
    session.wait_for_idle().await;

    let transcript = session.transcript().await;
    assert_eq!(transcript[1].content, "Backend final fallback");
}

// Scenario D: retry info becomes a transient notice, the run still succeeds.
#[tokio::test]
async fn retry_info_surfaces_as_a_transient_notice() {
    let run = RunScript::new();
    let events = script_events(
        run.run_id,
        vec![
            run.start(),
            run.message_created("u1", "a1"),
            EventPayload::Info {
                info: kestrel::types::InfoPayload::RetryScheduled {
                    attempt: 2,
                    max_attempts: 3,
                    retry_in_ms: 750,
                },
            },
            token("Recovered and answered."),
            run.done("Recovered and answered.", 1, 0),
        ],
    );
    let (session, _) = session_with(vec![TransportScript::Events(events)]);

    session.send("question").await;
    session.wait_for_idle().await;

    let messages = session.messages().await;
    let notice = messages
        .iter()
        .find(|m| m.transient)
        .expect("expected a transient notice");
    assert_eq!(notice.role, Role::System);
    assert!(notice.content.contains("attempt 2 of 3"));
    assert!(notice.content.contains("0.75s"));

    // The durable transcript excludes the notice and keeps the answer.
    let transcript = session.transcript().await;
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[1].content, "Recovered and answered.");
}

// Scenario E: a stale conversation resets all local state.
#[tokio::test]
async fn stale_conversation_discards_local_state_and_prompts_resend() {
    let run = RunScript::new();
    let (session, _) = session_with(vec![
        TransportScript::Events(run.simple_answer("u1", "a1", "First answer.")),
        TransportScript::Fail(KestrelError::StaleConversation(
            "conversation not recognized".into(),
        )),
    ]);

    session.send("first question").await;
    session.wait_for_idle().await;
    assert_eq!(session.transcript().await.len(), 2);

    session.send("second question").await;
    session.wait_for_idle().await;

    assert_eq!(session.conversation().await, None);
    let messages = session.messages().await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].transient);
    assert!(messages[0].content.contains("resend"));
    assert!(!session.is_busy().await);
}

// Sending while a run is active queues, then dispatches FIFO.
#[tokio::test]
async fn second_send_queues_and_dispatches_after_the_active_run() {
    let gate = Arc::new(Notify::new());
    let first = RunScript::new();
    let second = RunScript::with_conversation(first.conversation_id);
    let (session, transport) = session_with(vec![
        TransportScript::Gated(
            first.simple_answer("u1", "a1", "First answer."),
            gate.clone(),
        ),
        TransportScript::Events(second.simple_answer("u2", "a2", "Second answer.")),
    ]);

    assert_eq!(session.send("first").await, SubmitOutcome::Started);
    assert_eq!(session.send("second").await, SubmitOutcome::Queued);
    assert_eq!(session.send("third").await, SubmitOutcome::Queued);
    assert!(transport.begin_calls() <= 1);

    gate.notify_one();
    session.wait_for_idle().await;

    // Three sends, three runs, strictly in submission order.
    assert_eq!(transport.begin_calls(), 3);
    let transcript = session.transcript().await;
    assert_eq!(transcript[0].content, "first");
    assert_eq!(transcript[1].content, "First answer.");
    assert_eq!(transcript[2].content, "second");
    assert_eq!(transcript[3].content, "Second answer.");
    // Third run had no script left; its user text still went out in order.
    assert_eq!(
        transport.begin_args().len(),
        3,
        "each queued message initiates exactly one run"
    );
}

// Abort preserves streamed content and unblocks the queue.
#[tokio::test]
async fn abort_keeps_partial_content_and_frees_the_session() {
    let run = RunScript::new();
    let events = script_events(
        run.run_id,
        vec![
            run.start(),
            run.message_created("u1", "a1"),
            token("partial answer"),
        ],
    );
    let (session, _) = session_with(vec![TransportScript::EventsThenHang(events)]);

    session.send("question").await;
    wait_for_messages(&session, |messages| {
        messages
            .iter()
            .any(|m| m.role == Role::Assistant && m.content == "partial answer")
    })
    .await;

    assert!(session.abort().await);
    session.wait_for_idle().await;

    let transcript = session.transcript().await;
    assert_eq!(transcript[1].content, "partial answer");
    assert_eq!(transcript[1].error, None);
    assert_eq!(transcript[1].run_id, None);
    assert!(!session.is_busy().await);
}

// Run-fatal backend error preserves partial text and appends the reason.
#[tokio::test]
async fn error_event_appends_reason_to_streamed_text() {
    let run = RunScript::new();
    let events = script_events(
        run.run_id,
        vec![
            run.start(),
            run.message_created("u1", "a1"),
            token("partial analysis"),
            EventPayload::Error {
                message: "exceeded maximum tool iterations".into(),
            },
        ],
    );
    let (session, _) = session_with(vec![TransportScript::Events(events)]);

    session.send("question").await;
    session.wait_for_idle().await;

    let transcript = session.transcript().await;
    assert!(transcript[1].content.starts_with("partial analysis"));
    assert!(transcript[1]
        .content
        .contains("exceeded maximum tool iterations"));
    assert_eq!(
        transcript[1].error.as_deref(),
        Some("exceeded maximum tool iterations")
    );
}

// A transport that closes without a terminal event is a network failure.
#[tokio::test]
async fn stream_closing_early_surfaces_a_network_error() {
    let run = RunScript::new();
    let events = script_events(
        run.run_id,
        vec![
            run.start(),
            run.message_created("u1", "a1"),
            token("cut off"),
        ],
    );
    let (session, _) = session_with(vec![TransportScript::Events(events)]);

    session.send("question").await;
    session.wait_for_idle().await;

    let transcript = session.transcript().await;
    assert!(transcript[1].content.starts_with("cut off"));
    assert!(transcript[1].error.is_some());
    assert!(!session.is_busy().await);
}

// A sequence gap is a protocol violation that terminates the run.
#[tokio::test]
async fn sequence_gap_fails_the_run() {
    let run = RunScript::new();
    let events = vec![
        event_at(run.run_id, 1, run.start()),
        event_at(run.run_id, 2, run.message_created("u1", "a1")),
        event_at(run.run_id, 3, token("ok so far")),
        event_at(run.run_id, 5, token("skipped one")),
    ];
    let (session, _) = session_with(vec![TransportScript::Events(events)]);

    session.send("question").await;
    session.wait_for_idle().await;

    let transcript = session.transcript().await;
    assert!(transcript[1].content.contains("sequence gap"));
    assert!(transcript[1].error.is_some());
    assert!(!session.is_busy().await);
}

// The watchdog force-aborts a run stuck with no transport, then releases
// the queue.
#[tokio::test(start_paused = true)]
async fn watchdog_recovers_a_stalled_run_and_releases_the_queue() {
    let second = RunScript::new();
    let transport = Arc::new(ScriptedTransport::new(vec![
        TransportScript::Hang,
        TransportScript::Events(second.simple_answer("u2", "a2", "Second answer.")),
    ]));
    let config = KestrelConfig {
        watchdog_ceiling: Duration::from_millis(50),
        ..KestrelConfig::default()
    };
    let session = ChatSession::new(transport.clone(), config);

    session.send("first").await;
    assert_eq!(session.send("second").await, SubmitOutcome::Queued);
    session.wait_for_idle().await;

    let messages = session.messages().await;
    assert!(messages
        .iter()
        .any(|m| m.transient && m.content.contains("stalled")));
    let transcript = session.transcript().await;
    assert_eq!(transcript[0].content, "second");
    assert_eq!(transcript[1].content, "Second answer.");
    assert_eq!(transport.begin_calls(), 2);
    assert!(!session.is_busy().await);
}

// Mode switching is a synchronous call, local-first before a conversation
// exists.
#[tokio::test]
async fn set_mode_updates_local_state_and_calls_the_backend() {
    let run = RunScript::new();
    let (session, transport) = session_with(vec![TransportScript::Events(
        run.simple_answer("u1", "a1", "answer"),
    )]);

    // No conversation yet: local only.
    session.set_mode(ConversationMode::Education).await.unwrap();
    assert!(transport.mode_calls().is_empty());

    session.send("teach me about beta").await;
    session.wait_for_idle().await;
    assert_eq!(
        transport.begin_args(),
        vec![(None, ConversationMode::Education)]
    );

    // Conversation exists now: the backend is told.
    session.set_mode(ConversationMode::Planning).await.unwrap();
    assert_eq!(
        transport.mode_calls(),
        vec![(run.conversation_id, ConversationMode::Planning)]
    );
    assert_eq!(
        session.conversation().await.unwrap().mode,
        ConversationMode::Planning
    );
}

// A later run reuses the minted conversation id.
#[tokio::test]
async fn follow_up_runs_carry_the_conversation_id() {
    let first = RunScript::new();
    let second = RunScript::with_conversation(first.conversation_id);
    let (session, transport) = session_with(vec![
        TransportScript::Events(first.simple_answer("u1", "a1", "one")),
        TransportScript::Events(second.simple_answer("u2", "a2", "two")),
    ]);

    session.send("first").await;
    session.wait_for_idle().await;
    session.send("second").await;
    session.wait_for_idle().await;

    let args = transport.begin_args();
    assert_eq!(args[0].0, None);
    assert_eq!(args[1].0, Some(first.conversation_id));
}

// Reset discards the conversation entirely.
#[tokio::test]
async fn reset_clears_transcript_and_conversation() {
    let run = RunScript::new();
    let (session, _) = session_with(vec![TransportScript::Events(
        run.simple_answer("u1", "a1", "answer"),
    )]);

    session.send("question").await;
    session.wait_for_idle().await;
    assert!(!session.transcript().await.is_empty());

    session.reset().await;
    assert!(session.messages().await.is_empty());
    assert_eq!(session.conversation().await, None);
    assert!(!session.is_busy().await);
}
