//! Shared test doubles: scripted providers, factories, and transports.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::Notify;
use tokio_stream::StreamExt;

use kestrel::client::{ByteStream, ChatSession, RunTransport};
use kestrel::error::KestrelError;
use kestrel::provider::{
    ModelProvider, ProviderFactory, TurnDelta, TurnRequest, TurnStream,
};
use kestrel::types::{
    ConversationId, ConversationMode, EventPayload, ModelId, RunId, StreamEvent,
    TranscriptMessage,
};
use kestrel::wire::encode_frame;

// -- Provider side --

/// One scripted provider call.
pub enum TurnScript {
    /// Establish a stream that yields these deltas, then ends.
    Deltas(Vec<TurnDelta>),
    /// Establish a stream that yields these deltas, then never ends.
    DeltasThenHang(Vec<TurnDelta>),
    /// Fail to establish the stream.
    Fail(KestrelError),
}

/// Factory whose providers consume a shared script, one entry per call,
/// recording which model served each attempt.
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    script: Arc<Mutex<VecDeque<TurnScript>>>,
    calls: Arc<Mutex<Vec<ModelId>>>,
}

impl ScriptedFactory {
    pub fn new(steps: Vec<TurnScript>) -> Self {
        Self {
            script: Arc::new(Mutex::new(steps.into())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Models used, in attempt order.
    pub fn models_called(&self) -> Vec<ModelId> {
        self.calls.lock().unwrap().clone()
    }
}

impl ProviderFactory for ScriptedFactory {
    fn create(&self, model: &ModelId) -> Result<Arc<dyn ModelProvider>, KestrelError> {
        Ok(Arc::new(ScriptedProvider {
            model: model.clone(),
            script: self.script.clone(),
            calls: self.calls.clone(),
        }))
    }
}

struct ScriptedProvider {
    model: ModelId,
    script: Arc<Mutex<VecDeque<TurnScript>>>,
    calls: Arc<Mutex<Vec<ModelId>>>,
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_id(&self) -> &ModelId {
        &self.model
    }

    async fn stream_turn(&self, _request: &TurnRequest) -> Result<TurnStream, KestrelError> {
        self.calls.lock().unwrap().push(self.model.clone());
        let step = self.script.lock().unwrap().pop_front();
        match step {
            None => Ok(Box::pin(futures::stream::iter(vec![Ok::<
                TurnDelta,
                KestrelError,
            >(
                TurnDelta::done(kestrel::provider::FinishReason::Stop),
            )]))),
            Some(TurnScript::Deltas(deltas)) => Ok(Box::pin(futures::stream::iter(
                deltas.into_iter().map(Ok::<TurnDelta, KestrelError>),
            ))),
            Some(TurnScript::DeltasThenHang(deltas)) => Ok(Box::pin(
                futures::stream::iter(deltas.into_iter().map(Ok::<TurnDelta, KestrelError>))
                    .chain(futures::stream::pending()),
            )),
            Some(TurnScript::Fail(err)) => Err(err),
        }
    }
}

// -- Transport side --

/// One scripted `begin_run` response.
pub enum TransportScript {
    /// Stream these events, one frame per chunk, then close.
    Events(Vec<StreamEvent>),
    /// Stream these events, then keep the stream open forever.
    EventsThenHang(Vec<StreamEvent>),
    /// Wait for the gate before streaming, then close.
    Gated(Vec<StreamEvent>, Arc<Notify>),
    /// Fail the begin-run call.
    Fail(KestrelError),
    /// Never return from the begin-run call.
    Hang,
}

#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<TransportScript>>,
    begin_calls: AtomicUsize,
    begin_args: Mutex<Vec<(Option<ConversationId>, ConversationMode)>>,
    mode_calls: Mutex<Vec<(ConversationId, ConversationMode)>>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<TransportScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            begin_calls: AtomicUsize::new(0),
            begin_args: Mutex::new(Vec::new()),
            mode_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn begin_calls(&self) -> usize {
        self.begin_calls.load(Ordering::SeqCst)
    }

    pub fn begin_args(&self) -> Vec<(Option<ConversationId>, ConversationMode)> {
        self.begin_args.lock().unwrap().clone()
    }

    pub fn mode_calls(&self) -> Vec<(ConversationId, ConversationMode)> {
        self.mode_calls.lock().unwrap().clone()
    }
}

fn frames(events: Vec<StreamEvent>) -> Vec<Result<Bytes, KestrelError>> {
    events
        .iter()
        .map(|e| encode_frame(e).map_err(|err| KestrelError::Stream(err.to_string())))
        .collect()
}

#[async_trait]
impl RunTransport for ScriptedTransport {
    async fn begin_run(
        &self,
        conversation_id: Option<ConversationId>,
        _text: &str,
        mode: ConversationMode,
        _page_context: Option<&serde_json::Value>,
    ) -> Result<ByteStream, KestrelError> {
        self.begin_calls.fetch_add(1, Ordering::SeqCst);
        self.begin_args.lock().unwrap().push((conversation_id, mode));
        let step = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(TransportScript::Events(Vec::new()));
        match step {
            TransportScript::Events(events) => {
                Ok(Box::pin(futures::stream::iter(frames(events))))
            }
            TransportScript::EventsThenHang(events) => Ok(Box::pin(
                futures::stream::iter(frames(events)).chain(futures::stream::pending()),
            )),
            TransportScript::Gated(events, gate) => {
                let chunks = frames(events);
                Ok(Box::pin(async_stream::stream! {
                    gate.notified().await;
                    for chunk in chunks {
                        yield chunk;
                    }
                }))
            }
            TransportScript::Fail(err) => Err(err),
            TransportScript::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn set_mode(
        &self,
        conversation_id: ConversationId,
        mode: ConversationMode,
    ) -> Result<(), KestrelError> {
        self.mode_calls.lock().unwrap().push((conversation_id, mode));
        Ok(())
    }
}

// -- Event scripting --

/// Build a well-formed event sequence for one run: seq starts at 1 and
/// increases by one per event.
pub fn script_events(
    run_id: RunId,
    payloads: Vec<EventPayload>,
) -> Vec<StreamEvent> {
    payloads
        .into_iter()
        .enumerate()
        .map(|(i, payload)| StreamEvent {
            run_id,
            seq: (i + 1) as u64,
            timestamp: Utc::now(),
            payload,
        })
        .collect()
}

pub fn event_at(run_id: RunId, seq: u64, payload: EventPayload) -> StreamEvent {
    StreamEvent {
        run_id,
        seq,
        timestamp: Utc::now(),
        payload,
    }
}

// -- Polling --

/// Poll the session transcript until the predicate holds (or panic).
pub async fn wait_for_messages<F>(session: &ChatSession, pred: F)
where
    F: Fn(&[TranscriptMessage]) -> bool,
{
    for _ in 0..1000 {
        let messages = session.messages().await;
        if pred(&messages) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    panic!("transcript never reached the expected state");
}
