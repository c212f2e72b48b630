//! Provider-call gateway: retry with backoff and one-shot model fallback.

use std::sync::Arc;
use std::time::Duration;

use crate::config::KestrelConfig;
use crate::error::KestrelError;
use crate::provider::{ProviderFactory, TurnRequest, TurnStream};
use crate::types::{EventPayload, InfoPayload, ModelId};
use crate::util::retry::{jittered, next_backoff};

/// Retry bookkeeping for one run. Discarded when the run terminates.
#[derive(Debug)]
struct RetryState {
    attempt: u32,
    backoff: Duration,
    fallback_used: bool,
}

/// Wraps every provider call a run makes.
///
/// Transient failures back off and retry, surfacing each wait as a
/// `retry_scheduled` info event. A degraded-class failure, or reaching the
/// configured attempt threshold, switches to the fallback model exactly
/// once per run (`model_switch` info event). Non-transient failures and
/// exhausted attempts propagate to the caller, which terminates the run.
pub struct ModelGateway {
    factory: Arc<dyn ProviderFactory>,
    model: ModelId,
    fallback_model: ModelId,
    max_attempts: u32,
    fallback_after_attempts: u32,
    max_backoff: Duration,
    multiplier: f64,
    state: RetryState,
}

impl ModelGateway {
    pub fn new(config: &KestrelConfig, factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            factory,
            model: config.primary_model.clone(),
            fallback_model: config.fallback_model.clone(),
            max_attempts: config.max_attempts,
            fallback_after_attempts: config.fallback_after_attempts,
            max_backoff: config.max_backoff,
            multiplier: config.backoff_multiplier,
            state: RetryState {
                attempt: 0,
                backoff: config.initial_backoff,
                fallback_used: false,
            },
        }
    }

    /// The model the next call will be issued against.
    pub fn current_model(&self) -> &ModelId {
        &self.model
    }

    /// Whether this run has already switched to the fallback model.
    pub fn fallback_used(&self) -> bool {
        self.state.fallback_used
    }

    /// Open a streaming turn, retrying and falling back per policy.
    ///
    /// `emit` receives the advisory info events this may produce; the
    /// attempt counter persists across turns of the same run.
    pub async fn open_turn<F>(
        &mut self,
        request: &TurnRequest,
        mut emit: F,
    ) -> Result<TurnStream, KestrelError>
    where
        F: FnMut(EventPayload),
    {
        loop {
            let provider = self.factory.create(&self.model)?;
            match provider.stream_turn(request).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    self.state.attempt += 1;

                    if !self.state.fallback_used
                        && (err.is_degraded() || self.state.attempt >= self.fallback_after_attempts)
                    {
                        let from = std::mem::replace(&mut self.model, self.fallback_model.clone());
                        self.state.fallback_used = true;
                        tracing::warn!(
                            from = %from,
                            to = %self.model,
                            attempt = self.state.attempt,
                            error = %err,
                            "switching to fallback model"
                        );
                        emit(EventPayload::Info {
                            info: InfoPayload::ModelSwitch {
                                from,
                                to: self.model.clone(),
                                attempt: self.state.attempt,
                            },
                        });
                        continue;
                    }

                    if self.state.attempt >= self.max_attempts {
                        return Err(err);
                    }

                    let delay = jittered(self.state.backoff);
                    tracing::warn!(
                        attempt = self.state.attempt,
                        max_attempts = self.max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "provider call failed, retrying"
                    );
                    emit(EventPayload::Info {
                        info: InfoPayload::RetryScheduled {
                            attempt: self.state.attempt,
                            max_attempts: self.max_attempts,
                            retry_in_ms: delay.as_millis() as u64,
                        },
                    });
                    tokio::time::sleep(delay).await;
                    self.state.backoff =
                        next_backoff(self.state.backoff, self.multiplier, self.max_backoff);
                }
            }
        }
    }
}
