//! Core run types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique run identifier.
pub type RunId = Uuid;

/// Run lifecycle status.
///
/// A run transitions `Pending → Streaming → {Done | Error}`, with `Aborted`
/// reachable from `Streaming` by consumer cancellation. Terminal statuses
/// are immutable once reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Streaming,
    Done,
    Error,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Aborted)
    }
}

/// Streamed-fragment counts for a run, split by loop phase.
///
/// `initial` counts fragments from the first model call, `continuation`
/// those from post-tool calls. Both zero means the answer was pure tool
/// orchestration and the consumer must fall back to the backend-supplied
/// final text.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenCounts {
    pub initial: u32,
    pub continuation: u32,
}

impl TokenCounts {
    pub fn total(&self) -> u32 {
        self.initial + self.continuation
    }
}

/// Final outcome of a run, resolved through the run handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    pub fn done() -> Self {
        Self {
            status: RunStatus::Done,
            error: None,
            finished_at: Utc::now(),
        }
    }

    pub fn aborted() -> Self {
        Self {
            status: RunStatus::Aborted,
            error: None,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Error,
            error: Some(error.into()),
            finished_at: Utc::now(),
        }
    }
}
