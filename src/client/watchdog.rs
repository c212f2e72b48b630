//! Stuck-stream safety timer.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Cancellable timer owned by the session coordinator.
///
/// Armed when a run enters `streaming`, disarmed on any terminal
/// transition. If the ceiling elapses first, the armed future runs and
/// decides whether the run must be force-aborted.
#[derive(Debug)]
pub struct Watchdog {
    ceiling: Duration,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn new(ceiling: Duration) -> Self {
        Self {
            ceiling,
            handle: None,
        }
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Arm the timer, replacing any previous arming.
    pub fn arm<F>(&mut self, fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.disarm();
        let ceiling = self.ceiling;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(ceiling).await;
            fire.await;
        }));
    }

    /// Cancel a pending timer.
    pub fn disarm(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Drop the handle without aborting. Called from within the fire path,
    /// where the task is already past its sleep.
    pub fn clear_fired(&mut self) {
        self.handle = None;
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.disarm();
    }
}
