//! Cooperative run governor: pause, resume, stop and step budget.
//!
//! A [`RunControl`] is a cheap cloneable handle. The loop consults it at every
//! step boundary; lifecycle calls mutate it from other tasks. Nothing here
//! preempts the loop: a stop is observed the next time the loop checks.
//!
//! Status moves `running -> paused -> running` freely and into `stopping`
//! from either; `stopping` is terminal.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Run control status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlStatus {
    Running,
    Paused,
    Stopping,
}

/// Point-in-time view of a control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunControlState {
    pub status: ControlStatus,
    pub max_steps: u32,
    pub current_step: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewind_to_step: Option<u32>,
}

#[derive(Debug)]
struct Inner {
    state: RunControlState,
    /// Barrier shared by every waiter of the current pause window.
    barrier: Option<Arc<Notify>>,
    signal: Option<JoinHandle<()>>,
}

/// Handle to one run's control state.
#[derive(Debug, Clone)]
pub struct RunControl {
    inner: Arc<Mutex<Inner>>,
}

impl RunControl {
    pub fn new(max_steps: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: RunControlState {
                    status: ControlStatus::Running,
                    max_steps,
                    current_step: 0,
                    rewind_to_step: None,
                },
                barrier: None,
                signal: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent across a poisoned lock: every mutation is a
        // single field store.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> ControlStatus {
        self.lock().state.status
    }

    pub fn snapshot(&self) -> RunControlState {
        self.lock().state.clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.status() == ControlStatus::Stopping
    }

    pub fn current_step(&self) -> u32 {
        self.lock().state.current_step
    }

    pub fn max_steps(&self) -> u32 {
        self.lock().state.max_steps
    }

    /// True once the step counter has reached the budget.
    pub fn budget_exhausted(&self) -> bool {
        let inner = self.lock();
        inner.state.current_step >= inner.state.max_steps
    }

    /// Count a new step and return its 1-based number.
    pub fn advance_step(&self) -> u32 {
        let mut inner = self.lock();
        inner.state.current_step += 1;
        inner.state.current_step
    }

    /// Suspend while paused. Returns immediately in any other status.
    pub async fn wait_if_paused(&self) {
        let barrier;
        let notified;
        {
            let mut inner = self.lock();
            if inner.state.status != ControlStatus::Paused {
                return;
            }
            barrier = Arc::clone(
                inner
                    .barrier
                    .get_or_insert_with(|| Arc::new(Notify::new())),
            );
            // Registered before the lock is released, so a resume racing
            // with this call still wakes us.
            notified = barrier.notified();
        }
        debug!("run paused, waiting for resume");
        notified.await;
    }

    pub fn pause(&self) {
        let mut inner = self.lock();
        if inner.state.status == ControlStatus::Running {
            inner.state.status = ControlStatus::Paused;
            debug!(step = inner.state.current_step, "run control paused");
        }
    }

    pub fn resume(&self) {
        let mut inner = self.lock();
        if inner.state.status != ControlStatus::Paused {
            return;
        }
        inner.state.status = ControlStatus::Running;
        release(&mut inner);
        debug!(step = inner.state.current_step, "run control resumed");
    }

    pub fn stop(&self) {
        let mut inner = self.lock();
        inner.state.status = ControlStatus::Stopping;
        release(&mut inner);
        debug!(step = inner.state.current_step, "run control stopping");
    }

    /// Replace the step budget.
    ///
    /// When the new budget does not exceed the old one and the run has
    /// already used it up, a paused run is woken so the loop sees the
    /// exhausted budget and exits instead of waiting.
    pub fn update_max_steps(&self, max_steps: u32) {
        let tightened = {
            let mut inner = self.lock();
            let previous = inner.state.max_steps;
            inner.state.max_steps = max_steps;
            debug!(previous, max_steps, "run control budget updated");
            max_steps <= previous && inner.state.current_step >= max_steps
        };
        if tightened {
            self.resume();
        }
    }

    /// Ask the loop to continue from an earlier step.
    ///
    /// Ignored unless `step` is below the current step.
    pub fn rewind_to(&self, step: u32) {
        let mut inner = self.lock();
        if step < inner.state.current_step {
            inner.state.rewind_to_step = Some(step);
        }
    }

    /// Consume a pending rewind, resetting the step counter to it.
    pub fn take_rewind(&self) -> Option<u32> {
        let mut inner = self.lock();
        let step = inner.state.rewind_to_step.take()?;
        inner.state.current_step = step;
        Some(step)
    }

    /// Stop this control when `token` is cancelled.
    ///
    /// Replaces any previously attached token. Must be called within a tokio
    /// runtime. The watcher task holds the control until the token fires or
    /// [`RunControl::detach_signal`] runs.
    pub fn attach_signal(&self, token: CancellationToken) {
        self.detach_signal();
        if token.is_cancelled() {
            self.stop();
            return;
        }
        let control = self.clone();
        let watcher = tokio::spawn(async move {
            token.cancelled().await;
            control.stop();
        });
        self.lock().signal = Some(watcher);
    }

    pub fn detach_signal(&self) {
        if let Some(watcher) = self.lock().signal.take() {
            watcher.abort();
        }
    }
}

fn release(inner: &mut Inner) {
    if let Some(barrier) = inner.barrier.take() {
        barrier.notify_waiters();
    }
}
