//! Pipeline lifecycle

use crate::error::{PipelineError, PipelineResult};
use serde::Serialize;
use std::fmt;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Failed)
    }

    /// The complete transition table.
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Starting, Running) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running, Stopping) | (Paused, Stopping) => true,
            (Stopping, Stopped) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Numeric code exported as a gauge
    pub fn code(&self) -> i64 {
        match self {
            PipelineState::Starting => 0,
            PipelineState::Running => 1,
            PipelineState::Paused => 2,
            PipelineState::Stopping => 3,
            PipelineState::Stopped => 4,
            PipelineState::Failed => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Paused => "paused",
            PipelineState::Stopping => "stopping",
            PipelineState::Stopped => "stopped",
            PipelineState::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owns the current state. Every change goes through [`StateMachine::transition`].
#[derive(Debug)]
pub struct StateMachine {
    tx: watch::Sender<PipelineState>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(PipelineState::Starting);
        Self { tx }
    }

    pub fn current(&self) -> PipelineState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.tx.subscribe()
    }

    /// Move to `next`, returning the previous state.
    ///
    /// The check and the write happen under the channel lock, so concurrent
    /// callers cannot both pass the check against a stale state.
    pub fn transition(&self, next: PipelineState) -> PipelineResult<PipelineState> {
        let mut outcome = Err(PipelineError::IllegalTransition {
            from: self.current(),
            to: next,
        });

        self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                outcome = Ok(*state);
                *state = next;
                true
            } else {
                outcome = Err(PipelineError::IllegalTransition {
                    from: *state,
                    to: next,
                });
                false
            }
        });

        match &outcome {
            Ok(previous) => info!(from = %previous, to = %next, "Pipeline state changed"),
            Err(e) => warn!(error = %e, "Rejected pipeline state transition"),
        }
        outcome
    }

    /// Running -> Paused. `Ok(false)` when already paused.
    pub fn pause(&self) -> PipelineResult<bool> {
        if self.current() == PipelineState::Paused {
            return Ok(false);
        }
        self.transition(PipelineState::Paused).map(|_| true)
    }

    /// Paused -> Running. `Ok(false)` when already running.
    pub fn resume(&self) -> PipelineResult<bool> {
        if self.current() == PipelineState::Running {
            return Ok(false);
        }
        self.transition(PipelineState::Running).map(|_| true)
    }

    /// Move to Failed unless the state is already terminal.
    pub fn fail(&self) {
        if !self.current().is_terminal() {
            // a concurrent move to a terminal state is the only way this loses
            let _ = self.transition(PipelineState::Failed);
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
