use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a root job or one of its steps.
///
/// ```text
/// Unknown -> Pending -> Running -> { FinishedOk, FinishedError, Interrupted, Canceled, Killed }
///               \-> Canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created but never queued.
    #[default]
    Unknown,
    /// Queued, waiting for a worker.
    Pending,
    /// Picked up by a worker and executing.
    Running,
    /// Completed successfully.
    FinishedOk,
    /// Completed with a failure (non-zero exit, spawn error, ...).
    FinishedError,
    /// Stopped because the worker pool itself was shutting down.
    Interrupted,
    /// Cancelled, usually before it started.
    Canceled,
    /// Forcibly terminated by an operator while running.
    Killed,
}

impl RunState {
    /// Returns `true` if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::FinishedOk
                | RunState::FinishedError
                | RunState::Interrupted
                | RunState::Canceled
                | RunState::Killed
        )
    }

    /// Returns `true` while the unit is queued or executing.
    pub fn is_active(&self) -> bool {
        matches!(self, RunState::Pending | RunState::Running)
    }

    /// Returns `true` for states that mean "stopped on request" rather than "failed".
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            RunState::Interrupted | RunState::Canceled | RunState::Killed
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Unknown, Pending) => true,
            (Pending, Running) | (Pending, Canceled) => true,
            (Running, FinishedOk)
            | (Running, FinishedError)
            | (Running, Interrupted)
            | (Running, Canceled)
            | (Running, Killed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Unknown => "unknown",
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::FinishedOk => "finished_ok",
            RunState::FinishedError => "finished_error",
            RunState::Interrupted => "interrupted",
            RunState::Canceled => "canceled",
            RunState::Killed => "killed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown run state: {0}")]
pub struct ParseRunStateError(String);

impl FromStr for RunState {
    type Err = ParseRunStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unknown" => Ok(RunState::Unknown),
            "pending" => Ok(RunState::Pending),
            "running" => Ok(RunState::Running),
            "finished_ok" | "ok" => Ok(RunState::FinishedOk),
            "finished_error" | "error" => Ok(RunState::FinishedError),
            "interrupted" => Ok(RunState::Interrupted),
            "canceled" | "cancelled" => Ok(RunState::Canceled),
            "killed" => Ok(RunState::Killed),
            _ => Err(ParseRunStateError(s.to_string())),
        }
    }
}
