use serde::{Deserialize, Serialize};

/// Outcome of running one external-process step, as seen by the launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "code")]
pub enum ExitStatus {
    /// The process ran and exited on its own with this code.
    Normal(i32),
    /// The supervisor's wait was interrupted (pool shutdown or abort-by-name).
    Interrupted,
    /// Anything else: missing directory, spawn/IO failure, pump failure, killed by signal.
    Undefined,
}

impl ExitStatus {
    /// `true` only for a normal exit with code 0.
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Normal(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Normal(code) => Some(*code),
            _ => None,
        }
    }
}
