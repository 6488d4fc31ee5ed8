use thiserror::Error;

use runq_model::{JobId, RunState};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no job listener registered for '{0}'")]
    NoListener(String),

    #[error("illegal transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: RunState,
        to: RunState,
    },

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("already shut down")]
    ShutDown,
}
