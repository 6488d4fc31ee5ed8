pub mod error;
pub use error::CoreError;

mod lock;

pub mod buffer;
pub use buffer::BoundedLogBuffer;

pub mod graph;
pub use graph::TaskGraph;

pub mod cancel;
pub use cancel::{AbortGuard, AbortRegistry, MaskGuard, MaskableToken};

pub mod slot;
pub use slot::{SlotObserver, SlotScheduler, WorkError, WorkFn, WorkHandle, WorkId};

pub mod context;
pub use context::{ProcessHandle, ProcessStep, RootJob, RunContext};

pub mod executor;
pub use executor::{StepContext, StepExecutor};

pub mod launcher;
pub use launcher::{JobListener, Launcher, LauncherConfig};

pub use runq_model::{ExitStatus, JobId, JobInfo, RunState, StepInfo, TaskIdentity, Timestamps};
