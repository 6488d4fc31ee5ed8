mod run_state;
pub use run_state::{ParseRunStateError, RunState};

mod exit_status;
pub use exit_status::ExitStatus;

mod task_identity;
pub use task_identity::TaskIdentity;

mod timestamps;
pub use timestamps::Timestamps;

mod job_info;
pub use job_info::{JobInfo, StepInfo};

/// Identifier of a schedulable unit (root job or step).
///
/// Ids are handed out by a launcher counter that starts at `-1` and decreases,
/// so every live id is negative and unique within that launcher.
pub type JobId = i64;
