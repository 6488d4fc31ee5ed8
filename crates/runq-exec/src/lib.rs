mod error;
pub use error::{ExecError, ExecResult};

pub mod limits;
pub use limits::{RlimitConfig, attach_rlimits};

pub mod pump;

pub mod proc;
pub use proc::{ProcessSupervisor, SupervisorConfig};

mod util;
pub use util::{cmd_program, kill_graceful, shell_command};
