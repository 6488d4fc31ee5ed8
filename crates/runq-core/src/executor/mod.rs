use async_trait::async_trait;
use runq_model::ExitStatus;

use crate::{
    cancel::MaskableToken,
    context::{ProcessStep, RootJob},
};

/// Per-run context handed to an executor by the launcher.
#[derive(Clone, Debug)]
pub struct StepContext {
    worker: String,
    interrupt: MaskableToken,
}

impl StepContext {
    pub fn new(worker: impl Into<String>, interrupt: MaskableToken) -> Self {
        Self {
            worker: worker.into(),
            interrupt,
        }
    }

    /// Name under which the job's worker is registered for abort-by-name.
    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Fires on pool shutdown or abort-by-name; the executor should stop and
    /// report [`ExitStatus::Interrupted`].
    pub fn interrupt(&self) -> &MaskableToken {
        &self.interrupt
    }
}

/// Executes the steps of a root job.
///
/// The launcher calls `execute` for one step at a time and never concurrently
/// for the same job. `kill` may be called from any thread while `execute` runs.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run `step` to completion. Failures are reported through the returned
    /// status, never as a panic or error.
    async fn execute(&self, job: &RootJob, step: &ProcessStep, ctx: &StepContext) -> ExitStatus;

    /// Forcibly terminate `step` if it is running. Idempotent.
    fn kill(&self, step: &ProcessStep) -> bool;
}
