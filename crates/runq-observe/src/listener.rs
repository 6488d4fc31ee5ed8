//! [`JobListener`] that reports every job and step transition to `tracing`.
use runq_core::{JobListener, ProcessStep, RootJob, RunState};
use tracing::{debug, error, info, trace, warn};

#[inline]
pub fn message_for(state: RunState) -> &'static str {
    match state {
        RunState::Unknown => "prepared, not yet submitted",
        RunState::Pending => "queued, waiting for a worker",
        RunState::Running => "running",
        RunState::FinishedOk => "finished successfully",
        RunState::FinishedError => "finished with an error",
        RunState::Interrupted => "interrupted (shutdown or abort)",
        RunState::Canceled => "cancelled before it started",
        RunState::Killed => "killed while running",
    }
}

/// Logs transitions under `runq.observe.job` / `runq.observe.step`.
///
/// Optionally stops a job at its first failing step.
#[derive(Debug, Clone, Default)]
pub struct LoggingListener {
    stop_on_failure: bool,
}

impl LoggingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_on_failure(mut self, stop: bool) -> Self {
        self.stop_on_failure = stop;
        self
    }
}

impl JobListener for LoggingListener {
    fn on_job_event(&self, job: &RootJob) {
        let state = job.state();
        let msg = message_for(state);
        let (id, app, owner) = (job.id(), job.name(), job.owner());

        match state {
            RunState::Unknown => trace!(target: "runq.observe.job", id, app, owner, "{msg}"),
            RunState::Pending => debug!(target: "runq.observe.job", id, app, owner, "{msg}"),
            RunState::Running => {
                info!(target: "runq.observe.job", id, app, owner, steps = job.step_count(), "{msg}")
            }
            RunState::FinishedOk => info!(
                target: "runq.observe.job",
                id,
                app,
                duration_ms = job.context().duration().map(|d| d.as_millis() as u64),
                "{msg}"
            ),
            RunState::FinishedError => error!(
                target: "runq.observe.job",
                id,
                app,
                step = job.cursor(),
                "{msg}"
            ),
            s if s.is_stopped() => warn!(target: "runq.observe.job", id, app, state = %s, "{msg}"),
            _ => {}
        }
    }

    fn on_step_event(&self, job: &RootJob, step: &ProcessStep) {
        let state = step.state();
        let msg = message_for(state);
        let (job_id, id, name) = (job.id(), step.id(), step.name());

        match state {
            RunState::Running => {
                debug!(target: "runq.observe.step", job = job_id, id, name, command = ?step.command(), "{msg}")
            }
            RunState::FinishedError => warn!(
                target: "runq.observe.step",
                job = job_id,
                id,
                name,
                exit = ?step.exit_status(),
                "{msg}"
            ),
            _ => trace!(target: "runq.observe.step", job = job_id, id, name, state = %state, "{msg}"),
        }
    }

    fn on_step_done(&self, _job: &RootJob, step: &ProcessStep) -> bool {
        !(self.stop_on_failure && step.state() == RunState::FinishedError)
    }
}
