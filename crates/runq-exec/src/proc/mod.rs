//! Process supervisor: runs one step as an OS process.
//!
//! stdout and stderr are pumped into the job's buffer concurrently (stderr
//! with a prefix) while the supervisor waits for the process. Once it exits,
//! the pumps are joined with a bounded timeout; a pump still blocked after
//! that (a grandchild holding the pipe open, say) is abandoned.
//!
//! Exit taxonomy: the process's own code → `Normal`, an interrupt of the
//! supervisor's wait → `Interrupted`, everything else → `Undefined`.
use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use runq_core::{ProcessHandle, ProcessStep, RootJob, StepContext, StepExecutor};
use runq_model::ExitStatus;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::{
    error::{ExecError, ExecResult},
    limits::{RlimitConfig, attach_rlimits},
    pump::{LineStream, pump_lines},
    util::{cmd_program, kill_graceful},
};

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Upper bound for draining each output stream after the process exited.
    pub join_timeout: Duration,
    /// Time between SIGTERM and SIGKILL when a step is interrupted.
    pub kill_grace: Duration,
    /// Prefix of stderr lines in the job buffer.
    pub stderr_prefix: String,
    /// Prefix of supervisor error lines in the job buffer.
    pub error_prefix: String,
    /// Extra environment for every spawned process.
    pub env: Vec<(String, String)>,
    pub rlimits: RlimitConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(5),
            kill_grace: Duration::from_millis(500),
            stderr_prefix: "stderr".to_string(),
            error_prefix: "error".to_string(),
            env: Vec::new(),
            rlimits: RlimitConfig::default(),
        }
    }
}

type Pump = JoinHandle<ExecResult<u64>>;

/// How the wait on the child ended.
enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    Killed,
    Interrupted,
}

/// [`StepExecutor`] spawning each step's command line with `tokio::process`.
#[derive(Debug)]
pub struct ProcessSupervisor {
    name: &'static str,
    cfg: SupervisorConfig,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

impl ProcessSupervisor {
    pub fn new(cfg: SupervisorConfig) -> Self {
        Self { name: "proc", cfg }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.cfg
    }

    async fn run(
        &self,
        job: &RootJob,
        step: &ProcessStep,
        ctx: &StepContext,
    ) -> ExecResult<ExitStatus> {
        let dir = job.working_dir();
        if !dir.is_dir() {
            return Err(ExecError::MissingWorkingDir(dir.to_path_buf()));
        }

        let mut cmd = cmd_program(step.program(), step.args());
        cmd.current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &self.cfg.env {
            cmd.env(k, v);
        }
        attach_rlimits(&mut cmd, &self.cfg.rlimits);

        trace!(target: "runq.exec.proc", step = step.id(), command = ?step.command(), "spawn");
        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::Spawn(format!("{}: {e}", step.program())))?;

        let handle = ProcessHandle::new(child.id());
        if !step.attach_process(handle.clone()) {
            debug!(target: "runq.exec.proc", step = step.id(), state = %step.state(), "step stopped before attach; destroying process");
            let _ = child.kill().await;
            return Ok(ExitStatus::Undefined);
        }

        let buffer = job.buffer();
        let pumps = [
            child
                .stdout
                .take()
                .map(|out| pump_lines(out, buffer.clone(), LineStream::Stdout)),
            child.stderr.take().map(|err| {
                pump_lines(
                    err,
                    buffer.clone(),
                    LineStream::Stderr {
                        prefix: self.cfg.stderr_prefix.clone(),
                    },
                )
            }),
        ];

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = handle.kill_requested() => {
                debug!(target: "runq.exec.proc", step = step.id(), "kill requested; destroying process");
                let _ = child.kill().await;
                Waited::Killed
            }
            _ = ctx.interrupt().cancelled() => {
                debug!(target: "runq.exec.proc", step = step.id(), worker = ctx.worker(), "interrupted; terminating process");
                let _ = kill_graceful(&mut child, self.cfg.kill_grace).await;
                Waited::Interrupted
            }
        };
        step.detach_process();

        self.settle(waited, pumps).await
    }

    /// Join the pumps whatever the wait produced, then map it to an exit status.
    async fn settle(&self, waited: Waited, pumps: [Option<Pump>; 2]) -> ExecResult<ExitStatus> {
        let joined = self.join_pumps(pumps).await;
        let status = match waited {
            Waited::Exited(Ok(status)) => status.code().map_or(ExitStatus::Undefined, ExitStatus::Normal),
            Waited::Exited(Err(e)) => return Err(e.into()),
            Waited::Killed => ExitStatus::Undefined,
            Waited::Interrupted => ExitStatus::Interrupted,
        };
        match joined {
            Err(e) if status != ExitStatus::Interrupted => Err(e),
            _ => Ok(status),
        }
    }

    async fn join_pumps(&self, pumps: [Option<Pump>; 2]) -> ExecResult<()> {
        let mut first_err = None;
        for (label, pump) in ["stdout", "stderr"].into_iter().zip(pumps) {
            let Some(mut pump) = pump else {
                continue;
            };
            match tokio::time::timeout(self.cfg.join_timeout, &mut pump).await {
                Ok(Ok(Ok(lines))) => {
                    trace!(target: "runq.exec.proc", stream = label, lines, "pump joined");
                }
                Ok(Ok(Err(e))) => {
                    first_err.get_or_insert(e);
                }
                Ok(Err(join)) => {
                    first_err.get_or_insert(ExecError::Pump {
                        stream: label,
                        reason: join.to_string(),
                    });
                }
                Err(_) => {
                    debug!(target: "runq.exec.proc", stream = label, timeout = ?self.cfg.join_timeout, "pump did not finish; abandoning");
                    pump.abort();
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl StepExecutor for ProcessSupervisor {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn execute(&self, job: &RootJob, step: &ProcessStep, ctx: &StepContext) -> ExitStatus {
        match self.run(job, step, ctx).await {
            Ok(status) => {
                debug!(target: "runq.exec.proc", step = step.id(), ?status, "process ended");
                status
            }
            Err(e) => {
                warn!(target: "runq.exec.proc", job = job.id(), step = step.id(), error = %e, "step failed to run");
                job.buffer().add_prefixed(&self.cfg.error_prefix, &e.to_string());
                ExitStatus::Undefined
            }
        }
    }

    fn kill(&self, step: &ProcessStep) -> bool {
        let (killed, handle) = step.take_for_kill();
        if let Some(handle) = handle {
            handle.request_kill();
        }
        if killed {
            debug!(target: "runq.exec.proc", step = step.id(), "step killed");
        }
        killed
    }
}
