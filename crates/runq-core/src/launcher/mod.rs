//! # Job queue and launcher
//!
//! Accepts root jobs, runs their steps one after another on a bounded worker
//! pool, and keeps a monitoring table of submitted jobs for inspection and
//! cancellation.
//!
//! ## Flow
//! ```text
//! prepare_root_job -> prepare_step* -> submit
//!   Pending  --(permit)-->  Running  --steps-->  FinishedOk | FinishedError
//!      \-- cancel --> Canceled    \-- kill --> Killed    \-- shutdown/abort --> Interrupted
//! ```
//!
//! ## Rules
//! - Steps of one job run strictly in order, never concurrently, at most
//!   `max_steps` of them.
//! - After each step the listener decides whether to go on.
//! - Cleanup (buffer close, table eviction, completion signal) runs on every
//!   exit path of the job's worker.
mod table;

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc, RwLock,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
};

use runq_model::{ExitStatus, JobId, JobInfo, RunState};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    buffer::BoundedLogBuffer,
    cancel::AbortRegistry,
    context::{ProcessStep, RootJob, RunContext},
    error::CoreError,
    executor::{StepContext, StepExecutor},
    lock,
};
use table::JobTable;

/// Callbacks for one application's jobs.
///
/// Invoked on the job's worker task (and synchronously from `submit` for the
/// PENDING transition); keep them short.
pub trait JobListener: Send + Sync {
    fn on_job_event(&self, job: &RootJob);

    fn on_step_event(&self, job: &RootJob, step: &ProcessStep);

    /// Called after each finished step; returning `false` stops the job
    /// without running the remaining steps.
    fn on_step_done(&self, _job: &RootJob, _step: &ProcessStep) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Root jobs allowed to run at the same time.
    pub workers: usize,
    /// Lines kept by each job's log buffer.
    pub buffer_capacity: usize,
    /// Hard cap on steps executed per job.
    pub max_steps: usize,
    /// Keep finished jobs in the table until `remove_from_queue`.
    pub manual_removal: bool,
    /// Prefix of lines the launcher itself writes into a job buffer.
    pub log_prefix: String,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            buffer_capacity: 100,
            max_steps: 10,
            manual_removal: false,
            log_prefix: "runq".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct Launcher {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: LauncherConfig,
    executor: Arc<dyn StepExecutor>,
    listeners: RwLock<HashMap<String, Arc<dyn JobListener>>>,
    table: JobTable,
    next_id: AtomicI64,
    total_submitted: AtomicU64,
    ever_queued: AtomicU64,
    pool: Arc<Semaphore>,
    shutdown: CancellationToken,
    aborts: AbortRegistry,
}

impl Launcher {
    pub fn new(cfg: LauncherConfig, executor: Arc<dyn StepExecutor>) -> Self {
        let pool = Arc::new(Semaphore::new(cfg.workers.max(1)));
        Self {
            inner: Arc::new(Inner {
                cfg,
                executor,
                listeners: RwLock::new(HashMap::new()),
                table: JobTable::default(),
                next_id: AtomicI64::new(-1),
                total_submitted: AtomicU64::new(0),
                ever_queued: AtomicU64::new(0),
                pool,
                shutdown: CancellationToken::new(),
                aborts: AbortRegistry::new(),
            }),
        }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.inner.cfg
    }

    /// Register the listener used for jobs named `app_name`. Returns `true`
    /// if it replaced an earlier one.
    pub fn register_listener(&self, app_name: impl Into<String>, listener: Arc<dyn JobListener>) -> bool {
        let app_name = app_name.into();
        let replaced = lock::write(&self.inner.listeners)
            .insert(app_name.clone(), listener)
            .is_some();
        debug!(target: "runq.core.launcher", app = %app_name, replaced, "listener registered");
        replaced
    }

    pub fn unregister_listener(&self, app_name: &str) -> bool {
        lock::write(&self.inner.listeners).remove(app_name).is_some()
    }

    /// Create a root job with its own log buffer, mirrored to `log_file` when given.
    pub fn prepare_root_job(
        &self,
        app_name: impl Into<String>,
        owner: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        log_file: Option<PathBuf>,
    ) -> Arc<RootJob> {
        let mut buffer = BoundedLogBuffer::new(self.inner.cfg.buffer_capacity);
        if let Some(path) = log_file {
            buffer = buffer.with_mirror(path);
        }
        let job = RootJob::new(
            self.inner.allocate_id(),
            app_name,
            owner,
            working_dir,
            Arc::new(buffer),
        );
        debug!(target: "runq.core.launcher", id = job.id(), app = %job.name(), "root job prepared");
        Arc::new(job)
    }

    /// Append a process step to `job`. The step shares the job's buffer and starts PENDING.
    pub fn prepare_step(
        &self,
        job: &Arc<RootJob>,
        name: impl Into<String>,
        command: Vec<String>,
    ) -> Result<Arc<ProcessStep>, CoreError> {
        let name = name.into();
        if command.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(CoreError::InvalidArgument(format!(
                "step '{name}' has an empty command"
            )));
        }

        let ctx = RunContext::new(
            self.inner.allocate_id(),
            name,
            Some(job.id()),
            Arc::clone(job.buffer()),
        );
        ctx.transition(RunState::Pending)?;
        let step = Arc::new(ProcessStep::new(ctx, command));
        job.push_step(Arc::clone(&step));
        Ok(step)
    }

    /// Queue `job` using the listener registered for its name.
    pub fn submit(&self, job: &Arc<RootJob>) -> Result<(), CoreError> {
        let listener = lock::read(&self.inner.listeners)
            .get(job.name())
            .cloned()
            .ok_or_else(|| CoreError::NoListener(job.name().to_string()))?;
        self.submit_with(job, listener)
    }

    /// Queue `job` with an explicit listener.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(level = "debug", skip_all, fields(id = job.id(), app = %job.name()))]
    pub fn submit_with(&self, job: &Arc<RootJob>, listener: Arc<dyn JobListener>) -> Result<(), CoreError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CoreError::ShutDown);
        }
        job.context().transition(RunState::Pending)?;

        self.inner.table.insert(Arc::clone(job));
        self.inner.total_submitted.fetch_add(1, Ordering::Relaxed);
        self.inner.ever_queued.fetch_add(1, Ordering::Relaxed);
        listener.on_job_event(job);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(inner.run_job(Arc::clone(job), listener));
        debug!(target: "runq.core.launcher", "job queued");
        Ok(())
    }

    /// Cancel a PENDING job or kill a RUNNING one; the job's buffer is released
    /// either way.
    pub fn cancel_or_kill(&self, id: JobId) -> bool {
        let Some(job) = self.inner.table.get(id) else {
            return false;
        };
        let done = self.inner.cancel_pending(&job) || self.inner.kill_running(&job);
        job.close();
        done
    }

    /// Cancel `id` only if it has not started yet.
    pub fn cancel(&self, id: JobId) -> bool {
        let Some(job) = self.inner.table.get(id) else {
            return false;
        };
        let done = self.inner.cancel_pending(&job);
        if done {
            job.close();
        }
        done
    }

    /// Kill `id` only if it is running.
    pub fn kill(&self, id: JobId) -> bool {
        let Some(job) = self.inner.table.get(id) else {
            return false;
        };
        let done = self.inner.kill_running(&job);
        if done {
            job.close();
        }
        done
    }

    /// Interrupt the job whose worker is registered as `worker`.
    pub fn abort(&self, worker: &str) -> bool {
        self.inner.aborts.abort(worker)
    }

    pub fn aborts(&self) -> &AbortRegistry {
        &self.inner.aborts
    }

    pub fn get(&self, id: JobId) -> Option<Arc<RootJob>> {
        self.inner.table.get(id)
    }

    pub fn remove_from_queue(&self, id: JobId) -> Option<Arc<RootJob>> {
        self.inner.table.remove(id)
    }

    /// Copy of the monitored jobs, in creation order.
    pub fn jobs(&self) -> Vec<Arc<RootJob>> {
        self.inner.table.jobs()
    }

    pub fn queue_snapshot(&self) -> Vec<JobInfo> {
        self.inner.table.query(None, None)
    }

    pub fn query(&self, owner: Option<&str>, state: Option<RunState>) -> Vec<JobInfo> {
        self.inner.table.query(owner, state)
    }

    /// PENDING or RUNNING jobs, optionally for one owner.
    pub fn count_active(&self, owner: Option<&str>) -> usize {
        self.inner.table.count(owner, |s| s.is_active())
    }

    /// PENDING jobs only, optionally for one owner.
    pub fn count_queued(&self, owner: Option<&str>) -> usize {
        self.inner.table.count(owner, |s| s == RunState::Pending)
    }

    pub fn total_submitted(&self) -> u64 {
        self.inner.total_submitted.load(Ordering::Relaxed)
    }

    /// Cumulative count of jobs that ever entered the queue.
    pub fn ever_queued(&self) -> u64 {
        self.inner.ever_queued.load(Ordering::Relaxed)
    }

    /// Jobs currently waiting for a worker.
    pub fn currently_queued(&self) -> usize {
        self.count_queued(None)
    }

    /// Stop accepting jobs, cancel the pending ones and interrupt the running ones.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.pool.close();
        let interrupted = self.inner.aborts.abort_all();
        info!(target: "runq.core.launcher", interrupted, "launcher shutting down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

/// Runs on every exit path of a job's worker.
struct Finish {
    inner: Arc<Inner>,
    job: Arc<RootJob>,
}

impl Drop for Finish {
    fn drop(&mut self) {
        self.job.close();
        if !self.inner.cfg.manual_removal {
            self.inner.table.remove(self.job.id());
        }
        self.job.mark_done();
        debug!(target: "runq.core.launcher", id = self.job.id(), state = %self.job.state(), "job finished");
    }
}

impl Inner {
    fn allocate_id(&self) -> JobId {
        self.next_id.fetch_sub(1, Ordering::Relaxed)
    }

    fn cancel_pending(&self, job: &RootJob) -> bool {
        if !job.context().transition_from(RunState::Pending, RunState::Canceled) {
            return false;
        }
        job.cancel_token().cancel();
        info!(target: "runq.core.launcher", id = job.id(), "pending job cancelled");
        true
    }

    fn kill_running(&self, job: &RootJob) -> bool {
        if !job.context().transition_from(RunState::Running, RunState::Killed) {
            return false;
        }
        if let Some(step) = job.current_step() {
            self.executor.kill(&step);
        }
        info!(target: "runq.core.launcher", id = job.id(), "running job killed");
        true
    }

    async fn run_job(self: Arc<Self>, job: Arc<RootJob>, listener: Arc<dyn JobListener>) {
        let _finish = Finish {
            inner: Arc::clone(&self),
            job: Arc::clone(&job),
        };

        let permit = tokio::select! {
            biased;
            _ = job.cancel_token().cancelled() => None,
            _ = self.shutdown.cancelled() => None,
            permit = Arc::clone(&self.pool).acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            job.context()
                .transition_from(RunState::Pending, RunState::Canceled);
            listener.on_job_event(&job);
            return;
        };

        // Registered before RUNNING so shutdown's abort_all cannot miss the job;
        // a shutdown that ran before registration is caught by the re-check.
        let worker = format!("{}{}", job.name(), job.id());
        let _abort = self.aborts.register(worker.clone(), job.interrupt().clone());
        if self.shutdown.is_cancelled() {
            job.interrupt().cancel();
        }
        let ctx = StepContext::new(worker, job.interrupt().clone());

        if let Err(e) = job.context().transition(RunState::Running) {
            debug!(target: "runq.core.launcher", id = job.id(), error = %e, "job not started");
            listener.on_job_event(&job);
            return;
        }
        if let Err(e) = job.buffer().prepare() {
            warn!(target: "runq.core.launcher", id = job.id(), error = %e, "log mirror unavailable");
        }
        info!(target: "runq.core.launcher", id = job.id(), app = %job.name(), steps = job.step_count(), "job started");
        listener.on_job_event(&job);

        let outcome = self.run_steps(&job, listener.as_ref(), &ctx).await;
        if job.context().try_transition(outcome) {
            info!(target: "runq.core.launcher", id = job.id(), state = %outcome, "job ended");
        }
        listener.on_job_event(&job);
    }

    async fn run_steps(&self, job: &RootJob, listener: &dyn JobListener, ctx: &StepContext) -> RunState {
        let mut failed = false;
        let mut index = 0;

        loop {
            if job.state().is_terminal() {
                break;
            }
            if ctx.interrupt().is_cancelled() || self.shutdown.is_cancelled() {
                return RunState::Interrupted;
            }
            let Some(step) = job.step(index) else {
                break;
            };
            if index >= self.cfg.max_steps {
                let skipped = job.step_count() - index;
                warn!(target: "runq.core.launcher", id = job.id(), max = self.cfg.max_steps, skipped, "step limit reached");
                job.buffer().add_prefixed(
                    &self.cfg.log_prefix,
                    &format!("step limit of {} reached; {skipped} step(s) not run", self.cfg.max_steps),
                );
                break;
            }
            job.set_cursor(index);

            {
                let _mask = ctx.interrupt().mask();
                if let Err(e) = step.context().transition(RunState::Running) {
                    debug!(target: "runq.core.launcher", step = step.id(), error = %e, "step skipped");
                    index += 1;
                    continue;
                }
                if job.state().is_terminal() {
                    step.context().try_transition(RunState::Killed);
                    listener.on_step_event(job, &step);
                    break;
                }
                listener.on_step_event(job, &step);
            }

            let status = self.executor.execute(job, &step, ctx).await;

            let proceed = {
                let _mask = ctx.interrupt().mask();
                step.set_exit(status);
                let next = match status {
                    s if s.is_success() => RunState::FinishedOk,
                    ExitStatus::Interrupted => RunState::Interrupted,
                    _ => RunState::FinishedError,
                };
                step.context().try_transition(next);
                debug!(target: "runq.core.launcher", step = step.id(), state = %step.state(), ?status, "step ended");
                listener.on_step_event(job, &step);

                match step.state() {
                    RunState::FinishedError => failed = true,
                    RunState::Interrupted => return RunState::Interrupted,
                    _ => {}
                }
                !job.state().is_terminal() && listener.on_step_done(job, &step)
            };
            if !proceed {
                break;
            }
            index += 1;
        }

        if failed {
            RunState::FinishedError
        } else {
            RunState::FinishedOk
        }
    }
}
