//! Schedulable units and their lifecycle state machine.
//!
//! [`RunContext`] carries the state shared by root jobs and their steps: id,
//! display name, [`RunState`] and the timestamps every transition stamps.
//! [`RootJob`] owns its [`ProcessStep`]s and the [`BoundedLogBuffer`] they share.
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime},
};

use runq_model::{ExitStatus, JobId, JobInfo, RunState, StepInfo, Timestamps};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::trace;

use crate::{
    buffer::BoundedLogBuffer,
    cancel::MaskableToken,
    error::CoreError,
    lock::{self, lock},
};

struct StateCell {
    state: RunState,
    timestamps: Timestamps,
}

pub struct RunContext {
    id: JobId,
    name: String,
    root: Option<JobId>,
    buffer: Arc<BoundedLogBuffer>,
    cell: Mutex<StateCell>,
}

impl RunContext {
    pub(crate) fn new(
        id: JobId,
        name: impl Into<String>,
        root: Option<JobId>,
        buffer: Arc<BoundedLogBuffer>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            root,
            buffer,
            cell: Mutex::new(StateCell {
                state: RunState::Unknown,
                timestamps: Timestamps::new(),
            }),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the owning root job; `None` for a root job itself.
    pub fn root_id(&self) -> Option<JobId> {
        self.root
    }

    pub fn buffer(&self) -> &Arc<BoundedLogBuffer> {
        &self.buffer
    }

    pub fn state(&self) -> RunState {
        lock(&self.cell).state
    }

    pub fn timestamps(&self) -> Timestamps {
        lock(&self.cell).timestamps
    }

    pub fn duration(&self) -> Option<Duration> {
        lock(&self.cell).timestamps.duration()
    }

    /// Move to `next`, stamping the matching timestamp. Returns the previous state.
    pub fn transition(&self, next: RunState) -> Result<RunState, CoreError> {
        let mut cell = lock(&self.cell);
        self.apply(&mut cell, next)
    }

    /// Move to `next` only if the current state is `expected`.
    pub fn transition_from(&self, expected: RunState, next: RunState) -> bool {
        let mut cell = lock(&self.cell);
        cell.state == expected && self.apply(&mut cell, next).is_ok()
    }

    /// Like [`transition`](Self::transition), discarding the error.
    pub fn try_transition(&self, next: RunState) -> bool {
        self.transition(next).is_ok()
    }

    fn apply(&self, cell: &mut StateCell, next: RunState) -> Result<RunState, CoreError> {
        let from = cell.state;
        if !from.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                id: self.id,
                from,
                to: next,
            });
        }

        let now = SystemTime::now();
        match next {
            RunState::Pending => cell.timestamps.queued = Some(now),
            RunState::Running => cell.timestamps.started = Some(now),
            s if s.is_terminal() => cell.timestamps.ended = Some(now),
            _ => {}
        }
        cell.state = next;
        trace!(target: "runq.core.state", id = self.id, name = %self.name, %from, to = %next, "transition");
        Ok(from)
    }

    fn duration_ms(ts: &Timestamps) -> Option<u64> {
        ts.duration().map(|d| d.as_millis() as u64)
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Opaque handle to a live OS process owned by a step.
#[derive(Clone, Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill: CancellationToken,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            kill: CancellationToken::new(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask whoever is waiting on the process to destroy it.
    pub fn request_kill(&self) {
        self.kill.cancel();
    }

    pub fn kill_requested(&self) -> WaitForCancellationFuture<'_> {
        self.kill.cancelled()
    }
}

/// One external-process invocation belonging to a root job.
#[derive(Debug)]
pub struct ProcessStep {
    ctx: RunContext,
    command: Vec<String>,
    process: Mutex<Option<ProcessHandle>>,
    exit: Mutex<Option<ExitStatus>>,
}

impl ProcessStep {
    pub(crate) fn new(ctx: RunContext, command: Vec<String>) -> Self {
        Self {
            ctx,
            command,
            process: Mutex::new(None),
            exit: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn id(&self) -> JobId {
        self.ctx.id()
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn state(&self) -> RunState {
        self.ctx.state()
    }

    /// Full command line: program followed by arguments.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }

    /// Handle of the live process, if one is attached.
    pub fn process(&self) -> Option<ProcessHandle> {
        lock(&self.process).clone()
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.process).as_ref().and_then(ProcessHandle::pid)
    }

    /// Attach a freshly spawned process.
    ///
    /// Refused (returns `false`) unless the step is RUNNING; the caller must
    /// then destroy the process itself.
    pub fn attach_process(&self, handle: ProcessHandle) -> bool {
        let mut process = lock(&self.process);
        if self.ctx.state() != RunState::Running {
            return false;
        }
        *process = Some(handle);
        true
    }

    /// Drop the handle once the process is gone.
    pub fn detach_process(&self) -> Option<ProcessHandle> {
        lock(&self.process).take()
    }

    /// Mark the step KILLED and hand back its process handle.
    ///
    /// Both happen under the process lock, so a concurrent
    /// [`attach_process`](Self::attach_process) either lands first (and its
    /// handle is returned here) or is refused.
    pub fn take_for_kill(&self) -> (bool, Option<ProcessHandle>) {
        let mut process = lock(&self.process);
        let killed = self.ctx.transition_from(RunState::Running, RunState::Killed);
        (killed, process.take())
    }

    pub fn set_exit(&self, status: ExitStatus) {
        *lock(&self.exit) = Some(status);
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        *lock(&self.exit)
    }

    pub fn info(&self) -> StepInfo {
        let timestamps = self.ctx.timestamps();
        StepInfo {
            id: self.ctx.id(),
            root: self.ctx.root_id().unwrap_or_default(),
            name: self.ctx.name().to_string(),
            command: self.command.clone(),
            state: self.ctx.state(),
            duration_ms: RunContext::duration_ms(&timestamps),
            timestamps,
            exit: self.exit_status(),
            pid: self.pid(),
        }
    }
}

/// A user-submitted unit of work made of sequential process steps.
pub struct RootJob {
    ctx: RunContext,
    owner: String,
    working_dir: PathBuf,
    steps: RwLock<Vec<Arc<ProcessStep>>>,
    cursor: AtomicUsize,
    /// Cancels the job's pending dispatch.
    cancel: CancellationToken,
    /// Interrupts the running step (pool shutdown or abort-by-name).
    interrupt: MaskableToken,
    /// Fires once the job's worker has finished all bookkeeping.
    done: CancellationToken,
}

impl RootJob {
    pub(crate) fn new(
        id: JobId,
        name: impl Into<String>,
        owner: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        buffer: Arc<BoundedLogBuffer>,
    ) -> Self {
        Self {
            ctx: RunContext::new(id, name, None, buffer),
            owner: owner.into(),
            working_dir: working_dir.into(),
            steps: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            interrupt: MaskableToken::new(),
            done: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn id(&self) -> JobId {
        self.ctx.id()
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn state(&self) -> RunState {
        self.ctx.state()
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn buffer(&self) -> &Arc<BoundedLogBuffer> {
        self.ctx.buffer()
    }

    /// Copy of the step list.
    pub fn steps(&self) -> Vec<Arc<ProcessStep>> {
        lock::read(&self.steps).clone()
    }

    pub fn step(&self, index: usize) -> Option<Arc<ProcessStep>> {
        lock::read(&self.steps).get(index).cloned()
    }

    pub fn step_count(&self) -> usize {
        lock::read(&self.steps).len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn current_step(&self) -> Option<Arc<ProcessStep>> {
        self.step(self.cursor())
    }

    /// Release the buffer's file handle and scratch space.
    pub fn close(&self) {
        self.buffer().close();
    }

    /// Resolves once the job has ended and its cleanup has run.
    pub fn completed(&self) -> WaitForCancellationFuture<'_> {
        self.done.cancelled()
    }

    pub fn is_completed(&self) -> bool {
        self.done.is_cancelled()
    }

    pub fn info(&self) -> JobInfo {
        let timestamps = self.ctx.timestamps();
        JobInfo {
            id: self.ctx.id(),
            name: self.ctx.name().to_string(),
            owner: self.owner.clone(),
            working_dir: self.working_dir.clone(),
            state: self.ctx.state(),
            duration_ms: RunContext::duration_ms(&timestamps),
            timestamps,
            cursor: self.cursor(),
            steps: self.steps().iter().map(|s| s.info()).collect(),
        }
    }

    pub(crate) fn push_step(&self, step: Arc<ProcessStep>) {
        lock::write(&self.steps).push(step);
    }

    pub(crate) fn set_cursor(&self, index: usize) {
        self.cursor.store(index, Ordering::Release);
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn interrupt(&self) -> &MaskableToken {
        &self.interrupt
    }

    pub(crate) fn mark_done(&self) {
        self.done.cancel();
    }
}

impl std::fmt::Debug for RootJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootJob")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("owner", &self.owner)
            .field("state", &self.state())
            .field("steps", &self.step_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RunContext {
        RunContext::new(-1, "job", None, Arc::new(BoundedLogBuffer::new(4)))
    }

    #[test]
    fn happy_path_stamps_every_mark() {
        let c = ctx();
        assert_eq!(c.state(), RunState::Unknown);

        c.transition(RunState::Pending).unwrap();
        assert!(c.timestamps().queued.is_some());
        c.transition(RunState::Running).unwrap();
        assert!(c.timestamps().started.is_some());
        assert!(c.timestamps().ended.is_none());
        c.transition(RunState::FinishedOk).unwrap();

        let ts = c.timestamps();
        assert!(ts.ended.is_some());
        assert!(ts.queued.unwrap() <= ts.started.unwrap());
        assert!(c.duration().is_some());
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let c = ctx();
        let err = c.transition(RunState::Running).unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidTransition {
                id: -1,
                from: RunState::Unknown,
                to: RunState::Running
            }
        ));
        assert_eq!(c.state(), RunState::Unknown);
    }

    #[test]
    fn first_terminal_state_wins() {
        let c = ctx();
        c.transition(RunState::Pending).unwrap();
        c.transition(RunState::Running).unwrap();
        assert!(c.try_transition(RunState::Killed));
        assert!(!c.try_transition(RunState::FinishedError));
        assert_eq!(c.state(), RunState::Killed);
    }

    #[test]
    fn transition_from_checks_expected_state() {
        let c = ctx();
        c.transition(RunState::Pending).unwrap();
        c.transition(RunState::Running).unwrap();
        assert!(!c.transition_from(RunState::Pending, RunState::Canceled));
        assert_eq!(c.state(), RunState::Running);
    }

    #[test]
    fn attach_is_refused_unless_running() {
        let buf = Arc::new(BoundedLogBuffer::new(4));
        let step = ProcessStep::new(
            RunContext::new(-2, "s", Some(-1), buf),
            vec!["true".into()],
        );
        assert!(!step.attach_process(ProcessHandle::new(Some(1))));

        step.context().transition(RunState::Pending).unwrap();
        step.context().transition(RunState::Running).unwrap();
        assert!(step.attach_process(ProcessHandle::new(Some(42))));
        assert_eq!(step.pid(), Some(42));

        let (killed, handle) = step.take_for_kill();
        assert!(killed);
        assert_eq!(handle.and_then(|h| h.pid()), Some(42));
        assert!(step.process().is_none());

        let (again, none) = step.take_for_kill();
        assert!(!again);
        assert!(none.is_none());
        assert_eq!(step.state(), RunState::Killed);
    }

    #[test]
    fn step_splits_program_and_args() {
        let buf = Arc::new(BoundedLogBuffer::new(4));
        let step = ProcessStep::new(
            RunContext::new(-2, "s", Some(-1), buf),
            vec!["echo".into(), "a".into(), "b".into()],
        );
        assert_eq!(step.program(), "echo");
        assert_eq!(step.args(), ["a".to_string(), "b".to_string()]);
        assert_eq!(step.info().root, -1);
    }
}
