//! # Single-slot scheduler
//!
//! Each task slot (a [`TaskIdentity`]) holds at most one *current* work item.
//! Submitting new work to a slot first cancels the slot's current item and the
//! current items of every descendant slot declared in the [`TaskGraph`], then
//! installs the new item and hands it to a single worker.
//!
//! ## Invariants
//! - Cancel-then-install runs under the slot-table lock, so no two items are
//!   ever current for one slot.
//! - One worker drains the dispatch queue: ordering across slots is total FIFO.
//! - A finishing item clears its slot only if the slot still points at it
//!   (compare-and-clear); a superseded item never evicts its successor.
//! - Completion is reported only for items whose token was not cancelled by
//!   the time they settle.
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use runq_model::TaskIdentity;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::{error::CoreError, graph::TaskGraph, lock::lock};

pub type WorkId = u64;

pub type WorkFuture = Pin<Box<dyn Future<Output = Result<(), WorkError>> + Send>>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkError {
    #[error("canceled")]
    Canceled,
    #[error("{reason}")]
    Fail { reason: String },
}

impl WorkError {
    pub fn fail(reason: impl Into<String>) -> Self {
        WorkError::Fail {
            reason: reason.into(),
        }
    }
}

/// A unit of background work: an async closure receiving its cancellation token.
pub struct WorkFn {
    name: String,
    f: Box<dyn FnOnce(CancellationToken) -> WorkFuture + Send>,
}

impl WorkFn {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), WorkError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(move |token| -> WorkFuture { Box::pin(f(token)) }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Outcome callbacks. `on_failed` is the error callback; cancellation is
/// reported separately and never as a failure.
pub trait SlotObserver: Send + Sync {
    fn on_finished(&self, _slot: &TaskIdentity, _work: WorkId) {}

    fn on_failed(&self, slot: &TaskIdentity, work: WorkId, reason: &str) {
        error!(target: "runq.core.slot", %slot, work, %reason, "work item failed");
    }

    fn on_cancelled(&self, _slot: &TaskIdentity, _work: WorkId) {}
}

struct LogObserver;

impl SlotObserver for LogObserver {}

struct WorkItem {
    id: WorkId,
    slot: TaskIdentity,
    name: String,
    token: CancellationToken,
    work: Mutex<Option<WorkFn>>,
}

/// Caller-side handle to a submitted work item.
#[derive(Clone, Debug)]
pub struct WorkHandle {
    id: WorkId,
    token: CancellationToken,
}

impl WorkHandle {
    pub fn id(&self) -> WorkId {
        self.id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Clone)]
pub struct SlotScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    graph: Arc<TaskGraph>,
    slots: Mutex<HashMap<TaskIdentity, Arc<WorkItem>>>,
    tx: Mutex<Option<mpsc::UnboundedSender<Arc<WorkItem>>>>,
    observer: Arc<dyn SlotObserver>,
    next_id: AtomicU64,
}

impl SlotScheduler {
    /// Start a scheduler whose outcomes are only logged.
    ///
    /// Must be called from within a tokio runtime: the worker is spawned here.
    pub fn new(graph: Arc<TaskGraph>) -> Self {
        Self::with_observer(graph, Arc::new(LogObserver))
    }

    pub fn with_observer(graph: Arc<TaskGraph>, observer: Arc<dyn SlotObserver>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            graph,
            slots: Mutex::new(HashMap::new()),
            tx: Mutex::new(Some(tx)),
            observer,
            next_id: AtomicU64::new(1),
        });
        tokio::spawn(worker(Arc::clone(&inner), rx));
        Self { inner }
    }

    pub fn graph(&self) -> &Arc<TaskGraph> {
        &self.inner.graph
    }

    /// Supersede the slot's current work (and its descendants') and queue `work`.
    pub fn submit(&self, slot: &TaskIdentity, work: WorkFn) -> Result<WorkHandle, CoreError> {
        let tx = lock(&self.inner.tx).clone().ok_or(CoreError::ShutDown)?;
        let item = self.inner.install(slot, work);
        let handle = item.handle();

        if tx.send(Arc::clone(&item)).is_err() {
            item.token.cancel();
            self.inner.settle(&item);
            return Err(CoreError::ShutDown);
        }
        trace!(target: "runq.core.slot", %slot, work = item.id, name = %item.name, "work queued");
        Ok(handle)
    }

    /// Supersede like [`submit`](Self::submit), then run `work` to completion on
    /// the caller's task.
    pub async fn execute_now(&self, slot: &TaskIdentity, work: WorkFn) -> Result<(), WorkError> {
        let item = self.inner.install(slot, work);
        trace!(target: "runq.core.slot", %slot, work = item.id, "work executing inline");
        self.inner.run(item).await
    }

    /// Empty the slot and cancel what it held. Returns whether anything was cancelled.
    pub fn cancel(&self, slot: &TaskIdentity) -> bool {
        let taken = lock(&self.inner.slots).remove(slot);
        match taken {
            Some(item) => {
                item.token.cancel();
                debug!(target: "runq.core.slot", %slot, work = item.id, "work cancelled");
                true
            }
            None => false,
        }
    }

    /// Id of the slot's current work item.
    pub fn current(&self, slot: &TaskIdentity) -> Option<WorkId> {
        lock(&self.inner.slots).get(slot).map(|item| item.id)
    }

    /// Number of slots with a current work item.
    pub fn active(&self) -> usize {
        lock(&self.inner.slots).len()
    }

    /// Cancel every slot and stop accepting work; the worker exits once the
    /// queue drains.
    pub fn shutdown(&self) {
        lock(&self.inner.tx).take();
        let drained: Vec<Arc<WorkItem>> = lock(&self.inner.slots).drain().map(|(_, v)| v).collect();
        for item in &drained {
            item.token.cancel();
        }
        debug!(target: "runq.core.slot", cancelled = drained.len(), "scheduler shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.inner.tx).is_none()
    }
}

impl WorkItem {
    fn handle(&self) -> WorkHandle {
        WorkHandle {
            id: self.id,
            token: self.token.clone(),
        }
    }
}

impl Inner {
    fn install(&self, slot: &TaskIdentity, work: WorkFn) -> Arc<WorkItem> {
        let item = Arc::new(WorkItem {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            slot: slot.clone(),
            name: work.name.clone(),
            token: CancellationToken::new(),
            work: Mutex::new(Some(work)),
        });

        let cascade = self.graph.descendants(slot);
        let mut slots = lock(&self.slots);
        if let Some(prev) = slots.insert(slot.clone(), Arc::clone(&item)) {
            prev.token.cancel();
            debug!(target: "runq.core.slot", %slot, old = prev.id, new = item.id, "work superseded");
        }
        for child in &cascade {
            if let Some(prev) = slots.remove(child) {
                prev.token.cancel();
                debug!(target: "runq.core.slot", parent = %slot, slot = %child, work = prev.id, "child work cancelled");
            }
        }
        item
    }

    /// Compare-and-clear: empty the slot only if it still holds `item`.
    ///
    /// Returns whether `item` had been cancelled, decided under the same lock
    /// that supersession takes.
    fn settle(&self, item: &Arc<WorkItem>) -> bool {
        let mut slots = lock(&self.slots);
        if slots.get(&item.slot).is_some_and(|cur| Arc::ptr_eq(cur, item)) {
            slots.remove(&item.slot);
        }
        item.token.is_cancelled()
    }

    async fn run(&self, item: Arc<WorkItem>) -> Result<(), WorkError> {
        let work = lock(&item.work).take();
        let outcome = match work {
            Some(work) if !item.token.is_cancelled() => {
                let token = item.token.clone();
                let task = tokio::spawn(async move {
                    let fut = (work.f)(token.clone());
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => Err(WorkError::Canceled),
                        res = fut => res,
                    }
                });
                match task.await {
                    Ok(res) => res,
                    Err(e) if e.is_panic() => Err(WorkError::fail("work item panicked")),
                    Err(_) => Err(WorkError::Canceled),
                }
            }
            _ => Err(WorkError::Canceled),
        };

        let cancelled = self.settle(&item);
        let outcome = match outcome {
            Ok(()) if cancelled => Err(WorkError::Canceled),
            other => other,
        };

        match &outcome {
            Ok(()) => {
                trace!(target: "runq.core.slot", slot = %item.slot, work = item.id, "work finished");
                self.observer.on_finished(&item.slot, item.id);
            }
            Err(WorkError::Canceled) => {
                trace!(target: "runq.core.slot", slot = %item.slot, work = item.id, "work cancelled before completion");
                self.observer.on_cancelled(&item.slot, item.id);
            }
            Err(WorkError::Fail { reason }) => {
                self.observer.on_failed(&item.slot, item.id, reason);
            }
        }
        outcome
    }
}

async fn worker(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<Arc<WorkItem>>) {
    while let Some(item) = rx.recv().await {
        let _ = inner.run(item).await;
    }
    trace!(target: "runq.core.slot", "slot worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::{Notify, mpsc::UnboundedReceiver, mpsc::UnboundedSender};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Outcome {
        Finished(WorkId),
        Failed(WorkId, String),
        Cancelled(WorkId),
    }

    struct Recorder(UnboundedSender<Outcome>);

    impl SlotObserver for Recorder {
        fn on_finished(&self, _slot: &TaskIdentity, work: WorkId) {
            let _ = self.0.send(Outcome::Finished(work));
        }
        fn on_failed(&self, _slot: &TaskIdentity, work: WorkId, reason: &str) {
            let _ = self.0.send(Outcome::Failed(work, reason.to_string()));
        }
        fn on_cancelled(&self, _slot: &TaskIdentity, work: WorkId) {
            let _ = self.0.send(Outcome::Cancelled(work));
        }
    }

    fn scheduler() -> (SlotScheduler, UnboundedReceiver<Outcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let graph = Arc::new(TaskGraph::new());
        (SlotScheduler::with_observer(graph, Arc::new(Recorder(tx))), rx)
    }

    async fn next(rx: &mut UnboundedReceiver<Outcome>) -> Outcome {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no outcome within 5s")
            .expect("observer channel closed")
    }

    fn blocked(gate: Arc<Notify>) -> WorkFn {
        WorkFn::new("blocked", move |_token| async move {
            gate.notified().await;
            Ok(())
        })
    }

    fn instant() -> WorkFn {
        WorkFn::new("instant", |_token| async { Ok(()) })
    }

    #[tokio::test]
    async fn only_last_submission_completes() {
        let (sched, mut rx) = scheduler();
        let slot = TaskIdentity::new("preview");

        let first = sched.submit(&slot, blocked(Arc::new(Notify::new()))).unwrap();
        let mut ids = vec![first.id()];
        for _ in 0..4 {
            ids.push(sched.submit(&slot, instant()).unwrap().id());
        }

        let mut outcomes = Vec::new();
        for _ in 0..5 {
            outcomes.push(next(&mut rx).await);
        }

        let last = *ids.last().unwrap();
        assert_eq!(outcomes.last(), Some(&Outcome::Finished(last)));
        for id in &ids[..4] {
            assert!(outcomes.contains(&Outcome::Cancelled(*id)));
        }
        assert_eq!(sched.current(&slot), None);
    }

    #[tokio::test]
    async fn late_finisher_does_not_clear_successor() {
        let (sched, _rx) = scheduler();
        let slot = TaskIdentity::new("slot");

        let a = sched.inner.install(&slot, instant());
        let b = sched.inner.install(&slot, instant());

        assert!(sched.inner.settle(&a), "a was superseded, so it is cancelled");
        assert_eq!(sched.current(&slot), Some(b.id));

        assert!(!sched.inner.settle(&b));
        assert_eq!(sched.current(&slot), None);
    }

    #[tokio::test]
    async fn superseded_item_keeps_successor_current() {
        let (sched, mut rx) = scheduler();
        let slot = TaskIdentity::new("slot");
        let gate_b = Arc::new(Notify::new());

        let a = sched.submit(&slot, blocked(Arc::new(Notify::new()))).unwrap();
        let b = sched.submit(&slot, blocked(Arc::clone(&gate_b))).unwrap();

        assert_eq!(next(&mut rx).await, Outcome::Cancelled(a.id()));
        assert_eq!(sched.current(&slot), Some(b.id()));

        gate_b.notify_one();
        assert_eq!(next(&mut rx).await, Outcome::Finished(b.id()));
        assert_eq!(sched.current(&slot), None);
    }

    #[tokio::test]
    async fn submit_cascades_to_children() {
        let graph = Arc::new(TaskGraph::new());
        let parent = TaskIdentity::new("parent");
        let child = TaskIdentity::new("child");
        graph.register(parent.clone());
        graph.register(child.clone());
        graph.set_children(&parent, [child.clone()]).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sched = SlotScheduler::with_observer(graph, Arc::new(Recorder(tx)));

        let c = sched.submit(&child, blocked(Arc::new(Notify::new()))).unwrap();
        let p = sched.submit(&parent, instant()).unwrap();

        assert!(c.is_cancelled());
        assert_eq!(sched.current(&child), None);
        assert_eq!(next(&mut rx).await, Outcome::Cancelled(c.id()));
        assert_eq!(next(&mut rx).await, Outcome::Finished(p.id()));
    }

    #[tokio::test]
    async fn cancel_reports_whether_something_was_cancelled() {
        let (sched, mut rx) = scheduler();
        let slot = TaskIdentity::new("slot");
        assert!(!sched.cancel(&slot));

        let h = sched.submit(&slot, blocked(Arc::new(Notify::new()))).unwrap();
        assert!(sched.cancel(&slot));
        assert!(h.is_cancelled());
        assert!(!sched.cancel(&slot));
        assert_eq!(next(&mut rx).await, Outcome::Cancelled(h.id()));
    }

    #[tokio::test]
    async fn failures_and_panics_reach_the_error_callback() {
        let (sched, mut rx) = scheduler();
        let a = TaskIdentity::new("a");
        let b = TaskIdentity::new("b");

        let failing = sched
            .submit(&a, WorkFn::new("fail", |_| async { Err(WorkError::fail("bad input")) }))
            .unwrap();
        let panicking = sched
            .submit(
                &b,
                WorkFn::new("panic", |_| async {
                    if true {
                        panic!("boom");
                    }
                    Ok(())
                }),
            )
            .unwrap();

        assert_eq!(
            next(&mut rx).await,
            Outcome::Failed(failing.id(), "bad input".into())
        );
        assert_eq!(
            next(&mut rx).await,
            Outcome::Failed(panicking.id(), "work item panicked".into())
        );

        // The worker survives a panicking item.
        let ok = sched.submit(&a, instant()).unwrap();
        assert_eq!(next(&mut rx).await, Outcome::Finished(ok.id()));
    }

    #[tokio::test]
    async fn dispatch_is_fifo_across_slots() {
        let (sched, mut rx) = scheduler();
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["a", "b", "c", "d"] {
            let order = Arc::clone(&order);
            sched
                .submit(
                    &TaskIdentity::new(name),
                    WorkFn::new(name, move |_| async move {
                        lock(&order).push(name);
                        Ok(())
                    }),
                )
                .unwrap();
        }
        for _ in 0..4 {
            next(&mut rx).await;
        }
        assert_eq!(*lock(&order), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn execute_now_supersedes_and_blocks() {
        let (sched, mut rx) = scheduler();
        let slot = TaskIdentity::new("slot");

        let queued = sched.submit(&slot, blocked(Arc::new(Notify::new()))).unwrap();
        let res = sched
            .execute_now(&slot, WorkFn::new("now", |_| async { Ok(()) }))
            .await;

        assert_eq!(res, Ok(()));
        assert!(queued.is_cancelled());
        assert_eq!(sched.current(&slot), None);

        let mut seen = vec![next(&mut rx).await, next(&mut rx).await];
        seen.sort_by_key(|o| matches!(o, Outcome::Finished(_)));
        assert_eq!(seen[0], Outcome::Cancelled(queued.id()));
    }

    #[tokio::test]
    async fn cancelling_running_item_reports_cancelled() {
        let (sched, mut rx) = scheduler();
        let slot = TaskIdentity::new("slot");
        let started = Arc::new(Notify::new());
        let started_tx = Arc::clone(&started);

        let h = sched
            .submit(
                &slot,
                WorkFn::new("loop", move |token| async move {
                    started_tx.notify_one();
                    token.cancelled().await;
                    Err(WorkError::Canceled)
                }),
            )
            .unwrap();
        started.notified().await;
        assert!(sched.cancel(&slot));

        assert_eq!(next(&mut rx).await, Outcome::Cancelled(h.id()));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let (sched, mut rx) = scheduler();
        let slot = TaskIdentity::new("slot");
        let h = sched.submit(&slot, blocked(Arc::new(Notify::new()))).unwrap();

        sched.shutdown();
        assert!(sched.is_shut_down());
        assert!(h.is_cancelled());
        assert!(matches!(sched.submit(&slot, instant()), Err(CoreError::ShutDown)));
        assert_eq!(next(&mut rx).await, Outcome::Cancelled(h.id()));
    }
}
