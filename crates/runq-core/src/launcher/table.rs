use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use runq_model::{JobId, JobInfo, RunState};

use crate::{context::RootJob, lock::lock};

/// Monitoring table of submitted root jobs, keyed by id.
///
/// Holds the only lock around the queue; every read hands out copies so
/// callers never iterate a live, mutating view.
#[derive(Default)]
pub(crate) struct JobTable {
    jobs: Mutex<BTreeMap<JobId, Arc<RootJob>>>,
}

impl JobTable {
    pub fn insert(&self, job: Arc<RootJob>) {
        lock(&self.jobs).insert(job.id(), job);
    }

    pub fn remove(&self, id: JobId) -> Option<Arc<RootJob>> {
        lock(&self.jobs).remove(&id)
    }

    pub fn get(&self, id: JobId) -> Option<Arc<RootJob>> {
        lock(&self.jobs).get(&id).cloned()
    }

    /// Jobs in creation order (ids are handed out decreasing).
    pub fn jobs(&self) -> Vec<Arc<RootJob>> {
        lock(&self.jobs).values().rev().cloned().collect()
    }

    /// Snapshots of jobs matching both filters, in creation order.
    pub fn query(&self, owner: Option<&str>, state: Option<RunState>) -> Vec<JobInfo> {
        self.jobs()
            .iter()
            .filter(|j| owner.is_none_or(|o| j.owner() == o))
            .filter(|j| state.is_none_or(|s| j.state() == s))
            .map(|j| j.info())
            .collect()
    }

    pub fn count(&self, owner: Option<&str>, pred: impl Fn(RunState) -> bool) -> usize {
        lock(&self.jobs)
            .values()
            .filter(|j| owner.is_none_or(|o| j.owner() == o))
            .filter(|j| pred(j.state()))
            .count()
    }

    pub fn len(&self) -> usize {
        lock(&self.jobs).len()
    }
}
