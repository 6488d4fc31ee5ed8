use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{ExitStatus, JobId, RunState, Timestamps};

/// Point-in-time copy of a root job, detached from the live job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: JobId,
    /// Application name; also the key used to look up the job's listener.
    pub name: String,
    pub owner: String,
    pub working_dir: PathBuf,
    pub state: RunState,
    pub timestamps: Timestamps,
    /// Run time in milliseconds, once started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Index of the step currently (or last) executing.
    pub cursor: usize,
    pub steps: Vec<StepInfo>,
}

/// Point-in-time copy of one process step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInfo {
    pub id: JobId,
    pub root: JobId,
    pub name: String,
    pub command: Vec<String>,
    pub state: RunState,
    pub timestamps: Timestamps,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitStatus>,
    /// OS pid while the process is alive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}
