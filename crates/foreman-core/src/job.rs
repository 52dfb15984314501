use crate::spec::RepoState;
use crate::task::{TaskKey, TaskStatus, TaskSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unique job identifier, assigned by the store's id counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Derived status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    InProgress,
    Success,
    Failure,
    Mishap,
    Canceled,
}

impl JobStatus {
    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::InProgress => "in-progress",
            JobStatus::Success => "success",
            JobStatus::Failure => "failure",
            JobStatus::Mishap => "mishap",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_done(&self) -> bool {
        !matches!(self, JobStatus::InProgress)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A user-facing unit of work: one job spec instantiated at a RepoState.
///
/// `dependencies` is the transitive closure of task-spec names the job
/// needs; `tasks` holds the per-spec task summaries folded in by the job
/// status updater.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub repo_state: RepoState,
    pub created: DateTime<Utc>,
    pub dependencies: Vec<String>,
    pub status: JobStatus,
    /// Manually forced jobs get their own task-key namespace and a high
    /// base score.
    #[serde(default)]
    pub is_force: bool,
    /// Jobs ingested from the try bridge; their tasks skip blamelists.
    #[serde(default)]
    pub is_try: bool,
    #[serde(default)]
    pub tasks: BTreeMap<String, Vec<TaskSummary>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    /// Optimistic-concurrency stamp, set by the store on every write.
    pub db_modified: DateTime<Utc>,
}

impl Job {
    pub fn new(name: impl Into<String>, repo_state: RepoState, created: DateTime<Utc>) -> Self {
        Self {
            id: JobId(0),
            name: name.into(),
            repo_state,
            created,
            dependencies: Vec::new(),
            status: JobStatus::InProgress,
            is_force: false,
            is_try: false,
            tasks: BTreeMap::new(),
            finished: None,
            db_modified: created,
        }
    }

    pub fn done(&self) -> bool {
        self.status.is_done()
    }

    /// The task key for one of this job's dependency specs. Forced jobs
    /// carry their own id in the key so their tasks form a separate
    /// attempt series.
    pub fn make_task_key(&self, spec_name: &str) -> TaskKey {
        TaskKey {
            repo: self.repo_state.repo.clone(),
            revision: self.repo_state.revision.clone(),
            name: spec_name.to_string(),
            forced_job_id: if self.is_force { Some(self.id.0) } else { None },
        }
    }

    /// Derive the job's status from the latest task summary of each
    /// dependency.
    ///
    /// Precedence: in-progress > mishap > failure > success. A dependency
    /// counts as in-progress while its latest task is pending/running, or
    /// while a failed latest task still has attempts left (the scheduler
    /// will retry it). Canceled jobs keep their status.
    pub fn derive_status(&self, max_attempts: impl Fn(&str) -> u32) -> JobStatus {
        if self.status == JobStatus::Canceled {
            return JobStatus::Canceled;
        }
        let mut any_failure = false;
        let mut any_mishap = false;
        for dep in &self.dependencies {
            let latest = match self.tasks.get(dep).and_then(|ts| ts.last()) {
                Some(s) => s,
                None => return JobStatus::InProgress,
            };
            match latest.status {
                TaskStatus::Pending | TaskStatus::Running => return JobStatus::InProgress,
                TaskStatus::Success => {}
                TaskStatus::Mishap => any_mishap = true,
                TaskStatus::Failure => {
                    if latest.attempt + 1 < max_attempts(dep) {
                        // A retry is still legal; the job is not settled.
                        return JobStatus::InProgress;
                    }
                    any_failure = true;
                }
            }
        }
        if any_mishap {
            JobStatus::Mishap
        } else if any_failure {
            JobStatus::Failure
        } else {
            JobStatus::Success
        }
    }
}
