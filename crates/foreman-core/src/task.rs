use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of commits allowed in a task blamelist before we stop
/// tracing commit history and fall back to a single-commit blamelist.
pub const MAX_BLAMELIST_COMMITS: usize = 500;

/// Unique task identifier, assigned by the store's id counter.
///
/// Negative ids are reserved for scratch tasks synthesized during
/// candidate processing; they never reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub i64);

impl TaskId {
    /// Whether this id was synthesized for a scratch-cache entry.
    pub fn is_scratch(&self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Status of a single executor invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Submitted to the executor but not yet started.
    Pending,
    /// Running on a bot.
    Running,
    Success,
    Failure,
    /// Infrastructure failure — the task did not produce a verdict.
    Mishap,
}

impl TaskStatus {
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
            TaskStatus::Mishap => "mishap",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Mishap
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Value key identifying "the same task" across attempts:
/// `(repo, revision, spec name, forced job id)`.
///
/// Two tasks with equal keys are attempts of one another. The forced job
/// id isolates force-triggered runs so they never collide with (or steal
/// from) the per-commit series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub repo: String,
    pub revision: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_job_id: Option<i64>,
}

impl TaskKey {
    pub fn new(repo: impl Into<String>, revision: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            revision: revision.into(),
            name: name.into(),
            forced_job_id: None,
        }
    }

    /// The same coordinate with a different spec name. Used for looking up
    /// dependency tasks, which run at the same RepoState.
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            repo: self.repo.clone(),
            revision: self.revision.clone(),
            name: name.into(),
            forced_job_id: self.forced_job_id,
        }
    }

    pub fn is_force_run(&self) -> bool {
        self.forced_job_id.is_some()
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {} ({})", self.name, self.revision, self.repo)
    }
}

/// Persistent record of one executor invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub key: TaskKey,
    pub created: DateTime<Utc>,
    pub status: TaskStatus,
    /// 0-based attempt number for this key.
    #[serde(default)]
    pub attempt: u32,
    /// Id of the task this one retries, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<TaskId>,
    /// Blamelist: the ordered set of commits this task attests.
    #[serde(default)]
    pub commits: Vec<String>,
    /// Ids of the dependency tasks whose outputs feed this one.
    #[serde(default)]
    pub parent_task_ids: Vec<TaskId>,
    /// Content-addressed input digest from the staging service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolated_input: Option<String>,
    /// Content-addressed output digest reported by the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolated_output: Option<String>,
    /// Id of the remote executor task backing this record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_task_id: Option<String>,
    /// Try jobs are exempt from blamelist logic.
    #[serde(default)]
    pub is_try_job: bool,
    /// When the executor reported a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    /// Optimistic-concurrency stamp, set by the store on every write.
    pub db_modified: DateTime<Utc>,
}

impl Task {
    pub fn new(key: TaskKey, created: DateTime<Utc>) -> Self {
        Self {
            id: TaskId(0),
            key,
            created,
            status: TaskStatus::Pending,
            attempt: 0,
            retry_of: None,
            commits: Vec::new(),
            parent_task_ids: Vec::new(),
            isolated_input: None,
            isolated_output: None,
            executor_task_id: None,
            is_try_job: false,
            finished: None,
            db_modified: created,
        }
    }

    pub fn done(&self) -> bool {
        self.status.is_done()
    }

    pub fn success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    /// The attempt number with the legacy fold applied: tasks recorded
    /// before explicit attempt numbering carry `attempt == 0` with a
    /// non-empty `retry_of`, and count as attempt 1.
    pub fn effective_attempt(&self) -> u32 {
        if self.attempt == 0 && self.retry_of.is_some() {
            1
        } else {
            self.attempt
        }
    }

    /// Project this task to the summary form stored on jobs.
    pub fn make_summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id,
            status: self.status,
            attempt: self.attempt,
        }
    }
}

/// Compact projection of a task, stored on jobs and compared structurally
/// to detect status changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub status: TaskStatus,
    pub attempt: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TaskKey {
        TaskKey::new("https://example.com/repo.git", "abc123", "Build-Linux")
    }

    #[test]
    fn status_terminal() {
        assert!(!TaskStatus::Pending.is_done());
        assert!(!TaskStatus::Running.is_done());
        assert!(TaskStatus::Success.is_done());
        assert!(TaskStatus::Failure.is_done());
        assert!(TaskStatus::Mishap.is_done());
    }

    #[test]
    fn key_with_name_keeps_coordinate() {
        let mut k = key();
        k.forced_job_id = Some(7);
        let dep = k.with_name("Compile");
        assert_eq!(dep.repo, k.repo);
        assert_eq!(dep.revision, k.revision);
        assert_eq!(dep.name, "Compile");
        assert_eq!(dep.forced_job_id, Some(7));
    }

    #[test]
    fn effective_attempt_folds_legacy_retry() {
        let mut t = Task::new(key(), Utc::now());
        assert_eq!(t.effective_attempt(), 0);
        t.retry_of = Some(TaskId(3));
        assert_eq!(t.effective_attempt(), 1);
        t.attempt = 2;
        assert_eq!(t.effective_attempt(), 2);
    }

    #[test]
    fn summary_equality_is_structural() {
        let mut t = Task::new(key(), Utc::now());
        t.id = TaskId(1);
        let a = t.make_summary();
        let mut b = t.make_summary();
        assert_eq!(a, b);
        b.status = TaskStatus::Success;
        assert_ne!(a, b);
    }

    #[test]
    fn serde_roundtrip() {
        let mut t = Task::new(key(), Utc::now());
        t.id = TaskId(42);
        t.commits = vec!["abc123".into(), "def456".into()];
        t.isolated_input = Some("deadbeef".into());
        let json = serde_json::to_string(&t).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, t.id);
        assert_eq!(back.key, t.key);
        assert_eq!(back.commits, t.commits);
    }

    #[test]
    fn scratch_ids_are_negative() {
        assert!(TaskId(-1).is_scratch());
        assert!(!TaskId(1).is_scratch());
        assert!(!TaskId(0).is_scratch());
    }
}
