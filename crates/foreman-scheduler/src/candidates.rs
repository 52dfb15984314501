//! Task candidates: discovery from unfinished jobs and the filter that
//! reduces them to the ones worth scoring.

use crate::spec_cache::SpecCache;
use anyhow::Result;
use chrono::{DateTime, Utc};
use foreman_core::blacklist::Blacklist;
use foreman_core::job::Job;
use foreman_core::repograph::Graph;
use foreman_core::spec::{RepoState, TaskSpec};
use foreman_core::task::{Task, TaskId, TaskKey, TaskStatus};
use foreman_core::window::Window;
use foreman_db::task_cache::TaskCache;
use serde::Serialize;
use std::collections::HashMap;

/// A tentative task under consideration in the current tick. Becomes a
/// [`Task`] upon dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct TaskCandidate {
    pub key: TaskKey,
    pub spec: TaskSpec,
    pub job_created: DateTime<Utc>,
    pub is_try_job: bool,
    pub score: f64,
    pub commits: Vec<String>,
    pub stealing_from_id: Option<TaskId>,
    pub attempt: u32,
    pub retry_of: Option<TaskId>,
    pub parent_task_ids: Vec<TaskId>,
    pub isolated_hashes: Vec<String>,
    /// Staged input digest, filled in by the dispatch pipeline.
    pub isolated_input: Option<String>,
}

impl TaskCandidate {
    fn new(key: TaskKey, spec: TaskSpec, job_created: DateTime<Utc>, is_try_job: bool) -> Self {
        Self {
            key,
            spec,
            job_created,
            is_try_job,
            score: 0.0,
            commits: Vec::new(),
            stealing_from_id: None,
            attempt: 0,
            retry_of: None,
            parent_task_ids: Vec::new(),
            isolated_hashes: Vec::new(),
            isolated_input: None,
        }
    }

    pub fn repo_state(&self) -> RepoState {
        RepoState::new(self.key.repo.clone(), self.key.revision.clone())
    }

    /// Materialize the task record this candidate would persist as.
    pub fn make_task(&self, created: DateTime<Utc>) -> Task {
        let mut task = Task::new(self.key.clone(), created);
        task.status = TaskStatus::Pending;
        task.attempt = self.attempt;
        task.retry_of = self.retry_of;
        task.commits = self.commits.clone();
        task.parent_task_ids = self.parent_task_ids.clone();
        task.isolated_input = self.isolated_input.clone();
        task.is_try_job = self.is_try_job;
        task
    }
}

/// Candidates bucketed `repo -> spec name -> list`.
pub type CandidateBuckets = HashMap<String, HashMap<String, Vec<TaskCandidate>>>;

/// Enumerate the task candidates needed by the currently-unfinished
/// jobs. Candidates with identical keys are deduplicated, keeping the
/// earliest job.
pub fn find_candidates_for_jobs(
    jobs: &[Job],
    window: &Window,
    specs: &SpecCache,
) -> HashMap<TaskKey, TaskCandidate> {
    let mut candidates: HashMap<TaskKey, TaskCandidate> = HashMap::new();
    for job in jobs {
        if !window.test_time(&job.repo_state.repo, job.created) {
            continue;
        }
        for spec_name in &job.dependencies {
            let key = job.make_task_key(spec_name);
            if candidates.contains_key(&key) {
                continue;
            }
            let spec = match specs.get_task_spec(&job.repo_state, spec_name) {
                Ok(spec) => spec,
                Err(err) => {
                    tracing::warn!(
                        job = %job.id,
                        spec = spec_name.as_str(),
                        error = %err,
                        "skipping candidate with unknown task spec"
                    );
                    continue;
                }
            };
            candidates.insert(
                key.clone(),
                TaskCandidate::new(key, spec, job.created, job.is_try),
            );
        }
    }
    tracing::info!(
        candidates = candidates.len(),
        jobs = jobs.len(),
        "found task candidates for unfinished jobs"
    );
    candidates
}

/// Reduce the candidate set to the ones we might actually run and bucket
/// them by repo and spec name.
pub fn filter_candidates(
    candidates: HashMap<TaskKey, TaskCandidate>,
    blacklist: &Blacklist,
    window: &Window,
    graphs: &HashMap<String, Graph>,
    cache: &TaskCache,
) -> Result<CandidateBuckets> {
    let mut buckets: CandidateBuckets = HashMap::new();
    let mut total = 0usize;
    for (_, mut c) in candidates {
        if let Some(rule) = blacklist.match_rule(&c.key.name, &c.key.revision) {
            tracing::warn!(
                candidate = %c.key,
                rule,
                "skipping blacklisted task candidate"
            );
            continue;
        }

        // Reject tasks for too-old (or unknown) commits.
        let in_window = graphs
            .get(&c.key.repo)
            .is_some_and(|g| window.test_commit_hash(&c.key.repo, g, &c.key.revision));
        if !in_window {
            continue;
        }

        // We shouldn't duplicate pending, in-progress, or successfully
        // completed tasks.
        let prev_tasks = cache.get_tasks_by_key(&c.key);
        if let Some(previous) = prev_tasks.last() {
            if matches!(previous.status, TaskStatus::Pending | TaskStatus::Running) {
                continue;
            }
            if previous.success() {
                continue;
            }
            // The attempt count is only valid against the most recent
            // prior task, which `get_tasks_by_key` sorts last.
            let prev_attempt = previous.effective_attempt();
            if prev_attempt >= c.spec.effective_max_attempts().saturating_sub(1) {
                continue;
            }
            c.attempt = prev_attempt + 1;
            c.retry_of = Some(previous.id);
        }

        if !resolve_dependencies(&mut c, cache) {
            continue;
        }

        buckets
            .entry(c.key.repo.clone())
            .or_default()
            .entry(c.key.name.clone())
            .or_default()
            .push(c);
        total += 1;
    }
    tracing::info!(
        candidates = total,
        repos = buckets.len(),
        "filtered task candidates"
    );
    Ok(buckets)
}

/// Check that every dependency has a successful task with an output at
/// this candidate's coordinate, and attach the `(task id, output hash)`
/// pairs sorted by id. Returns false when any dependency is unmet.
fn resolve_dependencies(c: &mut TaskCandidate, cache: &TaskCache) -> bool {
    let mut pairs: Vec<(TaskId, String)> = Vec::with_capacity(c.spec.dependencies.len());
    for dep in &c.spec.dependencies {
        let dep_key = c.key.with_name(dep);
        let done = cache
            .get_tasks_by_key(&dep_key)
            .into_iter()
            .find(|t| t.success() && t.isolated_output.is_some());
        match done {
            Some(t) => pairs.push((t.id, t.isolated_output.clone().unwrap_or_default())),
            None => return false,
        }
    }
    pairs.sort_by_key(|(id, _)| *id);
    c.parent_task_ids = pairs.iter().map(|(id, _)| *id).collect();
    c.isolated_hashes = pairs.into_iter().map(|(_, hash)| hash).collect();
    true
}
