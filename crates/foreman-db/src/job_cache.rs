//! Windowed in-memory snapshot of the job table.

use crate::job_store::JobStore;
use anyhow::Result;
use foreman_core::job::{Job, JobId};
use foreman_core::window::Window;
use std::collections::{HashMap, HashSet};

/// Immutable snapshot of all jobs inside the window, rebuilt by
/// `update()` at defined points in the tick.
#[derive(Debug, Default)]
pub struct JobCache {
    by_id: HashMap<JobId, Job>,
    unfinished: Vec<JobId>,
    /// `(repo, revision)` pairs that already have per-commit jobs, so job
    /// gathering skips them.
    scheduled_commits: HashSet<(String, String)>,
}

impl JobCache {
    /// Rebuild the snapshot from the store, keeping only jobs created
    /// inside the window.
    pub fn update(store: &JobStore<'_>, window: &Window) -> Result<Self> {
        let mut cache = JobCache::default();
        let mut jobs = store.list()?;
        jobs.retain(|j| window.test_time(&j.repo_state.repo, j.created));
        jobs.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));

        for job in jobs {
            if !job.done() {
                cache.unfinished.push(job.id);
            }
            if !job.is_try && !job.is_force {
                cache.scheduled_commits.insert((
                    job.repo_state.repo.clone(),
                    job.repo_state.revision.clone(),
                ));
            }
            cache.by_id.insert(job.id, job);
        }
        tracing::debug!(
            jobs = cache.by_id.len(),
            unfinished = cache.unfinished.len(),
            "rebuilt job cache"
        );
        Ok(cache)
    }

    pub fn get_job(&self, id: JobId) -> Option<&Job> {
        self.by_id.get(&id)
    }

    /// Look up a job, falling back to the store for jobs that have
    /// scrolled out of the window.
    pub fn get_job_maybe_expired(&self, store: &JobStore<'_>, id: JobId) -> Result<Option<Job>> {
        if let Some(job) = self.by_id.get(&id) {
            return Ok(Some(job.clone()));
        }
        store.get(id)
    }

    /// Unfinished jobs, oldest first.
    pub fn unfinished_jobs(&self) -> Vec<&Job> {
        self.unfinished
            .iter()
            .filter_map(|id| self.by_id.get(id))
            .collect()
    }

    /// Whether per-commit jobs have already been created at this commit.
    pub fn scheduled_jobs_for_commit(&self, repo: &str, revision: &str) -> bool {
        self.scheduled_commits
            .contains(&(repo.to_string(), revision.to_string()))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use foreman_core::job::JobStatus;
    use foreman_core::spec::RepoState;

    const REPO: &str = "https://example.com/repo.git";

    fn wide_window() -> Window {
        Window::new(Duration::days(3650), 1)
    }

    fn setup(db: &redb::Database) -> JobStore<'_> {
        JobStore::new(db)
    }

    fn job(revision: &str) -> Job {
        Job::new("Commit-Job", RepoState::new(REPO, revision), Utc::now())
    }

    #[test]
    fn unfinished_and_scheduled_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let db = crate::open_db(&dir.path().join("j.redb")).unwrap();
        let store = setup(&db);

        let mut done = store.insert(job("c1")).unwrap();
        done.status = JobStatus::Success;
        store.put_job(&mut done).unwrap();
        store.insert(job("c2")).unwrap();

        let cache = JobCache::update(&store, &wide_window()).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.unfinished_jobs().len(), 1);
        assert!(cache.scheduled_jobs_for_commit(REPO, "c1"));
        assert!(cache.scheduled_jobs_for_commit(REPO, "c2"));
        assert!(!cache.scheduled_jobs_for_commit(REPO, "c3"));
    }

    #[test]
    fn forced_jobs_do_not_mark_commits_scheduled() {
        let dir = tempfile::tempdir().unwrap();
        let db = crate::open_db(&dir.path().join("j.redb")).unwrap();
        let store = setup(&db);
        let mut forced = job("c1");
        forced.is_force = true;
        store.insert(forced).unwrap();

        let cache = JobCache::update(&store, &wide_window()).unwrap();
        assert!(!cache.scheduled_jobs_for_commit(REPO, "c1"));
    }

    #[test]
    fn maybe_expired_falls_back_to_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = crate::open_db(&dir.path().join("j.redb")).unwrap();
        let store = setup(&db);
        let inserted = store.insert(job("c1")).unwrap();

        // An empty-window cache doesn't hold the job, but the store does.
        let mut narrow = Window::new(Duration::seconds(1), 0);
        narrow.update(Utc::now() + Duration::days(365), &HashMap::new());
        let cache = JobCache::update(&store, &narrow).unwrap();
        assert!(cache.get_job(inserted.id).is_none());
        let fetched = cache
            .get_job_maybe_expired(&store, inserted.id)
            .unwrap()
            .unwrap();
        assert_eq!(fetched.id, inserted.id);
    }
}
