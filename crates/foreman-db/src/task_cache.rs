//! Windowed in-memory snapshot of the task table, plus the scratch
//! overlay used during candidate processing and blamelist adjustment.

use crate::task_store::TaskStore;
use anyhow::Result;
use foreman_core::task::{Task, TaskId, TaskKey};
use foreman_core::window::Window;
use std::collections::HashMap;

/// Read interface shared by the snapshot cache and the scratch wrapper,
/// so blamelist computation can run against either.
pub trait TaskLookup {
    fn get_task(&self, id: TaskId) -> Option<&Task>;

    /// The task currently covering `commit` in its blamelist for
    /// `(repo, name)`, if any. Try jobs never cover commits.
    fn get_task_for_commit(&self, repo: &str, commit: &str, name: &str) -> Option<&Task>;
}

/// Immutable snapshot of all tasks inside the window, rebuilt by
/// `update()` at defined points in the tick.
#[derive(Debug, Default)]
pub struct TaskCache {
    by_id: HashMap<TaskId, Task>,
    /// Values sorted by creation time ascending.
    by_key: HashMap<TaskKey, Vec<TaskId>>,
    /// (repo, name, commit) -> the latest task whose blamelist holds the
    /// commit. Under the coverage invariant there is at most one.
    by_commit: HashMap<(String, String, String), TaskId>,
    unfinished: Vec<TaskId>,
}

impl TaskCache {
    /// Rebuild the snapshot from the store, keeping only tasks created
    /// inside the window.
    pub fn update(store: &TaskStore<'_>, window: &Window) -> Result<Self> {
        let mut cache = TaskCache::default();
        let mut tasks = store.list()?;
        tasks.retain(|t| window.test_time(&t.key.repo, t.created));
        tasks.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));

        for task in tasks {
            cache
                .by_key
                .entry(task.key.clone())
                .or_default()
                .push(task.id);
            if !task.done() {
                cache.unfinished.push(task.id);
            }
            if !task.is_try_job {
                for commit in &task.commits {
                    // Later-created tasks win; insertion order is by
                    // creation time.
                    cache.by_commit.insert(
                        (task.key.repo.clone(), task.key.name.clone(), commit.clone()),
                        task.id,
                    );
                }
            }
            cache.by_id.insert(task.id, task);
        }
        tracing::debug!(
            tasks = cache.by_id.len(),
            unfinished = cache.unfinished.len(),
            "rebuilt task cache"
        );
        Ok(cache)
    }

    /// Tasks with the given key, sorted by creation time ascending.
    pub fn get_tasks_by_key(&self, key: &TaskKey) -> Vec<&Task> {
        self.by_key
            .get(key)
            .map(|ids| ids.iter().filter_map(|id| self.by_id.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn unfinished_tasks(&self) -> Vec<&Task> {
        self.unfinished
            .iter()
            .filter_map(|id| self.by_id.get(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl TaskLookup for TaskCache {
    fn get_task(&self, id: TaskId) -> Option<&Task> {
        self.by_id.get(&id)
    }

    fn get_task_for_commit(&self, repo: &str, commit: &str, name: &str) -> Option<&Task> {
        let id = self
            .by_commit
            .get(&(repo.to_string(), name.to_string(), commit.to_string()))?;
        self.by_id.get(id)
    }
}

/// Thin overlay over a [`TaskCache`] snapshot that accepts in-flight
/// tasks, so scoring within a bucket (and blamelist adjustment within a
/// persist group) sees the effect of earlier selections without mutating
/// the shared snapshot.
pub struct CacheWrapper<'a> {
    cache: &'a TaskCache,
    overlay: HashMap<TaskId, Task>,
    overlay_by_commit: HashMap<(String, String, String), TaskId>,
}

impl<'a> CacheWrapper<'a> {
    pub fn new(cache: &'a TaskCache) -> Self {
        Self {
            cache,
            overlay: HashMap::new(),
            overlay_by_commit: HashMap::new(),
        }
    }

    /// Insert (or replace) a task in the overlay. Commit ownership moves
    /// to the inserted task; entries a stolen-from task no longer holds
    /// were already re-pointed by the thief's insertion.
    pub fn insert(&mut self, task: Task) {
        if !task.is_try_job {
            for commit in &task.commits {
                self.overlay_by_commit.insert(
                    (task.key.repo.clone(), task.key.name.clone(), commit.clone()),
                    task.id,
                );
            }
        }
        self.overlay.insert(task.id, task);
    }
}

impl TaskLookup for CacheWrapper<'_> {
    fn get_task(&self, id: TaskId) -> Option<&Task> {
        self.overlay.get(&id).or_else(|| self.cache.get_task(id))
    }

    fn get_task_for_commit(&self, repo: &str, commit: &str, name: &str) -> Option<&Task> {
        let key = (repo.to_string(), name.to_string(), commit.to_string());
        if let Some(id) = self.overlay_by_commit.get(&key) {
            return self.get_task(*id);
        }
        // The snapshot may name a task that has an updated overlay copy
        // (a stolen-from task with a reduced blamelist).
        let snapshot = self.cache.get_task_for_commit(repo, commit, name)?;
        self.get_task(snapshot.id)
    }
}
