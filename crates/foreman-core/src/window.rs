//! Sliding commit window (recency gate).
//!
//! Entities older than the window are invisible to the scheduler: jobs
//! are not considered, tasks fall out of the hot caches, and candidates
//! are rejected. The per-repo lower bound guarantees *both* a minimum
//! time span and a minimum commit count, whichever reaches further back.

use crate::repograph::{Commit, Graph};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Window {
    period: Duration,
    num_commits: usize,
    global_start: DateTime<Utc>,
    start_times: HashMap<String, DateTime<Utc>>,
}

impl Window {
    pub fn new(period: Duration, num_commits: usize) -> Self {
        Self {
            period,
            num_commits,
            global_start: Utc::now() - period,
            start_times: HashMap::new(),
        }
    }

    /// Recompute the lower bounds from the current repo graphs. Called at
    /// the top of every tick, after the mirrors have synced.
    pub fn update(&mut self, now: DateTime<Utc>, repos: &HashMap<String, Graph>) {
        self.global_start = now - self.period;
        self.start_times.clear();
        for (repo, graph) in repos {
            let mut timestamps: Vec<DateTime<Utc>> =
                graph.commits().map(|c| c.timestamp).collect();
            if timestamps.is_empty() {
                continue;
            }
            timestamps.sort_unstable_by(|a, b| b.cmp(a));
            let idx = self.num_commits.min(timestamps.len()).saturating_sub(1);
            let nth = timestamps[idx];
            self.start_times
                .insert(repo.clone(), self.global_start.min(nth));
        }
    }

    /// The effective lower bound for a repo.
    pub fn start(&self, repo: &str) -> DateTime<Utc> {
        self.start_times
            .get(repo)
            .copied()
            .unwrap_or(self.global_start)
    }

    /// Whether a timestamp is inside the window for the given repo.
    pub fn test_time(&self, repo: &str, t: DateTime<Utc>) -> bool {
        t >= self.start(repo)
    }

    /// Whether a commit is inside the window for the given repo.
    pub fn test_commit(&self, repo: &str, commit: &Commit) -> bool {
        self.test_time(repo, commit.timestamp)
    }

    /// Resolve a hash in `graph` and test it; unknown hashes are outside.
    pub fn test_commit_hash(&self, repo: &str, graph: &Graph, hash: &str) -> bool {
        graph
            .get(hash)
            .is_some_and(|c| self.test_commit(repo, c))
    }
}
