//! Mirror sync: rebuilds the in-memory commit graph from an on-disk git
//! mirror at the top of every tick.

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use foreman_core::repograph::{Commit, Graph};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Produces a fresh commit graph for one repository.
pub trait RepoSyncer: Send + Sync {
    fn sync(&self) -> Result<Graph>;
}

/// Git-backed syncer over a local mirror clone.
pub struct GitRepoSyncer {
    mirror: PathBuf,
    /// Fetch from origin before reading. Disabled for mirrors that are
    /// updated out of band.
    fetch: bool,
}

impl GitRepoSyncer {
    pub fn new(mirror: impl Into<PathBuf>) -> Self {
        Self {
            mirror: mirror.into(),
            fetch: true,
        }
    }

    pub fn without_fetch(mirror: impl Into<PathBuf>) -> Self {
        Self {
            mirror: mirror.into(),
            fetch: false,
        }
    }
}

impl RepoSyncer for GitRepoSyncer {
    fn sync(&self) -> Result<Graph> {
        let repo = git2::Repository::open(&self.mirror)
            .context(format!("failed to open mirror at {}", self.mirror.display()))?;

        if self.fetch {
            let mut remote = repo
                .find_remote("origin")
                .context("mirror has no origin remote")?;
            remote
                .fetch(&[] as &[&str], None, None)
                .context(format!("fetch failed for {}", self.mirror.display()))?;
        }

        let mut heads = BTreeMap::new();
        let mut walk = repo.revwalk()?;
        for branch in repo.branches(Some(git2::BranchType::Local))? {
            let (branch, _) = branch?;
            let name = branch.name()?.unwrap_or_default().to_string();
            if let Some(target) = branch.get().target() {
                heads.insert(name, target.to_string());
                walk.push(target)?;
            }
        }

        let mut commits = Vec::new();
        for oid in walk {
            let oid = oid?;
            let commit = repo.find_commit(oid)?;
            let parents = commit.parent_ids().map(|p| p.to_string()).collect();
            let timestamp = Utc
                .timestamp_opt(commit.time().seconds(), 0)
                .single()
                .context(format!("bad timestamp on commit {oid}"))?;
            commits.push(Commit {
                hash: oid.to_string(),
                parents,
                timestamp,
            });
        }

        tracing::debug!(
            mirror = %self.mirror.display(),
            commits = commits.len(),
            branches = heads.len(),
            "synced repo mirror"
        );

        let mut graph = Graph::new();
        graph.reset(commits, heads);
        Ok(graph)
    }
}

/// Static syncer returning a pre-built graph. Used in tests and for
/// mirrors managed entirely out of band.
pub struct StaticSyncer {
    graph: std::sync::Mutex<Graph>,
}

impl StaticSyncer {
    pub fn new(graph: Graph) -> Self {
        Self {
            graph: std::sync::Mutex::new(graph),
        }
    }

    /// Replace the graph the next sync will return.
    pub fn set(&self, graph: Graph) {
        *self.graph.lock().unwrap() = graph;
    }
}

impl RepoSyncer for StaticSyncer {
    fn sync(&self) -> Result<Graph> {
        Ok(self.graph.lock().unwrap().clone())
    }
}
