//! In-memory commit graph for one repository.
//!
//! The graph is rebuilt from the repo mirror at the top of every tick and
//! is immutable while a tick runs. Traversal is first-parent-first
//! pre-order with dedup, which is the canonical order for blamelist
//! computation.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// A single commit: hash, parent hashes (first parent first), timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    pub parents: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Control value returned by a traversal visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recursion {
    /// Keep going: visit this commit's parents.
    Continue,
    /// Skip this commit's parents, but continue the traversal elsewhere.
    Stop,
    /// Terminate the entire traversal immediately.
    Abort,
}

/// Commit DAG plus branch heads for one repository.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    commits: HashMap<String, Commit>,
    branch_heads: BTreeMap<String, String>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, commit: Commit) {
        self.commits.insert(commit.hash.clone(), commit);
    }

    pub fn set_branch_head(&mut self, branch: impl Into<String>, hash: impl Into<String>) {
        self.branch_heads.insert(branch.into(), hash.into());
    }

    pub fn get(&self, hash: &str) -> Option<&Commit> {
        self.commits.get(hash)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.commits.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Branch name → head hash, in branch-name order.
    pub fn branch_heads(&self) -> impl Iterator<Item = (&str, &str)> {
        self.branch_heads
            .iter()
            .map(|(b, h)| (b.as_str(), h.as_str()))
    }

    pub fn commits(&self) -> impl Iterator<Item = &Commit> {
        self.commits.values()
    }

    /// Replace the graph contents wholesale. Used by the mirror sync.
    pub fn reset(&mut self, commits: Vec<Commit>, heads: BTreeMap<String, String>) {
        self.commits = commits.into_iter().map(|c| (c.hash.clone(), c)).collect();
        self.branch_heads = heads;
    }

    /// Visit `from` and its ancestors, first parent first, each commit at
    /// most once. The visitor decides per commit whether to recurse into
    /// its parents, skip them, or abort the whole traversal.
    pub fn recurse<F>(&self, from: &str, mut visitor: F) -> Result<()>
    where
        F: FnMut(&Commit) -> Result<Recursion>,
    {
        let mut visited = HashSet::new();
        self.recurse_inner(from, &mut visited, &mut visitor)?;
        Ok(())
    }

    /// Visit the ancestors of every branch head with a shared visited set.
    pub fn recurse_all_branches<F>(&self, mut visitor: F) -> Result<()>
    where
        F: FnMut(&Commit) -> Result<Recursion>,
    {
        let heads: Vec<String> = self.branch_heads.values().cloned().collect();
        let mut visited = HashSet::new();
        for head in heads {
            if !self.recurse_inner(&head, &mut visited, &mut visitor)? {
                return Ok(());
            }
        }
        Ok(())
    }

    // Returns Ok(false) when the visitor aborted.
    fn recurse_inner<F>(
        &self,
        from: &str,
        visited: &mut HashSet<String>,
        visitor: &mut F,
    ) -> Result<bool>
    where
        F: FnMut(&Commit) -> Result<Recursion>,
    {
        // Explicit stack rather than recursion: histories can be deep.
        // Each frame is a commit hash plus whether it was already visited
        // (second encounter means "now push parents").
        let mut stack: Vec<String> = vec![from.to_string()];
        while let Some(hash) = stack.pop() {
            if !visited.insert(hash.clone()) {
                continue;
            }
            let commit = match self.commits.get(&hash) {
                Some(c) => c,
                None => continue,
            };
            match visitor(commit)? {
                Recursion::Abort => return Ok(false),
                Recursion::Stop => continue,
                Recursion::Continue => {
                    // Push in reverse so the first parent is visited first.
                    for parent in commit.parents.iter().rev() {
                        if !visited.contains(parent) {
                            stack.push(parent.clone());
                        }
                    }
                }
            }
        }
        Ok(true)
    }
}
