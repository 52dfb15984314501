//! Blamelist computation: which commits a new task would attest, and
//! which prior task it steals them from.

use anyhow::{Result, bail};
use foreman_core::repograph::{Graph, Recursion};
use foreman_core::spec::RepoState;
use foreman_core::task::{MAX_BLAMELIST_COMMITS, Task};
use foreman_db::task_cache::TaskLookup;
use std::collections::{HashMap, HashSet};

/// Compute the blamelist for a task identified by `(repo, name)` running
/// at `revision`. Returns the covered commits and the prior task part or
/// all of the blamelist was stolen from, if any. Three cases:
///
/// 1. The new task tests commits which have not yet been tested. Trace
///    commit history, accumulating commits until we reach ones covered
///    by previous tasks.
///
/// 2. The new task runs at the same commit as a previous task. This is a
///    retry; the entire blamelist of the previous task is stolen
///    verbatim.
///
/// 3. The new task runs at a commit inside a previous task's blamelist,
///    but no task ran at this exact commit. This is a bisect: trace
///    history, stealing commits from that task until we reach a commit
///    covered by a *different* task or outside its reach.
///
/// `new_tasks` maps RepoStates to the spec names first introduced there;
/// accumulation stops after the introduction commit. Blamelists that
/// would exceed [`MAX_BLAMELIST_COMMITS`] collapse to the revision alone.
pub fn compute_blamelist(
    cache: &dyn TaskLookup,
    graph: &Graph,
    repo: &str,
    name: &str,
    revision: &str,
    new_tasks: &HashMap<RepoState, HashSet<String>>,
) -> Result<(Vec<String>, Option<Task>)> {
    if graph.get(revision).is_none() {
        bail!("no such commit {revision} in {repo}");
    }

    let mut commits: Vec<String> = Vec::new();
    let mut steal_from: Option<Task> = None;
    let mut overflowed = false;

    graph.recurse(revision, |commit| {
        let prev = cache.get_task_for_commit(repo, &commit.hash, name);

        // If the blamelist is too large, just use a single commit.
        if commits.len() > MAX_BLAMELIST_COMMITS {
            overflowed = true;
            return Ok(Recursion::Abort);
        }

        // If we're stealing commits from a previous task but the current
        // commit is not in any task's blamelist, we have scrolled past
        // the beginning of the tasks.
        if prev.is_none() && steal_from.is_some() {
            return Ok(Recursion::Stop);
        }

        if let Some(prev) = prev {
            if commits.is_empty() {
                // Our revision is inside a previous task's blamelist, so
                // we're either bisecting or retrying.
                steal_from = Some(prev.clone());

                if prev.key.revision == revision {
                    // A retry: steal the entire blamelist verbatim.
                    for c in &prev.commits {
                        if graph.get(c).is_none() {
                            bail!("no such commit {c} in {repo}");
                        }
                    }
                    commits = prev.commits.clone();
                    return Ok(Recursion::Abort);
                }
            }
            match &steal_from {
                Some(sf) if sf.id == prev.id => {}
                // A commit belonging to a different task bounds the
                // blamelist.
                _ => return Ok(Recursion::Stop),
            }
        }

        commits.push(commit.hash.clone());

        // If the spec was introduced at this commit, older commits can't
        // be covered.
        let rs = RepoState::new(repo.to_string(), commit.hash.clone());
        if new_tasks.get(&rs).is_some_and(|specs| specs.contains(name)) {
            tracing::info!(
                spec = name,
                commit = %commit.hash,
                "task spec introduced here; stopping blamelist trace"
            );
            return Ok(Recursion::Stop);
        }

        Ok(Recursion::Continue)
    })?;

    if overflowed {
        tracing::warn!(
            spec = name,
            revision,
            "blamelist too large; falling back to single-commit blamelist"
        );
        return Ok((vec![revision.to_string()], steal_from));
    }

    Ok((commits, steal_from))
}
