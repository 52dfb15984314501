//! Candidate processing: per-bucket iterative scoring against a scratch
//! cache, then the global score-ordered queue.

use crate::blamelist::compute_blamelist;
use crate::candidates::{CandidateBuckets, TaskCandidate};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use foreman_core::repograph::Graph;
use foreman_core::score::{
    CANDIDATE_SCORE_FORCE_RUN, CANDIDATE_SCORE_TRY_JOB, testedness_increase, time_decay_24hr,
};
use foreman_core::spec::RepoState;
use foreman_core::task::TaskId;
use foreman_core::window::Window;
use foreman_db::task_cache::{CacheWrapper, TaskCache, TaskLookup};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;

/// Shared read-only inputs for one scoring pass.
pub struct ScoringContext {
    pub now: DateTime<Utc>,
    pub cache: Arc<TaskCache>,
    pub graphs: Arc<HashMap<String, Graph>>,
    pub window: Arc<Window>,
    pub new_tasks: Arc<HashMap<RepoState, HashSet<String>>>,
    pub time_decay_amt_24hr: f64,
}

/// Score and order all candidate buckets.
///
/// Buckets are independent and processed on blocking worker threads; the
/// aggregate result is sorted by score descending with a stable
/// `(repo, spec name, revision)` tie-break.
pub async fn process_candidates(
    ctx: Arc<ScoringContext>,
    buckets: CandidateBuckets,
) -> Result<Vec<TaskCandidate>> {
    let mut workers: JoinSet<Result<Vec<TaskCandidate>>> = JoinSet::new();
    for (_, by_name) in buckets {
        for (_, bucket) in by_name {
            let ctx = Arc::clone(&ctx);
            workers.spawn_blocking(move || process_bucket(&ctx, bucket));
        }
    }

    let mut queue = Vec::new();
    while let Some(result) = workers.join_next().await {
        queue.extend(result.context("bucket worker panicked")??);
    }
    sort_queue(&mut queue);
    Ok(queue)
}

/// Sort by score descending; ties break lexicographically by
/// `(repo, spec name, revision)` so the queue is deterministic.
pub fn sort_queue(queue: &mut [TaskCandidate]) {
    queue.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                (&a.key.repo, &a.key.name, &a.key.revision).cmp(&(
                    &b.key.repo,
                    &b.key.name,
                    &b.key.revision,
                ))
            })
    });
}

/// Process one `(repo, spec name)` bucket: repeatedly score every
/// remaining candidate against the scratch cache, emit the best, and
/// commit its effect (synthesized task + corrected stolen-from coverage)
/// so the next iteration sees it.
fn process_bucket(ctx: &ScoringContext, bucket: Vec<TaskCandidate>) -> Result<Vec<TaskCandidate>> {
    let mut wrapper = CacheWrapper::new(&ctx.cache);
    let mut remaining = bucket;
    let mut emitted = Vec::with_capacity(remaining.len());
    let mut scratch_id = -1i64;

    while !remaining.is_empty() {
        let mut best: Option<(usize, TaskCandidate)> = None;
        let mut dropped: Vec<usize> = Vec::new();
        for (idx, candidate) in remaining.iter().enumerate() {
            let mut c = candidate.clone();
            if let Err(err) = process_candidate(ctx, &wrapper, &mut c) {
                // A broken candidate (missing commit, violated invariant)
                // is dropped; the rest of the bucket proceeds.
                tracing::error!(candidate = %c.key, error = %err, "dropping unprocessable candidate");
                dropped.push(idx);
                continue;
            }
            let better = match &best {
                None => true,
                Some((_, b)) => {
                    c.score > b.score
                        || (c.score == b.score && c.key.revision < b.key.revision)
                }
            };
            if better {
                best = Some((idx, c));
            }
        }

        let (idx, winner) = match best {
            Some(b) => b,
            None => break,
        };

        // Synthesize the winner's task into the scratch cache so the
        // remaining candidates are scored against corrected coverage.
        let mut scratch = winner.make_task(ctx.now);
        scratch.id = TaskId(scratch_id);
        scratch_id -= 1;
        wrapper.insert(scratch);

        if let Some(stolen_id) = winner.stealing_from_id {
            let mut stolen = wrapper
                .get_task(stolen_id)
                .context(format!("stolen-from task {stolen_id} disappeared"))?
                .clone();
            let taken: HashSet<&str> = winner.commits.iter().map(|c| c.as_str()).collect();
            stolen.commits.retain(|c| !taken.contains(c.as_str()));
            wrapper.insert(stolen);
        }

        dropped.push(idx);
        dropped.sort_unstable_by(|a, b| b.cmp(a));
        for i in dropped {
            remaining.swap_remove(i);
        }
        emitted.push(winner);
    }
    Ok(emitted)
}

/// Compute blamelist and score for a single candidate.
fn process_candidate(
    ctx: &ScoringContext,
    cache: &dyn TaskLookup,
    c: &mut TaskCandidate,
) -> Result<()> {
    let hours_waiting = (ctx.now - c.job_created).num_seconds() as f64 / 3600.0;
    if c.is_try_job {
        c.score = CANDIDATE_SCORE_TRY_JOB + hours_waiting;
        return Ok(());
    }

    let graph = ctx
        .graphs
        .get(&c.key.repo)
        .context(format!("no such repo: {}", c.key.repo))?;
    let revision = graph
        .get(&c.key.revision)
        .context(format!("no such commit {} in {}", c.key.revision, c.key.repo))?
        .clone();

    let mut stealing_from = None;
    if ctx.window.test_time(&c.key.repo, revision.timestamp) {
        let (commits, stolen) = compute_blamelist(
            cache,
            graph,
            &c.key.repo,
            &c.key.name,
            &c.key.revision,
            &ctx.new_tasks,
        )?;
        c.commits = commits;
        stealing_from = stolen;
    } else {
        // Scrolled out of the window: empty blamelist, score <= 0, never
        // dispatched.
        c.commits = Vec::new();
    }
    c.stealing_from_id = stealing_from.as_ref().map(|t| t.id);

    if !c.commits.is_empty() && !c.commits.iter().any(|h| h == &c.key.revision) {
        anyhow::bail!(
            "candidate {} blamelist does not include its own revision",
            c.key
        );
    }

    if c.key.is_force_run() {
        c.score = CANDIDATE_SCORE_FORCE_RUN + hours_waiting;
        return Ok(());
    }

    let stole_from_len = match &stealing_from {
        Some(stolen) => {
            if let Some(retry_of) = c.retry_of {
                if stolen.id != retry_of && stolen.key.forced_job_id.is_none() {
                    tracing::error!(
                        candidate = %c.key,
                        retry_of = %retry_of,
                        stolen = %stolen.id,
                        "retry candidate is stealing from an unrelated task"
                    );
                }
            }
            stolen.commits.len()
        }
        None => 0,
    };

    let mut score = testedness_increase(c.commits.len() as i64, stole_from_len as i64);
    score *= time_decay_24hr(ctx.time_decay_amt_24hr, ctx.now - revision.timestamp);
    c.score = score;
    Ok(())
}
