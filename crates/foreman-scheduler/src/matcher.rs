//! Matching free executor bots to scored candidates.

use crate::candidates::TaskCandidate;
use crate::executor::{BotInfo, ExecutorTask};
use std::collections::{BTreeSet, HashMap};

/// Accounts for executor tasks that are pending but not yet running:
/// each one reserves a matching free bot so the matcher never
/// double-books a machine that is about to pick up work.
#[derive(Debug, Default)]
pub struct BusyBots {
    pending: Vec<ExecutorTask>,
}

impl BusyBots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pending-task set with the executor's latest view.
    pub fn refresh_tasks(&mut self, pending: Vec<ExecutorTask>) {
        self.pending = pending;
    }

    /// Remove one matching bot (smallest id first, deterministically)
    /// per pending task.
    pub fn filter(&self, bots: Vec<BotInfo>) -> Vec<BotInfo> {
        let mut remaining = bots;
        for task in &self.pending {
            let reserved = remaining
                .iter()
                .enumerate()
                .filter(|(_, b)| b.matches_dimensions(&task.dimensions))
                .min_by(|(_, a), (_, b)| a.id.cmp(&b.id))
                .map(|(idx, _)| idx);
            if let Some(idx) = reserved {
                let bot = remaining.remove(idx);
                tracing::debug!(bot = %bot.id, executor_task = %task.id, "bot reserved for pending task");
            }
        }
        remaining
    }
}

/// Match free bots to candidates in score order.
///
/// Candidates at or below `min_score` are skipped — retries score exactly
/// zero, so the default threshold of 0.0 keeps them out. The bot with the
/// lexicographically smallest id wins each match, and a matched bot is
/// removed from every dimension index. Output preserves score order.
pub fn get_candidates_to_schedule(
    bots: &[BotInfo],
    queue: &[TaskCandidate],
    min_score: f64,
) -> Vec<TaskCandidate> {
    // Index bots by each `key:value` dimension they carry.
    let mut bots_by_dim: HashMap<String, BTreeSet<&str>> = HashMap::new();
    for bot in bots {
        for (key, values) in &bot.dimensions {
            for value in values {
                bots_by_dim
                    .entry(format!("{key}:{value}"))
                    .or_default()
                    .insert(&bot.id);
            }
        }
    }

    let mut scheduled = Vec::new();
    for candidate in queue {
        if candidate.score <= min_score {
            tracing::warn!(
                candidate = %candidate.key,
                score = candidate.score,
                commits = candidate.commits.len(),
                "skipping candidate at or below the score threshold"
            );
            continue;
        }

        // Intersect the bot sets of every required dimension.
        let mut matches: Option<BTreeSet<&str>> = None;
        for dim in &candidate.spec.dimensions {
            let set = bots_by_dim.get(dim).cloned().unwrap_or_default();
            matches = Some(match matches {
                None => set,
                Some(prev) => prev.intersection(&set).copied().collect(),
            });
        }

        let matches = matches.unwrap_or_default();
        let Some(&bot) = matches.first() else {
            continue;
        };
        let bot = bot.to_string();

        // Remove the chosen bot from consideration entirely.
        bots_by_dim.retain(|_, set| {
            set.remove(bot.as_str());
            !set.is_empty()
        });

        scheduled.push(candidate.clone());

        if bots_by_dim.is_empty() {
            break;
        }
    }
    scheduled
}
