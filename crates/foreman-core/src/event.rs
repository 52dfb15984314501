//! Scheduler event types for observability.
//!
//! Events are emitted as ticks progress and tasks are dispatched.
//! Consumers subscribe through the broadcast bus in `foreman-scheduler`.
//! These are pure data types with no async runtime dependency.

use crate::job::{JobId, JobStatus};
use crate::task::{TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A timestamped scheduler event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl SchedulerEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// The specific kind of scheduler event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventKind {
    /// A main-loop tick began.
    TickStarted,

    /// A main-loop tick completed.
    TickFinished {
        dispatched: usize,
        queue_len: usize,
    },

    /// A job was created (per-commit, forced, or periodic).
    JobCreated {
        job_id: JobId,
        name: String,
        repo: String,
        revision: String,
    },

    /// A job reached a terminal status.
    JobFinished { job_id: JobId, status: JobStatus },

    /// A task was submitted to the executor.
    TaskDispatched {
        task_id: TaskId,
        name: String,
        repo: String,
        revision: String,
        executor_task_id: String,
    },

    /// A task's executor result was folded into the store.
    TaskFinished { task_id: TaskId, status: TaskStatus },

    /// A candidate was dropped for a data-model violation; the tick
    /// continues without it.
    CandidateDropped {
        name: String,
        revision: String,
        reason: String,
    },
}
