//! Client seam for the remote executor service that runs dispatched
//! tasks, plus the folding of executor results back into the store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::task::{TaskId, TaskStatus};
use foreman_db::task_store::TaskStore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Tag attached to every submission so executor results can be traced
/// back to the owning task record.
pub const TAG_FOREMAN_ID: &str = "foreman-id";

/// A remote executor machine and its dimension bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotInfo {
    pub id: String,
    /// Dimension key -> the set of values the bot carries.
    pub dimensions: HashMap<String, HashSet<String>>,
    #[serde(default)]
    pub dead: bool,
    #[serde(default)]
    pub quarantined: bool,
    /// Id of the executor task currently running on the bot, if any.
    #[serde(default)]
    pub task_id: Option<String>,
}

impl BotInfo {
    /// Whether the bot carries every `key:value` constraint in `dims`.
    pub fn matches_dimensions(&self, dims: &[String]) -> bool {
        dims.iter().all(|d| match d.split_once(':') {
            Some((k, v)) => self.dimensions.get(k).is_some_and(|vals| vals.contains(v)),
            None => false,
        })
    }
}

/// State of a task on the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorTaskState {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    BotDied,
    Expired,
    Canceled,
}

impl ExecutorTaskState {
    /// Map onto the task status stored in the DB. Infrastructure-level
    /// endings are all mishaps.
    pub fn to_task_status(self) -> TaskStatus {
        match self {
            ExecutorTaskState::Pending => TaskStatus::Pending,
            ExecutorTaskState::Running => TaskStatus::Running,
            ExecutorTaskState::Completed => TaskStatus::Success,
            ExecutorTaskState::Failed => TaskStatus::Failure,
            ExecutorTaskState::TimedOut
            | ExecutorTaskState::BotDied
            | ExecutorTaskState::Expired
            | ExecutorTaskState::Canceled => TaskStatus::Mishap,
        }
    }
}

/// A task as reported by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorTask {
    pub id: String,
    pub state: ExecutorTaskState,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub isolated_output: Option<String>,
    /// Requested `key:value` dimensions, used for busy-bot accounting.
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl ExecutorTask {
    /// The owning task id from the submission tag, if present and valid.
    pub fn foreman_id(&self) -> Option<TaskId> {
        self.tags
            .get(TAG_FOREMAN_ID)
            .and_then(|v| v.parse::<i64>().ok())
            .map(TaskId)
    }
}

/// A submission to the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub name: String,
    pub isolated_input: String,
    pub dimensions: Vec<String>,
    pub priority: f64,
    /// Server the executor should fetch inputs from.
    pub isolate_server_url: String,
    /// Notification topic for completion messages.
    pub pubsub_topic: String,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub executor_task_id: String,
    pub created: DateTime<Utc>,
}

/// The remote executor API. Every call may block on network I/O and
/// carries the transport's deadline.
#[async_trait]
pub trait ExecutorClient: Send + Sync {
    async fn list_free_bots(&self, pool: &str) -> Result<Vec<BotInfo>>;

    /// Tasks submitted but not yet started, used to mark bots busy that
    /// the free-bot listing still reports as idle.
    async fn list_pending_tasks(&self, pool: &str) -> Result<Vec<ExecutorTask>>;

    async fn trigger_task(&self, req: &TaskRequest) -> Result<TriggerResponse>;

    async fn get_task(&self, executor_task_id: &str) -> Result<ExecutorTask>;
}

/// Fold an executor result into the store.
///
/// Looks the task up via its id tag. Still-running results and unknown
/// ids are ignored (the submission may not have been persisted yet);
/// status changes re-read the stored copy so the optimistic stamp is
/// fresh.
pub fn update_task_from_executor(store: &TaskStore<'_>, res: &ExecutorTask) -> Result<Option<TaskId>> {
    let id = match res.foreman_id() {
        Some(id) => id,
        None => {
            tracing::warn!(executor_task = %res.id, "executor result without an id tag");
            return Ok(None);
        }
    };
    let mut task = match store.get(id)? {
        Some(t) => t,
        None => {
            tracing::warn!(executor_task = %res.id, task = %id, "executor result for unknown task");
            return Ok(None);
        }
    };
    let new_status = res.state.to_task_status();
    if task.status == new_status && task.isolated_output == res.isolated_output {
        return Ok(None);
    }
    task.status = new_status;
    task.isolated_output = res.isolated_output.clone();
    if new_status.is_done() {
        task.finished = Some(res.completed.unwrap_or_else(Utc::now));
    }
    store
        .put_task(&mut task)
        .context(format!("failed to update task {id} from executor"))?;
    Ok(Some(id))
}
