//! Dry-run executor and stager for `foreman simulate`: dispatched tasks
//! complete immediately, inputs get synthetic digests. The bot fleet is
//! described by a JSON file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use foreman_core::spec::RepoState;
use foreman_scheduler::executor::{
    BotInfo, ExecutorClient, ExecutorTask, ExecutorTaskState, TaskRequest, TriggerResponse,
};
use foreman_scheduler::isolate::{InputStager, IsolateSpec};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct DryRunExecutor {
    bots: Vec<BotInfo>,
    next_id: AtomicU64,
    /// executor task id -> the submission's tags, echoed back on get.
    triggered: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl DryRunExecutor {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("failed to read bots file {}", path.display()))?;
        let bots: Vec<BotInfo> = serde_json::from_str(&content)
            .context(format!("invalid bots file {}", path.display()))?;
        tracing::info!(bots = bots.len(), "loaded simulated bot fleet");
        Ok(Self {
            bots,
            next_id: AtomicU64::new(1),
            triggered: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl ExecutorClient for DryRunExecutor {
    async fn list_free_bots(&self, _pool: &str) -> Result<Vec<BotInfo>> {
        Ok(self.bots.clone())
    }

    async fn list_pending_tasks(&self, _pool: &str) -> Result<Vec<ExecutorTask>> {
        Ok(Vec::new())
    }

    async fn trigger_task(&self, req: &TaskRequest) -> Result<TriggerResponse> {
        let id = format!("dry-run-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.triggered
            .lock()
            .unwrap()
            .insert(id.clone(), req.tags.clone());
        Ok(TriggerResponse {
            executor_task_id: id,
            created: Utc::now(),
        })
    }

    async fn get_task(&self, executor_task_id: &str) -> Result<ExecutorTask> {
        let tags = self
            .triggered
            .lock()
            .unwrap()
            .get(executor_task_id)
            .cloned()
            .with_context(|| format!("unknown executor task {executor_task_id}"))?;
        // Every dispatched task completes successfully and immediately.
        Ok(ExecutorTask {
            id: executor_task_id.to_string(),
            state: ExecutorTaskState::Completed,
            created: Utc::now(),
            completed: Some(Utc::now()),
            isolated_output: Some(format!("dry-run-output-{executor_task_id}")),
            dimensions: Vec::new(),
            tags,
        })
    }
}

pub struct DryRunStager;

impl DryRunStager {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl InputStager for DryRunStager {
    async fn stage(&self, rs: &RepoState, specs: &[IsolateSpec]) -> Result<Vec<String>> {
        Ok(specs
            .iter()
            .map(|s| format!("dry-run-{}-{}-{}", rs.revision, s.task_name, s.isolate))
            .collect())
    }

    fn server_url(&self) -> String {
        "dry-run://localhost".into()
    }
}
