//! The task scheduler: per-tick orchestration, job bookkeeping, and the
//! externally observable operations.

use crate::candidates::{TaskCandidate, filter_candidates, find_candidates_for_jobs};
use crate::dispatch::{add_tasks, group_tasks, stage_and_trigger};
use crate::event_bus::EventBus;
use crate::executor::{BotInfo, ExecutorClient, update_task_from_executor};
use crate::isolate::InputStager;
use crate::matcher::{BusyBots, get_candidates_to_schedule};
use crate::periodic::PeriodicTriggers;
use crate::process::{ScoringContext, process_candidates};
use crate::repo_sync::RepoSyncer;
use crate::spec_cache::{CfgSource, SpecCache};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use foreman_core::blacklist::{Blacklist, Rule};
use foreman_core::config::SchedulerConfig;
use foreman_core::event::EventKind;
use foreman_core::job::{Job, JobId};
use foreman_core::repograph::{Graph, Recursion};
use foreman_core::spec::{DEFAULT_MAX_ATTEMPTS, RepoState, TRIGGER_NIGHTLY, TRIGGER_WEEKLY};
use foreman_core::task::{Task, TaskSummary};
use foreman_core::window::Window;
use foreman_db::error::DbError;
use foreman_db::job_cache::JobCache;
use foreman_db::job_store::JobStore;
use foreman_db::task_cache::TaskCache;
use foreman_db::task_store::TaskStore;
use redb::Database;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration as StdDuration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// How many queue entries `status()` reports.
pub const NUM_TOP_CANDIDATES: usize = 50;

/// Snapshot of the scheduler's externally visible state.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub last_scheduled: Option<DateTime<Utc>>,
    pub top_candidates: Vec<TaskCandidate>,
}

#[derive(Default)]
struct QueueState {
    queue: Vec<TaskCandidate>,
    last_scheduled: Option<DateTime<Utc>>,
}

type NewTaskMap = HashMap<RepoState, HashSet<String>>;

/// The scheduling core. One instance drives all repositories.
///
/// All locks guard short synchronous sections; none is held across a
/// suspension point.
pub struct TaskScheduler {
    config: SchedulerConfig,
    db: Arc<Database>,
    executor: Arc<dyn ExecutorClient>,
    stager: Arc<dyn InputStager>,
    syncers: Arc<HashMap<String, Box<dyn RepoSyncer>>>,
    spec_cache: Arc<SpecCache>,
    blacklist: RwLock<Blacklist>,
    busy_bots: Mutex<BusyBots>,
    graphs: RwLock<Arc<HashMap<String, Graph>>>,
    window: RwLock<Arc<Window>>,
    task_cache: RwLock<Arc<TaskCache>>,
    job_cache: RwLock<Arc<JobCache>>,
    new_tasks: RwLock<Arc<NewTaskMap>>,
    queue: RwLock<QueueState>,
    periodic: Mutex<PeriodicTriggers>,
    events: EventBus,
}

impl TaskScheduler {
    pub fn new(
        config: SchedulerConfig,
        db: Arc<Database>,
        executor: Arc<dyn ExecutorClient>,
        stager: Arc<dyn InputStager>,
        syncers: HashMap<String, Box<dyn RepoSyncer>>,
        cfg_source: Box<dyn CfgSource>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.work_dir).context(format!(
            "failed to create work dir {}",
            config.work_dir.display()
        ))?;
        let blacklist = Blacklist::from_file(config.blacklist_path())?;
        let spec_cache = Arc::new(SpecCache::new(cfg_source, config.cfg_cache_dir())?);
        let periodic = PeriodicTriggers::from_file(config.periodic_state_path())?;
        let window = Window::new(config.period(), config.num_commits);
        Ok(Self {
            config,
            db,
            executor,
            stager,
            syncers: Arc::new(syncers),
            spec_cache,
            blacklist: RwLock::new(blacklist),
            busy_bots: Mutex::new(BusyBots::new()),
            graphs: RwLock::new(Arc::new(HashMap::new())),
            window: RwLock::new(Arc::new(window)),
            task_cache: RwLock::new(Arc::new(TaskCache::default())),
            job_cache: RwLock::new(Arc::new(JobCache::default())),
            new_tasks: RwLock::new(Arc::new(NewTaskMap::new())),
            queue: RwLock::new(QueueState::default()),
            periodic: Mutex::new(periodic),
            events: EventBus::new(),
        })
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// Drive the scheduler until cancelled: the main tick loop plus the
    /// slower unfinished-task update loop.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let updater = {
            let scheduler = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(StdDuration::from_secs(
                    scheduler.config.task_update_interval_secs,
                ));
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(err) = scheduler.update_unfinished_tasks().await {
                                tracing::error!(error = %err, "periodic task update failed");
                            }
                        }
                    }
                }
            })
        };

        let mut interval =
            tokio::time::interval(StdDuration::from_secs(self.config.tick_interval_secs));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.tick(&cancel).await {
                        tracing::error!(error = %err, "scheduling tick failed");
                    }
                }
            }
        }
        let _ = updater.await;
        tracing::info!("scheduler stopped");
    }

    /// One end-to-end scheduling tick. Any error aborts the
    /// tick; the next one starts fresh. Returns the number of tasks
    /// dispatched.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<usize> {
        self.events.emit(EventKind::TickStarted);
        let now = Utc::now();

        // List free bots and sync the repo mirrors in parallel.
        let syncers = Arc::clone(&self.syncers);
        let sync_handle = tokio::task::spawn_blocking(move || -> Result<HashMap<String, Graph>> {
            let mut graphs = HashMap::new();
            for (repo, syncer) in syncers.iter() {
                graphs.insert(repo.clone(), syncer.sync()?);
            }
            Ok(graphs)
        });
        let (bots, synced) = tokio::join!(self.get_free_bots(), sync_handle);
        let bots = bots?;
        let graphs = Arc::new(synced.context("repo sync panicked")??);
        {
            let mut window = Window::new(self.config.period(), self.config.num_commits);
            window.update(now, &graphs);
            *self.graphs.write().unwrap() = Arc::clone(&graphs);
            *self.window.write().unwrap() = Arc::new(window);
        }
        if cancel.is_cancelled() {
            return Ok(0);
        }

        self.refresh_task_cache()?;
        self.refresh_job_cache()?;
        self.update_unfinished_jobs()?;

        self.gather_new_jobs(now)?;
        if cancel.is_cancelled() {
            return Ok(0);
        }

        tracing::info!("regenerating the task queue");
        let queue = self.regenerate_queue(now).await?;
        if cancel.is_cancelled() {
            return Ok(0);
        }

        tracing::info!(queue = queue.len(), bots = bots.len(), "scheduling tasks");
        let dispatched = self.schedule_tasks(bots, queue).await?;
        Ok(dispatched)
    }

    /// List free bots across the configured pools, dropping dead,
    /// quarantined, and busy machines, then applying the pending-task
    /// reservations.
    async fn get_free_bots(&self) -> Result<Vec<BotInfo>> {
        let mut workers = JoinSet::new();
        for pool in &self.config.pools {
            let executor = Arc::clone(&self.executor);
            let pool = pool.clone();
            workers.spawn(async move {
                let bots = executor.list_free_bots(&pool).await?;
                let pending = executor.list_pending_tasks(&pool).await?;
                anyhow::Ok((bots, pending))
            });
        }
        let mut bots = Vec::new();
        let mut pending = Vec::new();
        while let Some(joined) = workers.join_next().await {
            let (b, p) = joined.context("bot listing panicked")??;
            bots.extend(b);
            pending.extend(p);
        }
        bots.retain(|b| !b.dead && !b.quarantined && b.task_id.is_none());

        let mut busy = self.busy_bots.lock().unwrap();
        busy.refresh_tasks(pending);
        let free = busy.filter(bots);
        tracing::debug!(free = free.len(), "listed free bots");
        Ok(free)
    }

    fn refresh_task_cache(&self) -> Result<()> {
        let window = Arc::clone(&self.window.read().unwrap());
        let cache = TaskCache::update(&TaskStore::new(&self.db), &window)?;
        *self.task_cache.write().unwrap() = Arc::new(cache);
        Ok(())
    }

    fn refresh_job_cache(&self) -> Result<()> {
        let window = Arc::clone(&self.window.read().unwrap());
        let cache = JobCache::update(&JobStore::new(&self.db), &window)?;
        *self.job_cache.write().unwrap() = Arc::new(cache);
        Ok(())
    }

    /// Fold task outcomes into job statuses. Jobs whose task
    /// summaries changed are re-derived and persisted; done jobs get
    /// their finish time.
    pub fn update_unfinished_jobs(&self) -> Result<()> {
        let job_cache = Arc::clone(&self.job_cache.read().unwrap());
        let task_cache = Arc::clone(&self.task_cache.read().unwrap());

        let mut modified: Vec<Job> = Vec::new();
        for job in job_cache.unfinished_jobs() {
            let mut summaries: BTreeMap<String, Vec<TaskSummary>> = BTreeMap::new();
            for dep in &job.dependencies {
                let key = job.make_task_key(dep);
                let sums: Vec<TaskSummary> = task_cache
                    .get_tasks_by_key(&key)
                    .into_iter()
                    .map(|t| t.make_summary())
                    .collect();
                summaries.insert(dep.clone(), sums);
            }
            if summaries == job.tasks {
                continue;
            }
            let mut job = job.clone();
            job.tasks = summaries;
            let rs = job.repo_state.clone();
            job.status = job.derive_status(|dep| {
                self.spec_cache
                    .get_task_spec(&rs, dep)
                    .map(|s| s.effective_max_attempts())
                    .unwrap_or(DEFAULT_MAX_ATTEMPTS)
            });
            if job.done() {
                job.finished = Some(Utc::now());
                self.events.emit(EventKind::JobFinished {
                    job_id: job.id,
                    status: job.status,
                });
                tracing::info!(job = %job.id, status = %job.status, "job finished");
            }
            modified.push(job);
        }
        if !modified.is_empty() {
            JobStore::new(&self.db)
                .put_jobs(&mut modified)
                .context("failed to persist updated jobs")?;
            self.refresh_job_cache()?;
        }
        Ok(())
    }

    /// Poll the executor for every unfinished task and fold the results
    /// into the store. Runs on the slower secondary loop.
    pub async fn update_unfinished_tasks(&self) -> Result<()> {
        self.refresh_task_cache()?;
        let cache = Arc::clone(&self.task_cache.read().unwrap());
        let unfinished: Vec<Task> = cache.unfinished_tasks().into_iter().cloned().collect();
        tracing::info!(tasks = unfinished.len(), "polling unfinished tasks");

        let mut workers = JoinSet::new();
        for task in unfinished {
            let Some(executor_id) = task.executor_task_id.clone() else {
                continue;
            };
            let executor = Arc::clone(&self.executor);
            workers.spawn(async move {
                executor
                    .get_task(&executor_id)
                    .await
                    .with_context(|| format!("failed to fetch executor task {executor_id}"))
            });
        }

        let store = TaskStore::new(&self.db);
        let mut first_err = None;
        while let Some(joined) = workers.join_next().await {
            match joined.context("task poll panicked")? {
                Ok(result) => match update_task_from_executor(&store, &result) {
                    Ok(Some(id)) if result.state.to_task_status().is_done() => {
                        self.events.emit(EventKind::TaskFinished {
                            task_id: id,
                            status: result.state.to_task_status(),
                        });
                    }
                    Ok(_) => {}
                    Err(err) => first_err = first_err.or(Some(err)),
                },
                Err(err) => first_err = first_err.or(Some(err)),
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }
        self.refresh_task_cache()
    }

    /// Create per-commit jobs for new commits and fire periodic triggers
    /// that have come due.
    fn gather_new_jobs(&self, now: DateTime<Utc>) -> Result<()> {
        let graphs = Arc::clone(&self.graphs.read().unwrap());
        let window = Arc::clone(&self.window.read().unwrap());
        let job_cache = Arc::clone(&self.job_cache.read().unwrap());

        let mut new_jobs: Vec<Job> = Vec::new();
        for (repo, graph) in graphs.iter() {
            graph.recurse_all_branches(|commit| {
                if !window.test_commit(repo, commit) {
                    return Ok(Recursion::Stop);
                }
                if job_cache.scheduled_jobs_for_commit(repo, &commit.hash) {
                    // Older commits were already processed too.
                    return Ok(Recursion::Stop);
                }
                let rs = RepoState::new(repo.clone(), commit.hash.clone());
                let cfg = match self.spec_cache.read_tasks_cfg(&rs) {
                    Ok(cfg) => cfg,
                    Err(err) => {
                        tracing::warn!(repo_state = %rs, error = %err, "no readable task config; skipping commit");
                        return Ok(Recursion::Stop);
                    }
                };
                for (name, job_spec) in &cfg.jobs {
                    if job_spec.is_per_commit() {
                        new_jobs.push(self.spec_cache.make_job(rs.clone(), name, now)?);
                    }
                }
                if self.config.recursion_boundaries.contains(&commit.hash) {
                    // Configured boundary: history before this point
                    // predates the job configuration.
                    return Ok(Recursion::Stop);
                }
                Ok(Recursion::Continue)
            })?;
        }

        let store = JobStore::new(&self.db);
        let count = new_jobs.len();
        for job in new_jobs {
            let job = store.insert(job)?;
            self.events.emit(EventKind::JobCreated {
                job_id: job.id,
                name: job.name.clone(),
                repo: job.repo_state.repo.clone(),
                revision: job.repo_state.revision.clone(),
            });
        }
        if count > 0 {
            tracing::info!(jobs = count, "created jobs for new commits");
        }

        self.trigger_periodic_jobs(now)?;
        self.refresh_job_cache()
    }

    /// Instantiate nightly/weekly job specs at the branch heads when
    /// their period has elapsed.
    fn trigger_periodic_jobs(&self, now: DateTime<Utc>) -> Result<()> {
        let graphs = Arc::clone(&self.graphs.read().unwrap());
        let store = JobStore::new(&self.db);
        let mut periodic = self.periodic.lock().unwrap();
        for trigger in [TRIGGER_NIGHTLY, TRIGGER_WEEKLY] {
            if !periodic.due(trigger, now) {
                continue;
            }
            let mut count = 0usize;
            for (repo, graph) in graphs.iter() {
                for (_branch, head) in graph.branch_heads() {
                    let rs = RepoState::new(repo.clone(), head.to_string());
                    let cfg = match self.spec_cache.read_tasks_cfg(&rs) {
                        Ok(cfg) => cfg,
                        Err(_) => continue,
                    };
                    for (name, job_spec) in &cfg.jobs {
                        if job_spec.trigger != trigger {
                            continue;
                        }
                        let job = store.insert(self.spec_cache.make_job(rs.clone(), name, now)?)?;
                        self.events.emit(EventKind::JobCreated {
                            job_id: job.id,
                            name: job.name.clone(),
                            repo: repo.clone(),
                            revision: head.to_string(),
                        });
                        count += 1;
                    }
                }
            }
            periodic.mark(trigger, now)?;
            tracing::info!(trigger, jobs = count, "fired periodic trigger");
        }
        Ok(())
    }

    /// Rebuild the candidate queue: discovery, filtering, scoring.
    async fn regenerate_queue(&self, now: DateTime<Utc>) -> Result<Vec<TaskCandidate>> {
        let graphs = Arc::clone(&self.graphs.read().unwrap());
        let window = Arc::clone(&self.window.read().unwrap());

        // Refresh the spec-introduction map used as the blamelist
        // boundary.
        let new_tasks = Arc::new(self.spec_cache.added_task_specs(&graphs, &window)?);
        *self.new_tasks.write().unwrap() = Arc::clone(&new_tasks);

        let job_cache = Arc::clone(&self.job_cache.read().unwrap());
        let task_cache = Arc::clone(&self.task_cache.read().unwrap());
        let unfinished: Vec<Job> = job_cache.unfinished_jobs().into_iter().cloned().collect();

        let candidates = find_candidates_for_jobs(&unfinished, &window, &self.spec_cache);
        let buckets = {
            let blacklist = self.blacklist.read().unwrap();
            filter_candidates(candidates, &blacklist, &window, &graphs, &task_cache)?
        };

        let ctx = Arc::new(ScoringContext {
            now,
            cache: task_cache,
            graphs,
            window,
            new_tasks,
            time_decay_amt_24hr: self.config.time_decay_amt_24hr,
        });
        process_candidates(ctx, buckets).await
    }

    /// Match bots to the queue, dispatch, persist, and swap the queue.
    async fn schedule_tasks(
        &self,
        bots: Vec<BotInfo>,
        queue: Vec<TaskCandidate>,
    ) -> Result<usize> {
        let schedule = get_candidates_to_schedule(&bots, &queue, self.config.min_score);

        let (triggered, mut errors) = stage_and_trigger(
            Arc::clone(&self.db),
            Arc::clone(&self.executor),
            Arc::clone(&self.stager),
            self.config.pubsub_topic.clone(),
            schedule,
        )
        .await;

        let num_triggered = triggered.len();
        let mut dispatched_keys = HashSet::new();
        if !triggered.is_empty() {
            for task in &triggered {
                self.events.emit(EventKind::TaskDispatched {
                    task_id: task.id,
                    name: task.key.name.clone(),
                    repo: task.key.repo.clone(),
                    revision: task.key.revision.clone(),
                    executor_task_id: task.executor_task_id.clone().unwrap_or_default(),
                });
            }
            let window = Arc::clone(&self.window.read().unwrap());
            let graphs = Arc::clone(&self.graphs.read().unwrap());
            let new_tasks = Arc::clone(&self.new_tasks.read().unwrap());
            let groups = group_tasks(triggered.clone());
            match add_tasks(Arc::clone(&self.db), window, graphs, new_tasks, groups).await {
                Ok(()) => {
                    dispatched_keys = triggered.into_iter().map(|t| t.key).collect();
                    tracing::info!(
                        triggered = num_triggered,
                        bots = bots.len(),
                        queue = queue.len(),
                        "triggered tasks"
                    );
                }
                Err(err) => {
                    errors.push(err.context("triggered tasks but failed to insert into the store"));
                }
            }
        } else {
            tracing::info!(queue = queue.len(), bots = bots.len(), "triggered no tasks");
        }

        let new_queue: Vec<TaskCandidate> = queue
            .into_iter()
            .filter(|c| !dispatched_keys.contains(&c.key))
            .collect();
        let queue_len = new_queue.len();
        {
            let mut state = self.queue.write().unwrap();
            state.queue = new_queue;
            state.last_scheduled = Some(Utc::now());
        }
        self.events.emit(EventKind::TickFinished {
            dispatched: dispatched_keys.len(),
            queue_len,
        });

        if !errors.is_empty() {
            let joined: Vec<String> = errors.iter().map(|e| format!("{e:#}")).collect();
            bail!("scheduling failures: {}", joined.join("; "));
        }
        Ok(dispatched_keys.len())
    }

    // ---- Externally observable operations ----

    /// Create a manually-forced job and return its id.
    pub fn trigger_job(&self, repo: &str, revision: &str, job_name: &str) -> Result<JobId> {
        let rs = RepoState::new(repo.to_string(), revision.to_string());
        let mut job = self.spec_cache.make_job(rs, job_name, Utc::now())?;
        job.is_force = true;
        let job = JobStore::new(&self.db).insert(job)?;
        tracing::info!(job = %job.id, name = job_name, "created manually-triggered job");
        self.events.emit(EventKind::JobCreated {
            job_id: job.id,
            name: job.name.clone(),
            repo: job.repo_state.repo.clone(),
            revision: job.repo_state.revision.clone(),
        });
        Ok(job.id)
    }

    /// Cancel a job if it is not already finished. Idempotent in the
    /// sense that a second cancel reports the already-finished state.
    pub fn cancel_job(&self, id: JobId) -> Result<Job> {
        let store = JobStore::new(&self.db);
        let job_cache = Arc::clone(&self.job_cache.read().unwrap());
        let mut job = job_cache
            .get_job_maybe_expired(&store, id)?
            .with_context(|| format!("no such job: {id}"))?;
        if job.done() {
            bail!("job {id} is already finished with status {}", job.status);
        }
        job.status = foreman_core::job::JobStatus::Canceled;
        job.finished = Some(Utc::now());
        store.put_job(&mut job)?;
        self.events.emit(EventKind::JobFinished {
            job_id: job.id,
            status: job.status,
        });
        self.refresh_job_cache()?;
        Ok(job)
    }

    pub fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let store = JobStore::new(&self.db);
        let job_cache = Arc::clone(&self.job_cache.read().unwrap());
        job_cache.get_job_maybe_expired(&store, id)
    }

    /// The current status: last successful scheduling time and the top
    /// of the queue.
    pub fn status(&self) -> SchedulerStatus {
        let state = self.queue.read().unwrap();
        SchedulerStatus {
            last_scheduled: state.last_scheduled,
            top_candidates: state
                .queue
                .iter()
                .take(NUM_TOP_CANDIDATES)
                .cloned()
                .collect(),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.read().unwrap().queue.len()
    }

    /// Recently seen job spec names, task spec names, and commits.
    pub fn recent_specs_and_commits(&self) -> (Vec<String>, Vec<String>, Vec<String>) {
        self.spec_cache.recent_specs_and_commits()
    }

    pub fn add_blacklist_rule(&self, rule: Rule) -> Result<()> {
        self.blacklist.write().unwrap().add_rule(rule)
    }

    pub fn remove_blacklist_rule(&self, rule_name: &str) -> Result<bool> {
        self.blacklist.write().unwrap().remove_rule(rule_name)
    }

    /// Insert an externally produced task, validating it first: no
    /// pre-assigned id, a known repo and revision, and a name that does
    /// not collide with a configured task spec. The blamelist is always
    /// recomputed.
    pub async fn validate_and_add_task(&self, mut task: Task) -> Result<()> {
        if task.id.0 != 0 {
            bail!("can not specify an id when adding a task, got {}", task.id);
        }
        if task.key.name.is_empty() || task.key.revision.is_empty() {
            bail!("task name and revision are required");
        }
        let graphs = Arc::clone(&self.graphs.read().unwrap());
        let graph = graphs
            .get(&task.key.repo)
            .with_context(|| format!("unknown repo: {}", task.key.repo))?;
        if graph.get(&task.key.revision).is_none() {
            bail!("no such commit {} in {}", task.key.revision, task.key.repo);
        }
        let rs = RepoState::new(task.key.repo.clone(), task.key.revision.clone());
        let cfg = self.spec_cache.read_tasks_cfg(&rs)?;
        if cfg.tasks.contains_key(&task.key.name) {
            bail!(
                "can not add an external task named after configured task spec {}",
                task.key.name
            );
        }
        if !task.commits.is_empty() {
            tracing::warn!(task = %task.key, "ignoring provided commits; blamelist is computed");
            task.commits.clear();
        }

        let window = Arc::clone(&self.window.read().unwrap());
        let new_tasks = Arc::clone(&self.new_tasks.read().unwrap());
        add_tasks(
            Arc::clone(&self.db),
            window,
            graphs,
            new_tasks,
            group_tasks(vec![task]),
        )
        .await
    }

    /// Update an externally produced task, rejecting changes to its key,
    /// creation time, or blamelist, and detecting concurrent writes.
    pub fn validate_and_update_task(&self, mut task: Task) -> Result<()> {
        if task.id.0 == 0 {
            bail!("must specify an id when updating a task");
        }
        let store = TaskStore::new(&self.db);
        let old = store
            .get(task.id)?
            .with_context(|| format!("no such task: {}", task.id))?;
        if old.db_modified != task.db_modified {
            return Err(DbError::ConcurrentUpdate.into());
        }
        if old.created != task.created {
            bail!("illegal update: creation time changed");
        }
        if old.key != task.key {
            bail!("illegal update: task key changed");
        }
        if old.commits != task.commits {
            bail!("illegal update: blamelist changed");
        }
        store.put_task(&mut task)
    }
}
