//! End-to-end scheduling scenarios: synthetic commit graphs, an
//! in-memory task config source, and a fake executor/stager standing in
//! for the remote services. Each test drives whole ticks through
//! `TaskScheduler` and asserts on the persisted tasks and jobs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use foreman_core::config::SchedulerConfig;
use foreman_core::job::JobStatus;
use foreman_core::repograph::{Commit, Graph};
use foreman_core::spec::{JobSpec, RepoState, TaskSpec, TasksCfg};
use foreman_core::task::{Task, TaskStatus};
use foreman_db::job_store::JobStore;
use foreman_db::task_store::TaskStore;
use foreman_scheduler::executor::{
    BotInfo, ExecutorClient, ExecutorTask, ExecutorTaskState, TaskRequest, TriggerResponse,
};
use foreman_scheduler::isolate::{InputStager, IsolateSpec};
use foreman_scheduler::repo_sync::{RepoSyncer, StaticSyncer};
use foreman_scheduler::scheduler::TaskScheduler;
use foreman_scheduler::spec_cache::{CfgSource, InMemoryCfgSource};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

const REPO: &str = "https://example.com/repo.git";

// ---- fakes -------------------------------------------------------------

struct FakeExecutor {
    bots: Mutex<Vec<BotInfo>>,
    pending: Mutex<Vec<ExecutorTask>>,
    results: Mutex<HashMap<String, ExecutorTask>>,
    next_id: AtomicU64,
}

impl FakeExecutor {
    fn new(bots: Vec<BotInfo>) -> Self {
        Self {
            bots: Mutex::new(bots),
            pending: Mutex::new(Vec::new()),
            results: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Mark every triggered task finished with the given state.
    fn finish_all(&self, state: ExecutorTaskState) {
        let mut results = self.results.lock().unwrap();
        for res in results.values_mut() {
            if res.state == ExecutorTaskState::Pending {
                res.state = state;
                res.completed = Some(Utc::now());
                res.isolated_output = Some(format!("out-{}", res.id));
            }
        }
    }

    fn triggered_count(&self) -> usize {
        self.results.lock().unwrap().len()
    }
}

#[async_trait]
impl ExecutorClient for FakeExecutor {
    async fn list_free_bots(&self, _pool: &str) -> Result<Vec<BotInfo>> {
        Ok(self.bots.lock().unwrap().clone())
    }

    async fn list_pending_tasks(&self, _pool: &str) -> Result<Vec<ExecutorTask>> {
        Ok(self.pending.lock().unwrap().clone())
    }

    async fn trigger_task(&self, req: &TaskRequest) -> Result<TriggerResponse> {
        let id = format!("ex-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let task = ExecutorTask {
            id: id.clone(),
            state: ExecutorTaskState::Pending,
            created: Utc::now(),
            completed: None,
            isolated_output: None,
            dimensions: req.dimensions.clone(),
            tags: req.tags.clone(),
        };
        self.results.lock().unwrap().insert(id.clone(), task);
        Ok(TriggerResponse {
            executor_task_id: id,
            created: Utc::now(),
        })
    }

    async fn get_task(&self, executor_task_id: &str) -> Result<ExecutorTask> {
        self.results
            .lock()
            .unwrap()
            .get(executor_task_id)
            .cloned()
            .context(format!("unknown executor task {executor_task_id}"))
    }
}

struct FakeStager;

#[async_trait]
impl InputStager for FakeStager {
    async fn stage(&self, rs: &RepoState, specs: &[IsolateSpec]) -> Result<Vec<String>> {
        Ok(specs
            .iter()
            .map(|s| format!("in-{}-{}", rs.revision, s.task_name))
            .collect())
    }

    fn server_url(&self) -> String {
        "fake://staging".into()
    }
}

struct SharedSyncer(Arc<StaticSyncer>);

impl RepoSyncer for SharedSyncer {
    fn sync(&self) -> Result<Graph> {
        self.0.sync()
    }
}

struct SharedCfg(Arc<InMemoryCfgSource>);

impl CfgSource for SharedCfg {
    fn read(&self, rs: &RepoState) -> Result<TasksCfg> {
        self.0.read(rs)
    }
}

// ---- harness -----------------------------------------------------------

fn linux_bot(id: &str) -> BotInfo {
    BotInfo {
        id: id.into(),
        dimensions: HashMap::from([("os".to_string(), HashSet::from(["Linux".to_string()]))]),
        dead: false,
        quarantined: false,
        task_id: None,
    }
}

fn simple_spec(deps: &[&str]) -> TaskSpec {
    TaskSpec {
        dimensions: vec!["os:Linux".into()],
        isolate: "ci.isolate".into(),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        max_attempts: 0,
        priority: 0.5,
    }
}

/// A config document with independent specs plus one per-commit job
/// bundling all of them.
fn cfg_for(specs: &[(&str, &[&str])]) -> TasksCfg {
    let mut cfg = TasksCfg::default();
    for (name, deps) in specs {
        cfg.tasks.insert(name.to_string(), simple_spec(deps));
    }
    cfg.jobs.insert(
        "CI".into(),
        JobSpec {
            task_specs: specs.iter().map(|(n, _)| n.to_string()).collect(),
            trigger: String::new(),
        },
    );
    cfg
}

/// Linear history c1..cN, most recent last, timestamps a few minutes
/// apart ending near now.
fn linear_graph(n: usize, now: DateTime<Utc>) -> Graph {
    let mut g = Graph::new();
    for i in 1..=n {
        g.insert(Commit {
            hash: format!("c{i}"),
            parents: if i == 1 {
                vec![]
            } else {
                vec![format!("c{}", i - 1)]
            },
            timestamp: now - Duration::minutes((n - i) as i64 + 1),
        });
    }
    g.set_branch_head("main", format!("c{n}"));
    g
}

struct Harness {
    _dir: tempfile::TempDir,
    db: Arc<redb::Database>,
    executor: Arc<FakeExecutor>,
    syncer: Arc<StaticSyncer>,
    cfg: Arc<InMemoryCfgSource>,
    scheduler: Arc<TaskScheduler>,
    cancel: CancellationToken,
}

impl Harness {
    fn new(graph: Graph, bots: Vec<BotInfo>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(foreman_db::open_db(&dir.path().join("foreman.redb")).unwrap());
        let executor = Arc::new(FakeExecutor::new(bots));
        let syncer = Arc::new(StaticSyncer::new(graph));
        let cfg = Arc::new(InMemoryCfgSource::new());

        let config = SchedulerConfig {
            work_dir: dir.path().join("work"),
            period_secs: 4 * 24 * 3600,
            num_commits: 5,
            time_decay_amt_24hr: 1.0,
            pools: vec!["default".into()],
            pubsub_topic: "foreman-tasks".into(),
            min_score: 0.0,
            recursion_boundaries: vec![],
            tick_interval_secs: 5,
            task_update_interval_secs: 300,
            repo: vec![],
        };

        let mut syncers: HashMap<String, Box<dyn RepoSyncer>> = HashMap::new();
        syncers.insert(
            REPO.to_string(),
            Box::new(SharedSyncer(Arc::clone(&syncer))),
        );

        let scheduler = Arc::new(
            TaskScheduler::new(
                config,
                Arc::clone(&db),
                Arc::clone(&executor) as Arc<dyn ExecutorClient>,
                Arc::new(FakeStager),
                syncers,
                Box::new(SharedCfg(Arc::clone(&cfg))),
            )
            .unwrap(),
        );

        Self {
            _dir: dir,
            db,
            executor,
            syncer,
            cfg,
            scheduler,
            cancel: CancellationToken::new(),
        }
    }

    fn insert_cfg(&self, revision: &str, cfg: TasksCfg) {
        self.cfg.insert(RepoState::new(REPO, revision), cfg);
    }

    async fn tick(&self) -> usize {
        self.scheduler.tick(&self.cancel).await.unwrap()
    }

    /// Finish all outstanding executor tasks and fold the results in.
    async fn finish_all(&self, state: ExecutorTaskState) {
        self.executor.finish_all(state);
        self.scheduler.update_unfinished_tasks().await.unwrap();
    }

    fn tasks(&self) -> Vec<Task> {
        TaskStore::new(&self.db).list().unwrap()
    }

    fn task_at(&self, revision: &str, name: &str) -> Task {
        self.tasks()
            .into_iter()
            .find(|t| t.key.revision == revision && t.key.name == name)
            .unwrap_or_else(|| panic!("no task {name} @ {revision}"))
    }

    /// Coverage uniqueness: across all non-try tasks of one spec, no
    /// commit appears in two blamelists; self-inclusion holds.
    fn assert_coverage_invariants(&self) {
        let mut by_spec: HashMap<(String, String), HashSet<String>> = HashMap::new();
        for t in self.tasks() {
            if t.is_try_job {
                continue;
            }
            if !t.commits.is_empty() {
                assert!(
                    t.commits.iter().any(|c| c == &t.key.revision),
                    "task {} missing its own revision in {:?}",
                    t.key,
                    t.commits
                );
            }
            let seen = by_spec
                .entry((t.key.repo.clone(), t.key.name.clone()))
                .or_default();
            for c in &t.commits {
                assert!(seen.insert(c.clone()), "commit {c} covered twice");
            }
        }
    }
}

// ---- scenarios ---------------------------------------------------------

/// Scenario 1: fresh linear history. The tip candidate covers the whole
/// history and wins the single bot; a new commit afterwards gets a
/// single-commit blamelist.
#[tokio::test]
async fn fresh_linear_history_then_new_commit() {
    let now = Utc::now();
    let h = Harness::new(linear_graph(5, now), vec![linux_bot("bot-1")]);
    for i in 1..=5 {
        h.insert_cfg(&format!("c{i}"), cfg_for(&[("Build", &[])]));
    }

    let dispatched = h.tick().await;
    assert_eq!(dispatched, 1);
    let tip = h.task_at("c5", "Build");
    assert_eq!(tip.commits, vec!["c5", "c4", "c3", "c2", "c1"]);
    assert_eq!(tip.status, TaskStatus::Pending);
    // The remaining bisect candidates stay queued (bot starvation).
    assert!(h.scheduler.queue_len() > 0);
    let status = h.scheduler.status();
    assert!(status.last_scheduled.is_some());
    assert_eq!(status.top_candidates.len(), h.scheduler.queue_len());

    // Tip succeeds; a new commit lands.
    h.finish_all(ExecutorTaskState::Completed).await;
    let now2 = Utc::now();
    let mut graph = linear_graph(5, now2);
    graph.insert(Commit {
        hash: "c6".into(),
        parents: vec!["c5".into()],
        timestamp: now2,
    });
    graph.set_branch_head("main", "c6");
    h.syncer.set(graph);
    h.insert_cfg("c6", cfg_for(&[("Build", &[])]));

    let dispatched = h.tick().await;
    assert_eq!(dispatched, 1);
    let new_tip = h.task_at("c6", "Build");
    assert_eq!(new_tip.commits, vec!["c6"]);
    h.assert_coverage_invariants();
}

/// Scenario 2: a failed task's retry scores zero and is never matched
/// by the default threshold.
#[tokio::test]
async fn retry_scores_zero_and_waits() {
    let now = Utc::now();
    let h = Harness::new(linear_graph(1, now), vec![linux_bot("bot-1")]);
    h.insert_cfg("c1", cfg_for(&[("Build", &[])]));

    assert_eq!(h.tick().await, 1);
    h.finish_all(ExecutorTaskState::Failed).await;

    let dispatched = h.tick().await;
    assert_eq!(dispatched, 0, "zero-score retry must not dispatch");
    let status = h.scheduler.status();
    assert_eq!(status.top_candidates.len(), 1);
    let retry = &status.top_candidates[0];
    assert_eq!(retry.attempt, 1);
    assert_eq!(retry.score, 0.0);
    assert_eq!(retry.commits.len(), 1);
    assert!(retry.retry_of.is_some());
}

/// Scenario 3: bisect. A job in the middle of a covered range steals
/// the bottom of the prior task's blamelist.
#[tokio::test]
async fn bisect_splits_existing_coverage() {
    let now = Utc::now();
    let h = Harness::new(linear_graph(5, now), vec![linux_bot("bot-1")]);
    // Config is only readable at c3 and c5: job gathering stops at the
    // unreadable tip... so pre-populate the state by hand instead.
    h.insert_cfg("c3", cfg_for(&[("Build", &[])]));
    h.insert_cfg("c5", cfg_for(&[("Build", &[])]));

    // Prior state: a successful task at c5 covering everything, its job
    // finished; an unfinished job at c3.
    {
        let store = TaskStore::new(&h.db);
        let mut t = Task::new(
            foreman_core::task::TaskKey::new(REPO, "c5", "Build"),
            now - Duration::minutes(30),
        );
        t.status = TaskStatus::Success;
        t.isolated_output = Some("out".into());
        t.commits = vec![
            "c5".into(),
            "c4".into(),
            "c3".into(),
            "c2".into(),
            "c1".into(),
        ];
        store.assign_id(&mut t).unwrap();
        store.put_task(&mut t).unwrap();

        let jobs = JobStore::new(&h.db);
        for revision in ["c1", "c2", "c4", "c5"] {
            let mut j = foreman_core::job::Job::new(
                "CI",
                RepoState::new(REPO, revision),
                now - Duration::minutes(30),
            );
            j.status = JobStatus::Success;
            j.finished = Some(now);
            jobs.insert(j).unwrap();
        }
        let mut mid = foreman_core::job::Job::new(
            "CI",
            RepoState::new(REPO, "c3"),
            now - Duration::minutes(5),
        );
        mid.dependencies = vec!["Build".into()];
        jobs.insert(mid).unwrap();
    }

    let dispatched = h.tick().await;
    assert_eq!(dispatched, 1);
    let bisect = h.task_at("c3", "Build");
    assert_eq!(bisect.commits, vec!["c3", "c2", "c1"]);
    let reduced = h.task_at("c5", "Build");
    assert_eq!(reduced.commits, vec!["c5", "c4"]);
    h.assert_coverage_invariants();
}

/// Scenario 4: a spec introduced mid-history bounds its blamelist at
/// the introduction commit.
#[tokio::test]
async fn new_spec_blamelist_stops_at_introduction() {
    let now = Utc::now();
    let h = Harness::new(linear_graph(6, now), vec![linux_bot("bot-1")]);
    // Lint exists only from c4 onward.
    for i in 1..=3 {
        h.insert_cfg(&format!("c{i}"), TasksCfg::default());
    }
    for i in 4..=6 {
        h.insert_cfg(&format!("c{i}"), cfg_for(&[("Lint", &[])]));
    }

    let dispatched = h.tick().await;
    assert_eq!(dispatched, 1);
    let tip = h.task_at("c6", "Lint");
    assert_eq!(tip.commits, vec!["c6", "c5", "c4"]);
}

/// Scenario 5: an unbroken history longer than the blamelist bound
/// collapses to a single-commit blamelist.
#[tokio::test]
async fn oversized_blamelist_collapses() {
    let n = foreman_core::task::MAX_BLAMELIST_COMMITS + 200;
    let now = Utc::now();
    let h = Harness::new(linear_graph(n, now), vec![linux_bot("bot-1")]);
    // Config readable only at the tip: one job, one candidate.
    let tip = format!("c{n}");
    h.insert_cfg(&tip, cfg_for(&[("Build", &[])]));

    let dispatched = h.tick().await;
    assert_eq!(dispatched, 1);
    let task = h.task_at(&tip, "Build");
    assert_eq!(task.commits, vec![tip]);
}

/// A dependency satisfied in one tick enables the dependent in the
/// next, not retroactively within the same tick.
#[tokio::test]
async fn dependencies_enable_on_the_next_tick() {
    let now = Utc::now();
    let h = Harness::new(
        linear_graph(1, now),
        vec![linux_bot("bot-1"), linux_bot("bot-2")],
    );
    h.insert_cfg("c1", cfg_for(&[("Compile", &[]), ("Test", &["Compile"])]));

    // Tick 1: only Compile is runnable even though two bots are free.
    assert_eq!(h.tick().await, 1);
    assert_eq!(h.tasks().len(), 1);
    assert_eq!(h.tasks()[0].key.name, "Compile");

    h.finish_all(ExecutorTaskState::Completed).await;

    // Tick 2: Test runs with the dependency's output attached.
    assert_eq!(h.tick().await, 1);
    let test = h.task_at("c1", "Test");
    let compile = h.task_at("c1", "Compile");
    assert_eq!(test.parent_task_ids, vec![compile.id]);

    h.finish_all(ExecutorTaskState::Completed).await;
    h.tick().await;
    // The job saw both specs finish.
    let jobs = JobStore::new(&h.db).list().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Success);
    assert!(jobs[0].finished.is_some());
}

/// Steady state: once every job is finished and nothing changes
/// externally, further ticks dispatch nothing and the queue is stable.
#[tokio::test]
async fn tick_is_idempotent_on_steady_state() {
    let now = Utc::now();
    let h = Harness::new(linear_graph(3, now), vec![linux_bot("bot-1")]);
    for i in 1..=3 {
        h.insert_cfg(&format!("c{i}"), cfg_for(&[("Build", &[])]));
    }

    // Drain: dispatch, succeed, repeat until quiescent (the backfill
    // candidates dispatch one per tick on the single bot).
    for _ in 0..10 {
        let dispatched = h.tick().await;
        h.finish_all(ExecutorTaskState::Completed).await;
        if dispatched == 0 {
            break;
        }
    }

    let tasks_before = h.tasks().len();
    let queue_before = h.scheduler.queue_len();
    assert_eq!(h.tick().await, 0);
    assert_eq!(h.tick().await, 0);
    assert_eq!(h.tasks().len(), tasks_before);
    assert_eq!(h.scheduler.queue_len(), queue_before);
    assert_eq!(h.executor.triggered_count(), tasks_before);
    h.assert_coverage_invariants();
}

/// Forced jobs run again at an already-succeeded coordinate, with a
/// force-level score, under their own task key.
#[tokio::test]
async fn forced_job_reruns_succeeded_commit() {
    let now = Utc::now();
    let h = Harness::new(linear_graph(2, now), vec![linux_bot("bot-1")]);
    for i in 1..=2 {
        h.insert_cfg(&format!("c{i}"), cfg_for(&[("Build", &[])]));
    }
    assert_eq!(h.tick().await, 1);
    h.finish_all(ExecutorTaskState::Completed).await;

    let job_id = h.scheduler.trigger_job(REPO, "c2", "CI").unwrap();
    let dispatched = h.tick().await;
    assert_eq!(dispatched, 1);
    let forced: Vec<Task> = h
        .tasks()
        .into_iter()
        .filter(|t| t.key.forced_job_id.is_some())
        .collect();
    assert_eq!(forced.len(), 1);
    assert_eq!(forced[0].key.forced_job_id, Some(job_id.0));
    assert_eq!(forced[0].key.revision, "c2");
}

/// Canceling a job is rejected once it is finished.
#[tokio::test]
async fn cancel_job_lifecycle() {
    let now = Utc::now();
    let h = Harness::new(linear_graph(1, now), vec![]);
    h.insert_cfg("c1", cfg_for(&[("Build", &[])]));
    // A tick with no bots creates the job but dispatches nothing.
    assert_eq!(h.tick().await, 0);

    let jobs = JobStore::new(&h.db).list().unwrap();
    let id = jobs[0].id;
    let canceled = h.scheduler.cancel_job(id).unwrap();
    assert_eq!(canceled.status, JobStatus::Canceled);
    assert!(canceled.finished.is_some());

    let err = h.scheduler.cancel_job(id).unwrap_err();
    assert!(err.to_string().contains("already finished"));

    // A canceled job produces no more candidates.
    assert_eq!(h.tick().await, 0);
    assert_eq!(h.scheduler.queue_len(), 0);
}

/// Mishap results surface as job mishaps once attempts are exhausted
/// by infrastructure failures... they are not retried like failures.
#[tokio::test]
async fn executor_mishap_folds_into_task_status() {
    let now = Utc::now();
    let h = Harness::new(linear_graph(1, now), vec![linux_bot("bot-1")]);
    h.insert_cfg("c1", cfg_for(&[("Build", &[])]));

    assert_eq!(h.tick().await, 1);
    h.finish_all(ExecutorTaskState::BotDied).await;
    let task = h.task_at("c1", "Build");
    assert_eq!(task.status, TaskStatus::Mishap);
    assert!(task.finished.is_some());
}
