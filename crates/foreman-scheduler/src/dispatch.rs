//! Dispatch pipeline: stage inputs per RepoState, submit per task, then
//! persist per `(repo, spec name)` group with blamelist adjustment.

use crate::blamelist::compute_blamelist;
use crate::candidates::TaskCandidate;
use crate::executor::{ExecutorClient, TAG_FOREMAN_ID, TaskRequest};
use crate::isolate::{InputStager, IsolateSpec};
use anyhow::{Context, Result, bail};
use chrono::Utc;
use foreman_core::repograph::Graph;
use foreman_core::spec::RepoState;
use foreman_core::task::{Task, TaskId};
use foreman_core::window::Window;
use foreman_db::error::DbError;
use foreman_db::task_cache::{CacheWrapper, TaskCache};
use foreman_db::task_store::TaskStore;
use foreman_db::NUM_RETRIES;
use redb::Database;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Tasks grouped by `(repo, spec name)` for persistence.
pub type TaskGroups = HashMap<(String, String), Vec<Task>>;

/// Stage inputs and submit the matched candidates to the executor.
///
/// Staging runs once per RepoState; submission runs once per candidate.
/// The stages are connected by a bounded channel and share an error
/// channel — one candidate's failure never stops the others. Returns the
/// successfully submitted task records and the per-candidate failures.
pub async fn stage_and_trigger(
    db: Arc<Database>,
    executor: Arc<dyn ExecutorClient>,
    stager: Arc<dyn InputStager>,
    pubsub_topic: String,
    schedule: Vec<TaskCandidate>,
) -> (Vec<Task>, Vec<anyhow::Error>) {
    let cap = schedule.len().max(1);
    let (staged_tx, mut staged_rx) = mpsc::channel::<TaskCandidate>(cap);
    let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(cap * 2);

    // Stage inputs, one worker per RepoState group.
    let mut by_repo_state: HashMap<RepoState, Vec<TaskCandidate>> = HashMap::new();
    for c in schedule {
        by_repo_state.entry(c.repo_state()).or_default().push(c);
    }
    let stage_err_tx = err_tx.clone();
    let stager_for_stage = Arc::clone(&stager);
    let stage_task = tokio::spawn(async move {
        let mut workers = JoinSet::new();
        for (rs, group) in by_repo_state {
            let stager = Arc::clone(&stager_for_stage);
            let staged_tx = staged_tx.clone();
            let err_tx = stage_err_tx.clone();
            workers.spawn(async move {
                match stage_group(stager.as_ref(), &rs, group).await {
                    Ok(staged) => {
                        for c in staged {
                            let _ = staged_tx.send(c).await;
                        }
                    }
                    Err(err) => {
                        let _ = err_tx.send(err).await;
                    }
                }
            });
        }
        drop(staged_tx);
        while workers.join_next().await.is_some() {}
    });

    // Submit each staged candidate.
    let (done_tx, mut done_rx) = mpsc::channel::<Task>(cap);
    let submit_err_tx = err_tx.clone();
    drop(err_tx);
    let submit_task = tokio::spawn(async move {
        let mut workers = JoinSet::new();
        while let Some(candidate) = staged_rx.recv().await {
            let db = Arc::clone(&db);
            let executor = Arc::clone(&executor);
            let stager = Arc::clone(&stager);
            let topic = pubsub_topic.clone();
            let done_tx = done_tx.clone();
            let err_tx = submit_err_tx.clone();
            workers.spawn(async move {
                match trigger_one(&db, executor.as_ref(), stager.as_ref(), &topic, candidate)
                    .await
                {
                    Ok(task) => {
                        let _ = done_tx.send(task).await;
                    }
                    Err(err) => {
                        let _ = err_tx.send(err).await;
                    }
                }
            });
        }
        drop(done_tx);
        while workers.join_next().await.is_some() {}
    });

    let mut triggered = Vec::new();
    let mut errors = Vec::new();
    loop {
        tokio::select! {
            task = done_rx.recv() => match task {
                Some(t) => triggered.push(t),
                None => break,
            },
            Some(err) = err_rx.recv() => errors.push(err),
        }
    }
    while let Some(err) = err_rx.recv().await {
        errors.push(err);
    }
    let _ = stage_task.await;
    let _ = submit_task.await;
    (triggered, errors)
}

/// Stage all candidates of one RepoState in a single staging call.
async fn stage_group(
    stager: &dyn InputStager,
    rs: &RepoState,
    mut group: Vec<TaskCandidate>,
) -> Result<Vec<TaskCandidate>> {
    let specs: Vec<IsolateSpec> = group
        .iter()
        .map(|c| IsolateSpec {
            task_name: c.key.name.clone(),
            isolate: c.spec.isolate.clone(),
            dependency_hashes: c.isolated_hashes.clone(),
        })
        .collect();
    let digests = stager
        .stage(rs, &specs)
        .await
        .with_context(|| {
            let names: Vec<String> = group.iter().map(|c| c.key.to_string()).collect();
            format!("staging failed for {}", names.join(", "))
        })?;
    if digests.len() != group.len() {
        bail!(
            "staging returned {} digests for {} tasks at {rs}",
            digests.len(),
            group.len()
        );
    }
    for (c, digest) in group.iter_mut().zip(digests) {
        c.isolated_input = Some(digest);
    }
    Ok(group)
}

/// Allocate an id, submit to the executor, and build the task record.
async fn trigger_one(
    db: &Database,
    executor: &dyn ExecutorClient,
    stager: &dyn InputStager,
    pubsub_topic: &str,
    candidate: TaskCandidate,
) -> Result<Task> {
    let mut task = candidate.make_task(Utc::now());
    let store = TaskStore::new(db);
    store
        .assign_id(&mut task)
        .context("failed to allocate a task id")?;

    let mut tags = HashMap::new();
    tags.insert(TAG_FOREMAN_ID.to_string(), task.id.0.to_string());
    tags.insert("name".to_string(), task.key.name.clone());
    tags.insert("repo".to_string(), task.key.repo.clone());
    tags.insert("revision".to_string(), task.key.revision.clone());

    let req = TaskRequest {
        name: task.key.name.clone(),
        isolated_input: task.isolated_input.clone().unwrap_or_default(),
        dimensions: candidate.spec.dimensions.clone(),
        priority: candidate.spec.priority,
        isolate_server_url: stager.server_url(),
        pubsub_topic: pubsub_topic.to_string(),
        tags,
    };
    let resp = executor
        .trigger_task(&req)
        .await
        .with_context(|| format!("failed to trigger {}", task.key))?;
    task.created = resp.created;
    task.executor_task_id = Some(resp.executor_task_id);
    Ok(task)
}

/// Group submitted tasks by `(repo, spec name)`.
pub fn group_tasks(tasks: Vec<Task>) -> TaskGroups {
    let mut groups: TaskGroups = HashMap::new();
    for t in tasks {
        groups
            .entry((t.key.repo.clone(), t.key.name.clone()))
            .or_default()
            .push(t);
    }
    groups
}

/// Persist task groups, computing blamelists and adjusting stolen-from
/// tasks. Groups are independent; each is written in one
/// atomic store call. The whole set is retried up to [`NUM_RETRIES`]
/// times on optimistic-concurrency conflicts; other errors abort.
pub async fn add_tasks(
    db: Arc<Database>,
    window: Arc<Window>,
    graphs: Arc<HashMap<String, Graph>>,
    new_tasks: Arc<HashMap<RepoState, HashSet<String>>>,
    groups: TaskGroups,
) -> Result<()> {
    let mut queue = groups;
    for _ in 0..NUM_RETRIES {
        if queue.is_empty() {
            return Ok(());
        }
        // Re-read the cache so each retry sees the conflicting writes.
        let cache = {
            let store = TaskStore::new(&db);
            Arc::new(TaskCache::update(&store, &window)?)
        };

        let mut workers: JoinSet<((String, String), Vec<Task>, Result<()>)> = JoinSet::new();
        for (key, tasks) in queue.drain() {
            let db = Arc::clone(&db);
            let cache = Arc::clone(&cache);
            let graphs = Arc::clone(&graphs);
            let window = Arc::clone(&window);
            let new_tasks = Arc::clone(&new_tasks);
            workers.spawn_blocking(move || {
                let graph = graphs.get(&key.0);
                let result = match graph {
                    Some(graph) => {
                        add_tasks_single_spec(&db, &cache, graph, &window, &new_tasks, &tasks)
                    }
                    None => Err(anyhow::anyhow!("no such repo: {}", key.0)),
                };
                (key, tasks, result)
            });
        }

        let mut retry: TaskGroups = HashMap::new();
        let mut fatal: Option<anyhow::Error> = None;
        while let Some(joined) = workers.join_next().await {
            let (key, tasks, result) = joined.context("add-tasks worker panicked")?;
            match result {
                Ok(()) => {}
                Err(err) if DbError::is_concurrent_update(&err) => {
                    retry.insert(key, tasks);
                }
                Err(err) => {
                    tracing::error!(repo = %key.0, spec = %key.1, error = %err, "failed to add task group");
                    fatal.get_or_insert(err);
                }
            }
        }
        if let Some(err) = fatal {
            return Err(err);
        }
        queue = retry;
    }

    if !queue.is_empty() {
        bail!("add_tasks: {NUM_RETRIES} consecutive concurrent updates");
    }
    Ok(())
}

/// Persist one group of tasks sharing `(repo, spec name)`, computing
/// blamelists against a scratch cache seeded with the current snapshot.
fn add_tasks_single_spec(
    db: &Database,
    cache: &TaskCache,
    graph: &Graph,
    window: &Window,
    new_tasks: &HashMap<RepoState, HashSet<String>>,
    tasks: &[Task],
) -> Result<()> {
    let Some(first) = tasks.first() else {
        return Ok(());
    };
    let repo = first.key.repo.clone();
    let name = first.key.name.clone();

    let mut tasks: Vec<Task> = tasks.to_vec();
    tasks.sort_by(|a, b| a.created.cmp(&b.created));

    let store = TaskStore::new(db);
    let mut wrapper = CacheWrapper::new(cache);
    let mut updated: BTreeMap<TaskId, Task> = BTreeMap::new();

    for task in &mut tasks {
        if task.key.repo != repo || task.key.name != name {
            bail!("mismatched repo or spec name in task group: {}", task.key);
        }
        if task.id.0 == 0 {
            store.assign_id(task)?;
        }
        if task.is_try_job {
            updated.insert(task.id, task.clone());
            continue;
        }

        let revision = graph
            .get(&task.key.revision)
            .context(format!("no such commit {} in {repo}", task.key.revision))?;
        if !window.test_time(&repo, revision.timestamp) {
            bail!(
                "can not add task {} at {}: before the window start",
                task.id,
                task.key.revision
            );
        }

        let (commits, stealing_from) =
            compute_blamelist(&wrapper, graph, &repo, &name, &task.key.revision, new_tasks)?;
        task.commits = commits;
        if !task.commits.is_empty() && !task.commits.iter().any(|c| c == &task.key.revision) {
            tracing::error!(
                task = %task.id,
                candidate = %task.key,
                "task blamelist does not include its own revision"
            );
        }
        updated.insert(task.id, task.clone());
        wrapper.insert(task.clone());

        if let Some(mut stolen) = stealing_from {
            if stolen.id != task.id {
                let taken: HashSet<&str> = task.commits.iter().map(|c| c.as_str()).collect();
                stolen.commits.retain(|c| !taken.contains(c.as_str()));
                updated.insert(stolen.id, stolen.clone());
                wrapper.insert(stolen);
            }
        }
    }

    let mut to_put: Vec<Task> = updated.into_values().collect();
    store.put_tasks(&mut to_put)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use foreman_core::repograph::Commit;
    use foreman_core::task::TaskKey;

    const REPO: &str = "https://example.com/repo.git";
    const NAME: &str = "Build";

    fn linear_graph(n: usize) -> Graph {
        let mut g = Graph::new();
        for i in 1..=n {
            g.insert(Commit {
                hash: format!("c{i}"),
                parents: if i == 1 {
                    vec![]
                } else {
                    vec![format!("c{}", i - 1)]
                },
                timestamp: Utc.timestamp_opt(1_700_000_000 + i as i64 * 60, 0).unwrap(),
            });
        }
        g.set_branch_head("main", format!("c{n}"));
        g
    }

    fn wide_window() -> Window {
        Window::new(Duration::days(3650), 1)
    }

    fn task_at(revision: &str, minute: i64) -> Task {
        Task::new(
            TaskKey::new(REPO, revision, NAME),
            Utc.timestamp_opt(1_700_100_000 + minute * 60, 0).unwrap(),
        )
    }

    fn env(
        graph: Graph,
    ) -> (
        tempfile::TempDir,
        Arc<Database>,
        Arc<Window>,
        Arc<HashMap<String, Graph>>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let db = foreman_db::open_db(&dir.path().join("t.redb")).unwrap();
        (
            dir,
            Arc::new(db),
            Arc::new(wide_window()),
            Arc::new(HashMap::from([(REPO.to_string(), graph)])),
        )
    }

    #[tokio::test]
    async fn add_fresh_task_computes_blamelist() {
        let (_dir, db, window, graphs) = env(linear_graph(5));
        let groups = group_tasks(vec![task_at("c5", 0)]);
        add_tasks(
            Arc::clone(&db),
            window,
            graphs,
            Arc::new(HashMap::new()),
            groups,
        )
        .await
        .unwrap();

        let store = TaskStore::new(&db);
        let all = store.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].commits, vec!["c5", "c4", "c3", "c2", "c1"]);
    }

    #[tokio::test]
    async fn bisect_adjusts_stolen_from() {
        let (_dir, db, window, graphs) = env(linear_graph(5));
        // First: full-coverage task at c5.
        add_tasks(
            Arc::clone(&db),
            Arc::clone(&window),
            Arc::clone(&graphs),
            Arc::new(HashMap::new()),
            group_tasks(vec![task_at("c5", 0)]),
        )
        .await
        .unwrap();

        // Then a bisect at c3 steals the bottom of the range.
        add_tasks(
            Arc::clone(&db),
            window,
            graphs,
            Arc::new(HashMap::new()),
            group_tasks(vec![task_at("c3", 1)]),
        )
        .await
        .unwrap();

        let store = TaskStore::new(&db);
        let all = store.list().unwrap();
        assert_eq!(all.len(), 2);
        let at_c5 = all.iter().find(|t| t.key.revision == "c5").unwrap();
        let at_c3 = all.iter().find(|t| t.key.revision == "c3").unwrap();
        assert_eq!(at_c3.commits, vec!["c3", "c2", "c1"]);
        assert_eq!(at_c5.commits, vec!["c5", "c4"]);

        // Coverage uniqueness: no commit is claimed twice.
        let mut seen = HashSet::new();
        for t in &all {
            for c in &t.commits {
                assert!(seen.insert(c.clone()), "commit {c} covered twice");
            }
        }
    }

    #[tokio::test]
    async fn try_jobs_persist_without_blamelists() {
        let (_dir, db, window, graphs) = env(linear_graph(3));
        let mut t = task_at("c3", 0);
        t.is_try_job = true;
        add_tasks(
            Arc::clone(&db),
            window,
            graphs,
            Arc::new(HashMap::new()),
            group_tasks(vec![t]),
        )
        .await
        .unwrap();
        let all = TaskStore::new(&db).list().unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].commits.is_empty());
    }

    #[tokio::test]
    async fn mismatched_group_is_rejected() {
        let (_dir, db, window, graphs) = env(linear_graph(3));
        let mut other = task_at("c2", 1);
        other.key.name = "Other".into();
        let mut groups = TaskGroups::new();
        groups.insert(
            (REPO.to_string(), NAME.to_string()),
            vec![task_at("c3", 0), other],
        );
        let err = add_tasks(db, window, graphs, Arc::new(HashMap::new()), groups)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("mismatched"));
    }

    #[tokio::test]
    async fn group_ordering_is_by_creation_time() {
        let (_dir, db, window, graphs) = env(linear_graph(4));
        // Added out of order: the c4 task was created first, so it is
        // processed first and covers everything; the later bisect at c2
        // steals from it.
        let groups = group_tasks(vec![task_at("c2", 5), task_at("c4", 1)]);
        add_tasks(
            Arc::clone(&db),
            window,
            graphs,
            Arc::new(HashMap::new()),
            groups,
        )
        .await
        .unwrap();
        let all = TaskStore::new(&db).list().unwrap();
        let at_c4 = all.iter().find(|t| t.key.revision == "c4").unwrap();
        let at_c2 = all.iter().find(|t| t.key.revision == "c2").unwrap();
        assert_eq!(at_c4.commits, vec!["c4", "c3"]);
        assert_eq!(at_c2.commits, vec!["c2", "c1"]);
    }
}
