//! Per-RepoState task-config cache.
//!
//! Task/job spec documents live inside the repository and are read at a
//! specific revision through a [`CfgSource`]. Documents are immutable per
//! RepoState, so they are cached in memory and on disk under
//! `<work_dir>/cfg-cache/`.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use foreman_core::job::Job;
use foreman_core::repograph::{Graph, Recursion};
use foreman_core::spec::{RepoState, TaskSpec, TasksCfg};
use foreman_core::window::Window;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Reads the task-config document of a repo at a revision.
pub trait CfgSource: Send + Sync {
    fn read(&self, repo_state: &RepoState) -> Result<TasksCfg>;
}

/// Git-backed source: reads `cfg_path` as a blob at the revision from a
/// local mirror.
pub struct GitCfgSource {
    /// repo name -> (mirror path, cfg path inside the repo)
    repos: HashMap<String, (PathBuf, String)>,
}

impl GitCfgSource {
    pub fn new(repos: HashMap<String, (PathBuf, String)>) -> Self {
        Self { repos }
    }
}

impl CfgSource for GitCfgSource {
    fn read(&self, rs: &RepoState) -> Result<TasksCfg> {
        let (mirror, cfg_path) = self
            .repos
            .get(&rs.repo)
            .context(format!("no mirror configured for {}", rs.repo))?;
        let repo = git2::Repository::open(mirror)
            .context(format!("failed to open mirror at {}", mirror.display()))?;
        let spec = format!("{}:{}", rs.revision, cfg_path);
        let obj = repo
            .revparse_single(&spec)
            .context(format!("no {cfg_path} at {}", rs.revision))?;
        let blob = obj
            .as_blob()
            .context(format!("{spec} is not a blob"))?;
        let cfg: TasksCfg = serde_json::from_slice(blob.content())
            .context(format!("invalid task config at {}", rs.revision))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// In-memory source for tests: RepoState -> document.
#[derive(Default)]
pub struct InMemoryCfgSource {
    cfgs: RwLock<HashMap<RepoState, TasksCfg>>,
}

impl InMemoryCfgSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, rs: RepoState, cfg: TasksCfg) {
        self.cfgs.write().unwrap().insert(rs, cfg);
    }
}

impl CfgSource for InMemoryCfgSource {
    fn read(&self, rs: &RepoState) -> Result<TasksCfg> {
        self.cfgs
            .read()
            .unwrap()
            .get(rs)
            .cloned()
            .context(format!("no task config for {rs}"))
    }
}

/// Memory + disk cache over a [`CfgSource`].
pub struct SpecCache {
    source: Box<dyn CfgSource>,
    cache_dir: PathBuf,
    mem: RwLock<HashMap<RepoState, Arc<TasksCfg>>>,
}

impl SpecCache {
    pub fn new(source: Box<dyn CfgSource>, cache_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir)
            .context(format!("failed to create {}", cache_dir.display()))?;
        Ok(Self {
            source,
            cache_dir,
            mem: RwLock::new(HashMap::new()),
        })
    }

    fn disk_path(&self, rs: &RepoState) -> PathBuf {
        let sanitized: String = rs
            .repo
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.cache_dir
            .join(format!("{sanitized}-{}.json", rs.revision))
    }

    /// Read the document for a RepoState: memory, then disk, then the
    /// source (writing back both caches).
    pub fn read_tasks_cfg(&self, rs: &RepoState) -> Result<Arc<TasksCfg>> {
        if let Some(cfg) = self.mem.read().unwrap().get(rs) {
            return Ok(Arc::clone(cfg));
        }

        let path = self.disk_path(rs);
        let cfg: TasksCfg = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .context(format!("failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .context(format!("corrupt cached config {}", path.display()))?
        } else {
            let cfg = self.source.read(rs)?;
            let json = serde_json::to_string(&cfg)?;
            std::fs::write(&path, json)
                .context(format!("failed to write {}", path.display()))?;
            cfg
        };

        let cfg = Arc::new(cfg);
        self.mem
            .write()
            .unwrap()
            .insert(rs.clone(), Arc::clone(&cfg));
        Ok(cfg)
    }

    pub fn get_task_spec(&self, rs: &RepoState, name: &str) -> Result<TaskSpec> {
        let cfg = self.read_tasks_cfg(rs)?;
        match cfg.tasks.get(name) {
            Some(spec) => Ok(spec.clone()),
            None => bail!("no task spec {name} at {rs}"),
        }
    }

    /// Instantiate a job spec at a RepoState, resolving the transitive
    /// task-spec closure into the job's dependency set.
    pub fn make_job(&self, rs: RepoState, name: &str, now: DateTime<Utc>) -> Result<Job> {
        let cfg = self.read_tasks_cfg(&rs)?;
        let deps = cfg.job_dependencies(name)?;
        let mut job = Job::new(name, rs, now);
        job.dependencies = deps;
        Ok(job)
    }

    /// The task specs first introduced at each windowed RepoState: a spec
    /// is "added" at a commit when it exists there but in none of the
    /// commit's parents. Used as the blamelist recursion boundary.
    pub fn added_task_specs(
        &self,
        graphs: &HashMap<String, Graph>,
        window: &Window,
    ) -> Result<HashMap<RepoState, HashSet<String>>> {
        let mut added = HashMap::new();
        for (repo, graph) in graphs {
            graph.recurse_all_branches(|commit| {
                if !window.test_commit(repo, commit) {
                    return Ok(Recursion::Stop);
                }
                let rs = RepoState::new(repo.clone(), commit.hash.clone());
                let cfg = match self.read_tasks_cfg(&rs) {
                    Ok(cfg) => cfg,
                    Err(err) => {
                        tracing::warn!(repo_state = %rs, error = %err, "skipping unreadable task config");
                        return Ok(Recursion::Stop);
                    }
                };
                let mut parent_specs: Option<BTreeSet<String>> = None;
                for parent in &commit.parents {
                    let parent_rs = RepoState::new(repo.clone(), parent.clone());
                    if let Ok(parent_cfg) = self.read_tasks_cfg(&parent_rs) {
                        parent_specs
                            .get_or_insert_with(BTreeSet::new)
                            .extend(parent_cfg.tasks.keys().cloned());
                    }
                }
                let new_here: HashSet<String> = if commit.parents.is_empty() {
                    // Root commit: everything is new.
                    cfg.tasks.keys().cloned().collect()
                } else {
                    match &parent_specs {
                        // Unreadable parents: conservatively treat
                        // nothing as new so blamelists are not cut short.
                        None => HashSet::new(),
                        Some(parents) => cfg
                            .tasks
                            .keys()
                            .filter(|name| !parents.contains(*name))
                            .cloned()
                            .collect(),
                    }
                };
                if !new_here.is_empty() {
                    added.insert(rs, new_here);
                }
                Ok(Recursion::Continue)
            })?;
        }
        Ok(added)
    }

    /// Recently seen job spec names, task spec names, and commits, from
    /// the in-memory cache.
    pub fn recent_specs_and_commits(&self) -> (Vec<String>, Vec<String>, Vec<String>) {
        let mem = self.mem.read().unwrap();
        let mut job_specs = BTreeSet::new();
        let mut task_specs = BTreeSet::new();
        let mut commits = BTreeSet::new();
        for (rs, cfg) in mem.iter() {
            commits.insert(rs.revision.clone());
            job_specs.extend(cfg.jobs.keys().cloned());
            task_specs.extend(cfg.tasks.keys().cloned());
        }
        (
            job_specs.into_iter().collect(),
            task_specs.into_iter().collect(),
            commits.into_iter().collect(),
        )
    }
}
