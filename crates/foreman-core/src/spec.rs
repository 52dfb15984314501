use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// Default number of attempts for a task spec which doesn't set one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Trigger name for jobs run once per day.
pub const TRIGGER_NIGHTLY: &str = "nightly";

/// Trigger name for jobs run once per week.
pub const TRIGGER_WEEKLY: &str = "weekly";

/// `(repo, revision)` — the coordinate at which task and job specs are
/// materialized. Value key; used as a map index throughout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoState {
    pub repo: String,
    pub revision: String,
}

impl RepoState {
    pub fn new(repo: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            revision: revision.into(),
        }
    }
}

impl fmt::Display for RepoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repo, self.revision)
    }
}

/// Named recipe for one executor invocation, attached to a RepoState.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Required executor dimensions, as ordered `key:value` constraints.
    pub dimensions: Vec<String>,
    /// Input recipe reference handed to the staging service.
    pub isolate: String,
    /// Names of task specs whose outputs this one consumes.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Maximum attempts for this spec; 0 means the default.
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default)]
    pub priority: f64,
}

impl TaskSpec {
    /// The attempt bound with the default applied.
    pub fn effective_max_attempts(&self) -> u32 {
        if self.max_attempts == 0 {
            DEFAULT_MAX_ATTEMPTS
        } else {
            self.max_attempts
        }
    }
}

/// Named bundle of task specs, attached to a RepoState.
///
/// An empty trigger means the job is created automatically for every new
/// commit; `"nightly"` and `"weekly"` are created by the periodic
/// trigger instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub task_specs: Vec<String>,
    #[serde(default)]
    pub trigger: String,
}

impl JobSpec {
    pub fn is_per_commit(&self) -> bool {
        self.trigger.is_empty()
    }
}

/// The task/job spec document for one RepoState.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TasksCfg {
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskSpec>,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobSpec>,
}

impl TasksCfg {
    /// Check internal consistency: every referenced task spec exists.
    pub fn validate(&self) -> Result<()> {
        for (name, task) in &self.tasks {
            for dep in &task.dependencies {
                if !self.tasks.contains_key(dep) {
                    bail!("task spec {name} depends on unknown task spec {dep}");
                }
            }
        }
        for (name, job) in &self.jobs {
            for ts in &job.task_specs {
                if !self.tasks.contains_key(ts) {
                    bail!("job spec {name} references unknown task spec {ts}");
                }
            }
        }
        Ok(())
    }

    /// The transitive closure of task specs needed by the named job spec,
    /// in deterministic (sorted) order.
    pub fn job_dependencies(&self, job_name: &str) -> Result<Vec<String>> {
        let job = match self.jobs.get(job_name) {
            Some(j) => j,
            None => bail!("no such job spec: {job_name}"),
        };
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = job.task_specs.iter().map(|s| s.as_str()).collect();
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.to_string()) {
                continue;
            }
            // A cycle would re-enqueue only seen names, so this terminates.
            let task = match self.tasks.get(name) {
                Some(t) => t,
                None => bail!("job spec {job_name} requires unknown task spec {name}"),
            };
            for dep in &task.dependencies {
                queue.push_back(dep);
            }
        }
        Ok(seen.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(deps: &[&str]) -> TaskSpec {
        TaskSpec {
            dimensions: vec!["os:Linux".into()],
            isolate: "build.isolate".into(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            max_attempts: 0,
            priority: 0.5,
        }
    }

    fn cfg() -> TasksCfg {
        let mut c = TasksCfg::default();
        c.tasks.insert("Compile".into(), task(&[]));
        c.tasks.insert("Test".into(), task(&["Compile"]));
        c.tasks.insert("Perf".into(), task(&["Compile"]));
        c.jobs.insert(
            "Test-Job".into(),
            JobSpec {
                task_specs: vec!["Test".into()],
                trigger: String::new(),
            },
        );
        c.jobs.insert(
            "All".into(),
            JobSpec {
                task_specs: vec!["Test".into(), "Perf".into()],
                trigger: TRIGGER_NIGHTLY.into(),
            },
        );
        c
    }

    #[test]
    fn default_max_attempts() {
        assert_eq!(task(&[]).effective_max_attempts(), DEFAULT_MAX_ATTEMPTS);
        let mut t = task(&[]);
        t.max_attempts = 5;
        assert_eq!(t.effective_max_attempts(), 5);
    }

    #[test]
    fn job_dependencies_are_transitive_and_sorted() {
        let c = cfg();
        assert_eq!(c.job_dependencies("Test-Job").unwrap(), vec!["Compile", "Test"]);
        assert_eq!(
            c.job_dependencies("All").unwrap(),
            vec!["Compile", "Perf", "Test"]
        );
    }

    #[test]
    fn job_dependencies_unknown_job() {
        assert!(cfg().job_dependencies("Nope").is_err());
    }

    #[test]
    fn validate_rejects_dangling_deps() {
        let mut c = cfg();
        c.tasks.get_mut("Test").unwrap().dependencies = vec!["Missing".into()];
        assert!(c.validate().is_err());
        let c2 = cfg();
        assert!(c2.validate().is_ok());
    }

    #[test]
    fn trigger_classification() {
        let c = cfg();
        assert!(c.jobs["Test-Job"].is_per_commit());
        assert!(!c.jobs["All"].is_per_commit());
    }

    #[test]
    fn cfg_json_roundtrip() {
        let c = cfg();
        let json = serde_json::to_string(&c).unwrap();
        let back: TasksCfg = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
