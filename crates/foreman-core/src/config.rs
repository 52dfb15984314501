use chrono::Duration;
use serde::Deserialize;
use std::path::PathBuf;

/// One source repository the scheduler watches.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoEntry {
    /// Canonical repo URL, used as the repo key everywhere.
    pub name: String,
    /// Local mirror path the graph is built from.
    pub mirror: PathBuf,
    /// Path of the task-config document inside the repo.
    #[serde(default = "default_cfg_path")]
    pub cfg_path: String,
}

/// Top-level scheduler configuration (parsed from foreman.toml).
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Scratch root: blacklist.json, cfg-cache/, periodic trigger state.
    pub work_dir: PathBuf,
    /// Window age bound.
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    /// Window minimum commit count per repo.
    #[serde(default = "default_num_commits")]
    pub num_commits: usize,
    /// Score decay target at 24 hours; 1.0 disables decay.
    #[serde(default = "default_time_decay")]
    pub time_decay_amt_24hr: f64,
    /// Executor pools to poll for free bots.
    #[serde(default = "default_pools")]
    pub pools: Vec<String>,
    /// Notification topic attached to executor submissions.
    #[serde(default)]
    pub pubsub_topic: String,
    /// The matcher admits only candidates with score strictly above this.
    /// Retries score exactly 0.0, so the default keeps them out; lower
    /// the threshold to admit them.
    #[serde(default)]
    pub min_score: f64,
    /// Commit hashes at which per-commit job gathering stops recursing.
    #[serde(default)]
    pub recursion_boundaries: Vec<String>,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_task_update_interval")]
    pub task_update_interval_secs: u64,
    #[serde(default)]
    pub repo: Vec<RepoEntry>,
}

fn default_cfg_path() -> String {
    "infra/tasks.json".into()
}

fn default_period_secs() -> u64 {
    4 * 24 * 3600
}

fn default_num_commits() -> usize {
    10
}

fn default_time_decay() -> f64 {
    1.0
}

fn default_pools() -> Vec<String> {
    vec!["default".into()]
}

fn default_tick_interval() -> u64 {
    5
}

fn default_task_update_interval() -> u64 {
    300
}

impl SchedulerConfig {
    /// Load from a TOML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SchedulerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn period(&self) -> Duration {
        Duration::seconds(self.period_secs as i64)
    }

    pub fn blacklist_path(&self) -> PathBuf {
        self.work_dir.join("blacklist.json")
    }

    pub fn cfg_cache_dir(&self) -> PathBuf {
        self.work_dir.join("cfg-cache")
    }

    pub fn periodic_state_path(&self) -> PathBuf {
        self.work_dir.join("periodic-triggers.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let toml_str = r#"
            work_dir = "/tmp/foreman"
        "#;
        let cfg: SchedulerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.period_secs, 4 * 24 * 3600);
        assert_eq!(cfg.num_commits, 10);
        assert_eq!(cfg.time_decay_amt_24hr, 1.0);
        assert_eq!(cfg.pools, vec!["default"]);
        assert_eq!(cfg.min_score, 0.0);
        assert_eq!(cfg.tick_interval_secs, 5);
        assert!(cfg.repo.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let toml_str = r#"
            work_dir = "/var/lib/foreman"
            period_secs = 86400
            num_commits = 5
            time_decay_amt_24hr = 0.9
            pools = ["default", "gpu"]
            pubsub_topic = "foreman-tasks"
            min_score = -0.5
            recursion_boundaries = ["50537e46"]

            [[repo]]
            name = "https://example.com/repo.git"
            mirror = "/var/lib/foreman/mirrors/repo"
            cfg_path = "ci/tasks.json"
        "#;
        let cfg: SchedulerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.period(), Duration::days(1));
        assert_eq!(cfg.pools.len(), 2);
        assert_eq!(cfg.min_score, -0.5);
        assert_eq!(cfg.repo[0].cfg_path, "ci/tasks.json");
        assert_eq!(
            cfg.blacklist_path(),
            PathBuf::from("/var/lib/foreman/blacklist.json")
        );
    }

    #[test]
    fn repo_cfg_path_default() {
        let toml_str = r#"
            work_dir = "/tmp/foreman"
            [[repo]]
            name = "r"
            mirror = "/tmp/m"
        "#;
        let cfg: SchedulerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.repo[0].cfg_path, "infra/tasks.json");
    }
}
