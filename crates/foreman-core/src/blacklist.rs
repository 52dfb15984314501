//! Blacklist of `(task name, revision)` pairs that must never be
//! scheduled, persisted as JSON under the work dir.

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One blacklist rule. Both patterns must match for the rule to apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub rule_name: String,
    pub task_name_regex: String,
    pub revision_regex: String,
}

#[derive(Debug)]
pub struct Blacklist {
    path: PathBuf,
    rules: Vec<Rule>,
    // Compiled alongside `rules`, same order.
    compiled: Vec<(Regex, Regex)>,
}

impl Blacklist {
    /// Load from a JSON file; a missing file is an empty blacklist.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let rules: Vec<Rule> = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .context(format!("failed to read blacklist {}", path.display()))?;
            serde_json::from_str(&content)
                .context(format!("invalid blacklist file {}", path.display()))?
        } else {
            Vec::new()
        };
        let compiled = compile(&rules)?;
        Ok(Self {
            path,
            rules,
            compiled,
        })
    }

    /// The name of the first rule matching `(task name, revision)`.
    pub fn match_rule(&self, name: &str, revision: &str) -> Option<&str> {
        self.rules
            .iter()
            .zip(&self.compiled)
            .find(|(_, (name_re, rev_re))| name_re.is_match(name) && rev_re.is_match(revision))
            .map(|(rule, _)| rule.rule_name.as_str())
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Add a rule and persist. Rule names are unique.
    pub fn add_rule(&mut self, rule: Rule) -> Result<()> {
        if self.rules.iter().any(|r| r.rule_name == rule.rule_name) {
            bail!("blacklist rule {} already exists", rule.rule_name);
        }
        let name_re = Regex::new(&rule.task_name_regex)
            .context(format!("invalid task name regex in rule {}", rule.rule_name))?;
        let rev_re = Regex::new(&rule.revision_regex)
            .context(format!("invalid revision regex in rule {}", rule.rule_name))?;
        self.rules.push(rule);
        self.compiled.push((name_re, rev_re));
        self.save()
    }

    /// Remove a rule by name and persist. Returns false if absent.
    pub fn remove_rule(&mut self, rule_name: &str) -> Result<bool> {
        let idx = match self.rules.iter().position(|r| r.rule_name == rule_name) {
            Some(i) => i,
            None => return Ok(false),
        };
        self.rules.remove(idx);
        self.compiled.remove(idx);
        self.save()?;
        Ok(true)
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.rules)?;
        std::fs::write(&self.path, json)
            .context(format!("failed to write blacklist {}", self.path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn compile(rules: &[Rule]) -> Result<Vec<(Regex, Regex)>> {
    rules
        .iter()
        .map(|r| {
            let name_re = Regex::new(&r.task_name_regex)
                .context(format!("invalid task name regex in rule {}", r.rule_name))?;
            let rev_re = Regex::new(&r.revision_regex)
                .context(format!("invalid revision regex in rule {}", r.rule_name))?;
            Ok((name_re, rev_re))
        })
        .collect()
}
