//! Periodic job triggers: nightly/weekly job specs are instantiated at
//! branch heads when their period has elapsed, with the last firing
//! times persisted in a JSON state file under the work dir.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use foreman_core::spec::{TRIGGER_NIGHTLY, TRIGGER_WEEKLY};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Default, Serialize, Deserialize)]
struct TriggerState {
    last_triggered: HashMap<String, DateTime<Utc>>,
}

/// File-backed record of when each periodic trigger last fired.
#[derive(Debug)]
pub struct PeriodicTriggers {
    path: PathBuf,
    state: TriggerState,
}

impl PeriodicTriggers {
    /// Load from a JSON file; a missing file means nothing has fired yet.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .context(format!("failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .context(format!("corrupt trigger state {}", path.display()))?
        } else {
            TriggerState::default()
        };
        Ok(Self { path, state })
    }

    /// The period for a recognized trigger name.
    pub fn period_of(trigger: &str) -> Option<Duration> {
        match trigger {
            TRIGGER_NIGHTLY => Some(Duration::hours(24)),
            TRIGGER_WEEKLY => Some(Duration::days(7)),
            _ => None,
        }
    }

    /// Whether the trigger's period has elapsed since it last fired.
    /// Never-fired triggers are due immediately.
    pub fn due(&self, trigger: &str, now: DateTime<Utc>) -> bool {
        let Some(period) = Self::period_of(trigger) else {
            return false;
        };
        match self.state.last_triggered.get(trigger) {
            Some(last) => now - *last >= period,
            None => true,
        }
    }

    /// Record a firing and persist the state file.
    pub fn mark(&mut self, trigger: &str, now: DateTime<Utc>) -> Result<()> {
        self.state.last_triggered.insert(trigger.to_string(), now);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.state)?;
        std::fs::write(&self.path, json)
            .context(format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_is_due() {
        let dir = tempfile::tempdir().unwrap();
        let pt = PeriodicTriggers::from_file(dir.path().join("state.json")).unwrap();
        let now = Utc::now();
        assert!(pt.due(TRIGGER_NIGHTLY, now));
        assert!(pt.due(TRIGGER_WEEKLY, now));
        assert!(!pt.due("", now));
        assert!(!pt.due("hourly", now));
    }

    #[test]
    fn mark_suppresses_until_period_elapses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut pt = PeriodicTriggers::from_file(&path).unwrap();
        let now = Utc::now();
        pt.mark(TRIGGER_NIGHTLY, now).unwrap();

        assert!(!pt.due(TRIGGER_NIGHTLY, now + Duration::hours(23)));
        assert!(pt.due(TRIGGER_NIGHTLY, now + Duration::hours(24)));
        // Weekly is untouched.
        assert!(pt.due(TRIGGER_WEEKLY, now));

        // State survives a reload.
        let pt2 = PeriodicTriggers::from_file(&path).unwrap();
        assert!(!pt2.due(TRIGGER_NIGHTLY, now + Duration::hours(1)));
    }
}
