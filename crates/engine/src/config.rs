//! Engine configuration: serde defaults, optional TOML file, validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Runtime knobs for every engine component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Concurrency ceiling for dispatched handlers.
    pub max_concurrent: usize,
    /// Dispatcher poll period.
    pub poll_interval_ms: u64,
    /// Per-task wall-clock budget.
    pub task_timeout_ms: u64,
    /// Merge loop period.
    pub merge_interval_ms: u64,
    /// How long `stop` waits for in-flight work before aborting it.
    pub shutdown_grace_ms: u64,
    /// Time between the graceful signal and SIGKILL.
    pub terminate_grace_ms: u64,
    /// Liveness probe period for reattached processes.
    pub liveness_poll_ms: u64,
    /// Output file tail period.
    pub output_poll_ms: u64,
    /// Events retained for replay.
    pub event_history: usize,
    /// Per-task live log channel capacity.
    pub log_channel_capacity: usize,
    /// Holds `runq.db` and the `logs/` tree.
    pub data_dir: PathBuf,
    /// Merge loop targets. The loop is idle when unset.
    pub merge: Option<MergeConfig>,
}

/// Where the merge loop looks for finished work units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    /// Repository that receives the merges.
    pub repo_root: PathBuf,
    /// Directory whose children are per-unit worktrees.
    pub worktrees_root: PathBuf,
    /// Marker file name inside each worktree.
    #[serde(default = "default_marker")]
    pub marker_file: String,
}

fn default_marker() -> String {
    ".unit-complete".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            poll_interval_ms: 100,
            task_timeout_ms: 4 * 60 * 60 * 1000,
            merge_interval_ms: 60_000,
            shutdown_grace_ms: 10_000,
            terminate_grace_ms: 5_000,
            liveness_poll_ms: 1_000,
            output_poll_ms: 200,
            event_history: 100,
            log_channel_capacity: 1024,
            data_dir: PathBuf::from(".runq"),
            merge: None,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file. Missing keys take their defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would stall the engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid("max_concurrent must be at least 1".into()));
        }
        let intervals = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("task_timeout_ms", self.task_timeout_ms),
            ("merge_interval_ms", self.merge_interval_ms),
            ("liveness_poll_ms", self.liveness_poll_ms),
            ("output_poll_ms", self.output_poll_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.event_history == 0 || self.log_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_history and log_channel_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// SQLite database file.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("runq.db")
    }

    /// Root of the per-entry output directories.
    pub fn logs_root(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Default grace period for `Dispatcher::stop`.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_concurrent, 3);
        assert_eq!(cfg.poll_interval_ms, 100);
        assert_eq!(cfg.task_timeout_ms, 14_400_000);
        assert_eq!(cfg.merge_interval_ms, 60_000);
        assert_eq!(cfg.event_history, 100);
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runq.toml");
        std::fs::write(
            &path,
            r#"
max_concurrent = 8
data_dir = "/var/lib/runq"

[merge]
repo_root = "/src/app"
worktrees_root = "/src/worktrees"
"#,
        )
        .unwrap();

        let cfg = EngineConfig::load_from(&path).unwrap();
        assert_eq!(cfg.max_concurrent, 8);
        assert_eq!(cfg.poll_interval_ms, 100);
        assert_eq!(cfg.db_path(), PathBuf::from("/var/lib/runq/runq.db"));
        let merge = cfg.merge.unwrap();
        assert_eq!(merge.marker_file, ".unit-complete");
    }

    #[test]
    fn zero_ceiling_is_rejected() {
        let cfg = EngineConfig { max_concurrent: 0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
        let cfg = EngineConfig { poll_interval_ms: 0, ..Default::default() };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));
    }

    #[test]
    fn unknown_key_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runq.toml");
        std::fs::write(&path, "max_concurrency = 2\n").unwrap();
        assert!(matches!(EngineConfig::load_from(&path), Err(ConfigError::Parse { .. })));
    }
}
