//! Engine configuration and the run description consumed by the binary.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sr_types::{config_error, GlobalSettings, Sample, SrResult};

/// Top-level configuration for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker pool size. `None` uses physical cores minus one.
    pub max_parallel: Option<usize>,

    /// How often `RunHandle::wait` drains the result channels.
    pub poll_interval_ms: u64,

    /// Where modules write files and where the tree is exported.
    pub output_dir: Option<PathBuf>,

    /// Save the execution tree as text and DOT when a run starts.
    pub export_tree: bool,

    /// Upper bound on one optimization feedback wait. `None` waits forever.
    pub feedback_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: None,
            poll_interval_ms: 100,
            output_dir: None,
            export_tree: false,
            feedback_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn with_max_parallel(mut self, workers: usize) -> Self {
        self.max_parallel = Some(workers.max(1));
        self
    }

    pub fn with_poll_interval(mut self, millis: u64) -> Self {
        self.poll_interval_ms = millis;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_tree_export(mut self, export: bool) -> Self {
        self.export_tree = export;
        self
    }

    pub fn with_feedback_timeout(mut self, millis: u64) -> Self {
        self.feedback_timeout_ms = Some(millis);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn feedback_timeout(&self) -> Option<Duration> {
        self.feedback_timeout_ms.map(Duration::from_millis)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Defaults overridden by `SIMRUN_MAX_PARALLEL`, `SIMRUN_OUTPUT_DIR`
    /// and `SIMRUN_POLL_INTERVAL_MS`.
    pub fn from_env() -> SrResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> SrResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup("SIMRUN_MAX_PARALLEL") {
            let workers: usize = raw
                .trim()
                .parse()
                .map_err(|_| config_error!("SIMRUN_MAX_PARALLEL must be a positive integer, got '{raw}'"))?;
            if workers == 0 {
                return Err(config_error!("SIMRUN_MAX_PARALLEL must be at least 1"));
            }
            config.max_parallel = Some(workers);
        }
        if let Some(raw) = lookup("SIMRUN_OUTPUT_DIR") {
            if !raw.trim().is_empty() {
                config.output_dir = Some(PathBuf::from(raw));
            }
        }
        if let Some(raw) = lookup("SIMRUN_POLL_INTERVAL_MS") {
            config.poll_interval_ms = raw.trim().parse().map_err(|_| {
                config_error!("SIMRUN_POLL_INTERVAL_MS must be milliseconds, got '{raw}'")
            })?;
        }
        Ok(config)
    }
}

/// Everything needed to start one run, as read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDescription {
    pub module: String,
    #[serde(default)]
    pub globals: GlobalSettings,
    pub samples: Vec<Sample>,
    /// Overrides applied on top of the environment configuration.
    #[serde(default)]
    pub engine: Option<EngineConfig>,
}

impl RunDescription {
    pub fn from_json(text: &str) -> SrResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_path(path: &Path) -> SrResult<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}
