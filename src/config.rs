//! Layered pipeline configuration.
//!
//! Sources, lowest priority first: built-in defaults, an optional TOML file
//! (`testsmith.toml` unless a path is given), then `TESTSMITH_*` environment
//! variables with `__` separating nested keys, e.g. `TESTSMITH_AGENT__COMMAND`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::timeout::TimeoutConfig;

pub const DEFAULT_CONFIG_FILE: &str = "testsmith.toml";
pub const ENV_PREFIX: &str = "TESTSMITH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Headless agent CLI binary.
    pub command: String,
    pub extra_args: Vec<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    pub command: String,
    /// Arguments placed before the test file path.
    pub args: Vec<String>,
    /// Request a JSON report and derive the pass verdict from it.
    pub json_report: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            command: "npx".to_string(),
            args: vec!["playwright".to_string(), "test".to_string()],
            json_report: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub plan_secs: u64,
    pub execute_secs: u64,
    pub export_secs: u64,
    pub fix_secs: u64,
    pub test_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        let defaults = TimeoutConfig::default();
        Self {
            plan_secs: defaults.plan_timeout.as_secs(),
            execute_secs: defaults.execute_timeout.as_secs(),
            export_secs: defaults.export_timeout.as_secs(),
            fix_secs: defaults.fix_timeout.as_secs(),
            test_secs: defaults.test_timeout.as_secs(),
        }
    }
}

impl TimeoutSettings {
    pub fn to_timeout_config(&self) -> TimeoutConfig {
        TimeoutConfig::new()
            .with_plan_timeout(Duration::from_secs(self.plan_secs))
            .with_execute_timeout(Duration::from_secs(self.execute_secs))
            .with_export_timeout(Duration::from_secs(self.export_secs))
            .with_fix_timeout(Duration::from_secs(self.fix_secs))
            .with_test_timeout(Duration::from_secs(self.test_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// One namespace per run is created under this directory.
    pub runs_dir: PathBuf,
    /// Generated tests are written here; reuse lookups search it.
    pub tests_dir: PathBuf,
    /// Working directory of the agent and the test runner.
    pub project_root: PathBuf,
    /// Validation attempt budget (0 is treated as 1).
    pub max_attempts: u32,
    /// Concurrent heavyweight stages (0 is treated as 1).
    pub heavy_stage_capacity: usize,
    /// 0 disables pruning.
    pub retention_days: u64,
    /// Extra dispatches allowed for the benign transport cleanup error.
    pub benign_retry_limit: u32,
    pub agent: AgentSettings,
    pub runner: RunnerSettings,
    pub timeouts: TimeoutSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            runs_dir: PathBuf::from("runs"),
            tests_dir: PathBuf::from("tests/generated"),
            project_root: PathBuf::from("."),
            max_attempts: 3,
            heavy_stage_capacity: crate::gate::DEFAULT_CAPACITY,
            retention_days: 30,
            benign_retry_limit: 2,
            agent: AgentSettings::default(),
            runner: RunnerSettings::default(),
            timeouts: TimeoutSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Load with the default file name and environment prefix. An explicit
    /// `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    pub fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self, ConfigError> {
        let (file, required) = match path {
            Some(path) => (path.to_string_lossy().into_owned(), true),
            None => (DEFAULT_CONFIG_FILE.to_string(), false),
        };

        let loaded: PipelineConfig = Config::builder()
            .add_source(Config::try_from(&PipelineConfig::default())?)
            .add_source(File::new(&file, FileFormat::Toml).required(required))
            .add_source(
                Environment::with_prefix(env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("agent.extra_args")
                    .with_list_parse_key("runner.args"),
            )
            .build()?
            .try_deserialize()?;

        Ok(loaded.normalized())
    }

    fn normalized(mut self) -> Self {
        self.max_attempts = self.max_attempts.max(1);
        self.heavy_stage_capacity = self.heavy_stage_capacity.max(1);
        self
    }

    pub fn timeouts(&self) -> TimeoutConfig {
        self.timeouts.to_timeout_config()
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Load `.env` from the working directory or its parents, if present, so
/// secrets referenced by plans are visible in the process environment.
pub fn load_dotenv() -> Option<PathBuf> {
    dotenvy::dotenv().ok()
}
