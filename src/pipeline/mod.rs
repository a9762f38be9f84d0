//! Run orchestration.
//!
//! [`PipelineRuntime`] is built once per process and shared by reference: it
//! owns the agent, the test runner, the secret source, the concurrency gate
//! and the artifact store. [`PipelineCoordinator`] sequences one run's
//! stages; [`RunScheduler`] launches runs in the background.

mod coordinator;
mod scheduler;

pub use coordinator::{ExistingCode, PipelineCoordinator, PreparedRun, RunOptions, RunReport};
pub use scheduler::{RunScheduler, RunTicket};

use std::fmt;
use std::sync::Arc;

use crate::agent::{AutomationAgent, CliAgent};
use crate::artifacts::{ArtifactResult, ArtifactStore};
use crate::config::PipelineConfig;
use crate::gate::ConcurrencyGate;
use crate::runner::{PlaywrightRunner, TestRunner};
use crate::secrets::SecretSubstitutor;
use crate::timeout::TimeoutConfig;

/// Process-wide pipeline context.
#[derive(Clone)]
pub struct PipelineRuntime {
    pub config: PipelineConfig,
    pub agent: Arc<dyn AutomationAgent>,
    pub runner: Arc<dyn TestRunner>,
    pub secrets: SecretSubstitutor,
    pub gate: ConcurrencyGate,
    pub store: ArtifactStore,
    pub timeouts: TimeoutConfig,
}

impl fmt::Debug for PipelineRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRuntime")
            .field("config", &self.config)
            .field("gate", &self.gate.status())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl PipelineRuntime {
    pub fn new(
        config: PipelineConfig,
        agent: Arc<dyn AutomationAgent>,
        runner: Arc<dyn TestRunner>,
        secrets: SecretSubstitutor,
    ) -> ArtifactResult<Self> {
        let store = ArtifactStore::new(&config.runs_dir, config.retention_days)?;
        Ok(Self {
            gate: ConcurrencyGate::new(config.heavy_stage_capacity),
            timeouts: config.timeouts(),
            config,
            agent,
            runner,
            secrets,
            store,
        })
    }

    /// Runtime backed by the configured agent CLI, the Playwright runner and
    /// the process environment.
    pub fn from_config(config: PipelineConfig) -> ArtifactResult<Self> {
        let agent = CliAgent::new(&config.agent.command, &config.project_root)
            .with_extra_args(config.agent.extra_args.clone());
        let runner = PlaywrightRunner::new(&config.project_root, config.timeouts().test_timeout)
            .with_command(&config.runner.command, config.runner.args.clone())
            .with_json_report(config.runner.json_report);
        Self::new(
            config,
            Arc::new(agent),
            Arc::new(runner),
            SecretSubstitutor::from_env(),
        )
    }

    /// Stop admitting heavyweight stages. Runs waiting on the gate fail
    /// with a recorded failure.
    pub fn shutdown(&self) {
        self.gate.close();
    }
}
