//! Automation-agent boundary.
//!
//! The agent is a black box: it takes one prompt and eventually answers with
//! one blob of natural-language or markdown text. Everything structured about
//! the reply is imposed afterwards by [`crate::extract`] and the model
//! validators.

mod cli;
mod scripted;

pub use cli::CliAgent;
pub use scripted::ScriptedAgent;

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::artifacts::Stage;
use crate::error::AgentError;

/// Tool permissions granted to the agent for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolScope {
    /// Reasoning only, with read access to the project.
    ReadOnly,
    /// Every configured tool, including browser control; permission prompts
    /// are bypassed.
    Full,
}

impl ToolScope {
    pub fn allowed_tools(&self) -> &'static [&'static str] {
        match self {
            ToolScope::ReadOnly => &["Read", "Glob", "Grep"],
            ToolScope::Full => &["*"],
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub stage: Stage,
    pub prompt: String,
    pub scope: ToolScope,
    pub timeout: Option<Duration>,
}

impl AgentRequest {
    pub fn new(stage: Stage, prompt: impl Into<String>, scope: ToolScope) -> Self {
        Self {
            stage,
            prompt: prompt.into(),
            scope,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
pub trait AutomationAgent: Send + Sync {
    /// Send one prompt and wait for the agent's final reply text.
    async fn dispatch(&self, request: AgentRequest) -> Result<String, AgentError>;
}

/// Dispatch, retrying only the known benign transport cleanup error, at most
/// `benign_retry_limit` extra times. Blank replies are an error.
pub async fn dispatch_retrying(
    agent: &dyn AutomationAgent,
    request: &AgentRequest,
    benign_retry_limit: u32,
) -> Result<String, AgentError> {
    let mut retries = 0;
    loop {
        match agent.dispatch(request.clone()).await {
            Ok(text) if text.trim().is_empty() => return Err(AgentError::EmptyResponse),
            Ok(text) => return Ok(text),
            Err(err) if err.is_benign_cleanup() && retries < benign_retry_limit => {
                retries += 1;
                warn!(
                    stage = request.stage.as_str(),
                    retry = retries,
                    error_kind = err.kind(),
                    "benign agent transport error; retrying dispatch"
                );
            }
            Err(err) => return Err(err),
        }
    }
}
