//! Error taxonomy for the pipeline.
//!
//! Each stage wraps the failures of the layers beneath it (agent dispatch,
//! structured-output extraction, schema validation, disk IO) in its own
//! error type. The coordinator folds them into [`PipelineError`] and records
//! them in the run's artifact set instead of raising to the caller.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::artifacts::ArtifactError;
use crate::gate::GateClosed;
use crate::secrets::SecretMap;

/// Number of characters of offending text kept for diagnostics.
pub const PREVIEW_CHARS: usize = 500;

/// Truncate text to a bounded diagnostic preview, respecting char boundaries.
pub fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

/// No parseable JSON payload could be recovered from an agent reply.
#[derive(Debug, Clone, Error)]
#[error("could not extract structured output: {reason}")]
pub struct ExtractionError {
    pub reason: String,
    /// First [`PREVIEW_CHARS`] characters of the text that failed.
    pub preview: String,
}

impl ExtractionError {
    pub fn new(reason: impl Into<String>, text: &str) -> Self {
        Self {
            reason: reason.into(),
            preview: preview(text),
        }
    }
}

/// Structurally valid JSON that violates a record's contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{record} failed schema validation at `{path}`: {message}")]
pub struct SchemaValidationError {
    pub record: &'static str,
    pub path: String,
    pub message: String,
}

impl SchemaValidationError {
    pub fn new(record: &'static str, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            record,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Wrap a serde deserialization failure for `record`.
    pub fn from_serde(record: &'static str, err: serde_json::Error) -> Self {
        Self::new(record, "$", err.to_string())
    }
}

/// Failures at the automation-agent boundary.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to launch agent `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("agent exited with status {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },

    #[error("agent did not respond within {0:?}")]
    Timeout(Duration),

    #[error("agent transport error: {0}")]
    Transport(String),

    #[error("agent returned no result text")]
    EmptyResponse,
}

impl AgentError {
    /// Whether this is the known cleanup artifact of the agent transport,
    /// which is safe to retry.
    pub fn is_benign_cleanup(&self) -> bool {
        let message = match self {
            AgentError::Transport(message) => message.as_str(),
            AgentError::Exited { stderr, .. } => stderr.as_str(),
            _ => return false,
        };
        message.to_lowercase().contains("cancel scope")
    }

    /// Variant name, for logging without the agent's own text.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Spawn { .. } => "spawn",
            AgentError::Exited { .. } => "exited",
            AgentError::Timeout(_) => "timeout",
            AgentError::Transport(_) => "transport",
            AgentError::EmptyResponse => "empty_response",
        }
    }

    /// Replace resolved secret values in any agent-supplied text.
    pub fn scrubbed(self, secrets: &SecretMap) -> Self {
        match self {
            AgentError::Exited { code, stderr } => AgentError::Exited {
                code,
                stderr: secrets.scrub_str(&stderr),
            },
            AgentError::Transport(message) => AgentError::Transport(secrets.scrub_str(&message)),
            other => other,
        }
    }
}

#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("planner dispatch failed: {0}")]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Schema(#[from] SchemaValidationError),
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("executor dispatch failed: {0}")]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Schema(#[from] SchemaValidationError),

    #[error("failed to prepare plan for execution: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("existing code not found at {0:?}")]
    MissingCode(PathBuf),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("exporter dispatch failed: {0}")]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Schema(#[from] SchemaValidationError),

    #[error("failed to serialize trace for export: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write test file {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Setup failures of the validator. Test failures are not errors: they are
/// handled inside the healing loop.
#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("test file not found: {0:?}")]
    MissingTestFile(PathBuf),

    #[error("failed to read test file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to read specification {path:?}: {source}")]
    Specification {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("planning failed: {0}")]
    Planning(#[from] PlanningError),

    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("export failed: {0}")]
    Export(#[from] ExportError),

    #[error("validation could not start: {0}")]
    Validation(#[from] ValidatorError),

    #[error("validation exhausted after {attempts} attempt(s): {message}")]
    ValidationExhausted { attempts: u32, message: String },

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Gate(#[from] GateClosed),
}

impl PipelineError {
    /// Stable label used in failure records and lifecycle events.
    pub fn label(&self) -> &'static str {
        match self {
            PipelineError::Specification { .. } => "specification",
            PipelineError::Planning(PlanningError::Extraction(_))
            | PipelineError::Execution(ExecutionError::Extraction(_))
            | PipelineError::Export(ExportError::Extraction(_)) => "extraction",
            PipelineError::Planning(PlanningError::Schema(_))
            | PipelineError::Execution(ExecutionError::Schema(_))
            | PipelineError::Export(ExportError::Schema(_)) => "schema_validation",
            PipelineError::Planning(_) => "planning",
            PipelineError::Execution(_) => "execution",
            PipelineError::Export(_) => "export",
            PipelineError::Validation(_) => "validation",
            PipelineError::ValidationExhausted { .. } => "validation_exhausted",
            PipelineError::Artifact(_) => "artifact",
            PipelineError::Gate(_) => "gate_closed",
        }
    }

    /// Bounded preview of the agent text that could not be parsed, if any.
    pub fn preview(&self) -> Option<&str> {
        match self {
            PipelineError::Planning(PlanningError::Extraction(e))
            | PipelineError::Execution(ExecutionError::Extraction(e))
            | PipelineError::Export(ExportError::Extraction(e)) => Some(e.preview.as_str()),
            _ => None,
        }
    }
}
