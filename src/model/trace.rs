use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::from_value;
use crate::error::SchemaValidationError;

const RECORD: &str = "execution trace";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    #[serde(alias = "passed")]
    Success,
    #[serde(alias = "failure", alias = "error")]
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalState {
    Passed,
    Failed,
}

/// What the agent reports for one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_number: u32,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub target: String,
    /// Exact locator the agent used, e.g. `page.getByRole('button', { name: 'Submit' })`.
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub selector_type: Option<String>,
    pub result: StepOutcome,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub screenshot: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Record of what actually happened when a plan was carried out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTrace {
    #[serde(default)]
    pub test_name: String,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    /// Seconds.
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub steps: Vec<StepResult>,
    pub final_state: FinalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reused: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl ExecutionTrace {
    /// Deserialize and validate a trace produced by the agent.
    pub fn from_value(value: Value) -> Result<Self, SchemaValidationError> {
        let trace: ExecutionTrace = from_value(RECORD, value)?;
        trace.validate()?;
        Ok(trace)
    }

    /// Trace standing in for execution when existing code passed as-is.
    pub fn reused(test_name: impl Into<String>, code_path: &str) -> Self {
        Self {
            test_name: test_name.into(),
            start_time: None,
            end_time: None,
            duration: 0.0,
            steps: Vec::new(),
            final_state: FinalState::Passed,
            summary: None,
            success_count: 0,
            failure_count: 0,
            reused: true,
            notes: vec![format!("Reused existing code: {code_path}")],
        }
    }

    pub fn has_failed_step(&self) -> bool {
        self.steps.iter().any(|s| s.result == StepOutcome::Failed)
    }

    /// `finalState` must agree with the step outcomes. A failed run needs at
    /// least one step that did not succeed, unless no step ran at all.
    pub fn validate(&self) -> Result<(), SchemaValidationError> {
        match self.final_state {
            FinalState::Passed if self.has_failed_step() => Err(SchemaValidationError::new(
                RECORD,
                "finalState",
                "declared passed but a step failed",
            )),
            FinalState::Failed
                if !self.steps.is_empty()
                    && self.steps.iter().all(|s| s.result == StepOutcome::Success) =>
            {
                Err(SchemaValidationError::new(
                    RECORD,
                    "finalState",
                    "declared failed but every step succeeded",
                ))
            }
            _ => Ok(()),
        }
    }

    /// Declared and actual step totals, when `successCount + failureCount`
    /// disagrees with the number of step results.
    pub fn count_mismatch(&self) -> Option<(u32, usize)> {
        let declared = self.success_count.saturating_add(self.failure_count);
        (declared as usize != self.steps.len()).then_some((declared, self.steps.len()))
    }
}
