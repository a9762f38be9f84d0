use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{from_value, one_or_many};
use crate::error::SchemaValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Success,
    Failed,
}

/// Terminal outcome of the self-healing loop. Written once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub status: ValidationStatus,
    pub attempts: u32,
    pub test_file: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_issues: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ValidationResult {
    pub fn passed(test_file: impl Into<String>, attempts: u32) -> Self {
        Self {
            status: ValidationStatus::Success,
            attempts,
            test_file: test_file.into(),
            message: "Test passed successfully".to_string(),
            remaining_issues: None,
            last_error: None,
            timestamp: Utc::now(),
        }
    }

    /// The agent declared it could not fix the failure.
    pub fn unfixable(
        test_file: impl Into<String>,
        attempts: u32,
        remaining_issues: Vec<String>,
        last_error: impl Into<String>,
    ) -> Self {
        Self {
            status: ValidationStatus::Failed,
            attempts,
            test_file: test_file.into(),
            message: "Could not fix automatically".to_string(),
            remaining_issues: Some(remaining_issues),
            last_error: Some(last_error.into()),
            timestamp: Utc::now(),
        }
    }

    /// The attempt budget ran out with the test still failing.
    pub fn exhausted(test_file: impl Into<String>, attempts: u32, last_error: impl Into<String>) -> Self {
        Self {
            status: ValidationStatus::Failed,
            attempts,
            test_file: test_file.into(),
            message: format!("Failed after {attempts} attempt(s)"),
            remaining_issues: None,
            last_error: Some(last_error.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ValidationStatus::Success
    }
}

/// What the agent says it did after being asked to fix a failing test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixReport {
    pub status: String,
    #[serde(default)]
    pub original_error: Option<String>,
    #[serde(default)]
    pub fix_applied: Option<String>,
    #[serde(default)]
    pub code_changes: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub remaining_issues: Vec<String>,
}

/// Decision carried by a fix report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixOutcome {
    /// The file on disk was rewritten; carries a description of the change.
    Fixed(String),
    /// The agent gave up; carries the issues it could not resolve.
    Unfixable(Vec<String>),
}

impl FixReport {
    pub fn from_value(value: Value) -> Result<Self, SchemaValidationError> {
        from_value("fix report", value)
    }

    /// `None` when the status is neither a fix nor an explicit refusal.
    pub fn outcome(&self) -> Option<FixOutcome> {
        match self.status.trim().to_ascii_lowercase().as_str() {
            "fixed" => {
                let details = self
                    .fix_applied
                    .clone()
                    .or_else(|| self.code_changes.clone())
                    .unwrap_or_else(|| "fix applied".to_string());
                Some(FixOutcome::Fixed(details))
            }
            "failed" | "unfixable" => {
                let mut issues = self.remaining_issues.clone();
                if issues.is_empty() {
                    issues.extend(self.original_error.clone());
                }
                Some(FixOutcome::Unfixable(issues))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fixed_report() {
        let report = FixReport::from_value(json!({
            "status": "fixed",
            "originalError": "Timeout waiting for selector",
            "fixApplied": "Use getByRole for the login button",
            "codeChanges": "Replaced locator"
        }))
        .unwrap();
        assert_eq!(
            report.outcome(),
            Some(FixOutcome::Fixed("Use getByRole for the login button".to_string()))
        );
    }

    #[test]
    fn test_failed_report_carries_issues() {
        let report = FixReport::from_value(json!({
            "status": "failed",
            "originalError": "Site is down",
            "remainingIssues": ["Server returns 503"]
        }))
        .unwrap();
        assert_eq!(
            report.outcome(),
            Some(FixOutcome::Unfixable(vec!["Server returns 503".to_string()]))
        );
    }

    #[test]
    fn test_failed_report_without_issues_uses_original_error() {
        let report = FixReport::from_value(json!({
            "status": "FAILED",
            "originalError": "Site is down",
            "remainingIssues": null
        }))
        .unwrap();
        assert_eq!(
            report.outcome(),
            Some(FixOutcome::Unfixable(vec!["Site is down".to_string()]))
        );
    }

    #[test]
    fn test_unknown_status_has_no_outcome() {
        let report = FixReport::from_value(json!({"status": "investigating"})).unwrap();
        assert_eq!(report.outcome(), None);
    }

    #[test]
    fn test_result_serialization() {
        let result = ValidationResult::exhausted("tests/generated/a.spec.ts", 3, "1 failed");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["attempts"], 3);
        assert_eq!(value["testFile"], "tests/generated/a.spec.ts");
        assert_eq!(value["lastError"], "1 failed");
        assert!(value.get("remainingIssues").is_none());
        assert!(!result.is_success());
        assert!(ValidationResult::passed("a", 1).is_success());
    }
}
