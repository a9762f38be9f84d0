use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::from_value;
use crate::error::SchemaValidationError;

const RECORD: &str = "plan";

/// Browser action vocabulary a plan step may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Navigate,
    Click,
    Fill,
    Assert,
    Screenshot,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Navigate => "navigate",
            Action::Click => "click",
            Action::Fill => "fill",
            Action::Assert => "assert",
            Action::Screenshot => "screenshot",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssertionKind {
    Visible,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    #[serde(rename = "type")]
    pub kind: AssertionKind,
    #[serde(default)]
    pub expected: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub step_number: u32,
    pub action: Action,
    #[serde(default)]
    pub target: String,
    /// Text entered by `fill` steps; the usual home of `{{VAR}}` placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assertion: Option<Assertion>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub test_name: String,
    #[serde(default)]
    pub description: String,
    pub base_url: String,
    pub steps: Vec<Step>,
    /// Recorded by the coordinator after planning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_file_path: Option<String>,
}

impl Plan {
    /// Deserialize and validate a plan produced by the agent.
    pub fn from_value(value: Value) -> Result<Self, SchemaValidationError> {
        let plan: Plan = from_value(RECORD, value)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), SchemaValidationError> {
        if self.test_name.trim().is_empty() {
            return Err(SchemaValidationError::new(RECORD, "testName", "must not be empty"));
        }
        if self.base_url.trim().is_empty() {
            return Err(SchemaValidationError::new(RECORD, "baseUrl", "must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(SchemaValidationError::new(RECORD, "steps", "plan has no steps"));
        }

        let mut expected = 1;
        for (index, step) in self.steps.iter().enumerate() {
            if step.step_number != expected {
                return Err(SchemaValidationError::new(
                    RECORD,
                    format!("steps[{index}].stepNumber"),
                    format!("expected {expected}, found {}", step.step_number),
                ));
            }
            expected += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan_json() -> Value {
        json!({
            "testName": "Example heading",
            "description": "Checks the heading",
            "baseUrl": "https://example.com",
            "steps": [
                {"stepNumber": 1, "action": "navigate", "target": "https://example.com", "description": "Open"},
                {"stepNumber": 2, "action": "assert", "target": "Example Domain",
                 "assertion": {"type": "visible", "expected": true}, "description": "Heading visible"}
            ]
        })
    }

    #[test]
    fn test_valid_plan() {
        let plan = Plan::from_value(plan_json()).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].action, Action::Assert);
        assert_eq!(
            plan.steps[1].assertion.as_ref().map(|a| a.kind),
            Some(AssertionKind::Visible)
        );
    }

    #[test]
    fn test_unknown_action_rejected() {
        let mut value = plan_json();
        value["steps"][0]["action"] = json!("hover");
        let err = Plan::from_value(value).unwrap_err();
        assert_eq!(err.record, "plan");
    }

    #[test]
    fn test_step_numbers_must_start_at_one() {
        let mut value = plan_json();
        value["steps"][0]["stepNumber"] = json!(0);
        let err = Plan::from_value(value).unwrap_err();
        assert_eq!(err.path, "steps[0].stepNumber");
    }

    #[test]
    fn test_step_numbers_must_increase() {
        let mut value = plan_json();
        value["steps"][1]["stepNumber"] = json!(1);
        let err = Plan::from_value(value).unwrap_err();
        assert_eq!(err.path, "steps[1].stepNumber");
    }

    #[test]
    fn test_missing_base_url_rejected() {
        let mut value = plan_json();
        value["baseUrl"] = json!("  ");
        assert_eq!(Plan::from_value(value).unwrap_err().path, "baseUrl");

        let mut value = plan_json();
        value.as_object_mut().unwrap().remove("baseUrl");
        assert!(Plan::from_value(value).is_err());
    }

    #[test]
    fn test_empty_steps_rejected() {
        let mut value = plan_json();
        value["steps"] = json!([]);
        assert_eq!(Plan::from_value(value).unwrap_err().path, "steps");
    }

    #[test]
    fn test_metadata_omitted_until_recorded() {
        let plan = Plan::from_value(plan_json()).unwrap();
        let value = serde_json::to_value(&plan).unwrap();
        assert!(value.get("specFileName").is_none());
        assert!(value["steps"][0].get("value").is_none());
    }
}
