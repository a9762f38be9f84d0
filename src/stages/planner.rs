use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::StageOutput;
use crate::agent::{dispatch_retrying, AgentRequest, AutomationAgent, ToolScope};
use crate::artifacts::Stage;
use crate::error::PlanningError;
use crate::extract::extract;
use crate::model::{Plan, Specification};

const PLAN_PROMPT: &str = r#"You are a test planning expert. Convert this test specification into a structured JSON plan.

Output ONLY valid JSON inside a ```json code block, using exactly this structure:
```json
{
  "testName": "Test name",
  "description": "What it tests",
  "baseUrl": "https://example.com",
  "steps": [
    {
      "stepNumber": 1,
      "action": "navigate",
      "target": "https://example.com",
      "description": "Go to example.com"
    },
    {
      "stepNumber": 2,
      "action": "fill",
      "target": "Password field",
      "value": "{{PASSWORD}}",
      "description": "Enter the password"
    },
    {
      "stepNumber": 3,
      "action": "assert",
      "target": "Example Domain",
      "assertion": {"type": "visible", "expected": true},
      "description": "Verify heading visible"
    }
  ]
}
```

RULES:
1. navigate: target is the URL
2. click / fill: target is a short description of the element, e.g. "Login button"
3. fill: put the text to type in "value"; keep {{VAR_NAME}} placeholders exactly as written
4. assert: target is the text or element to check
5. Number steps from 1 with no gaps

ACTIONS: navigate, click, fill, assert, screenshot
ASSERTION TYPES: visible, text
"#;

/// Turns a specification into a validated [`Plan`]. Not retried here.
pub struct Planner {
    agent: Arc<dyn AutomationAgent>,
    timeout: Duration,
    benign_retry_limit: u32,
}

impl Planner {
    pub fn new(agent: Arc<dyn AutomationAgent>, timeout: Duration, benign_retry_limit: u32) -> Self {
        Self {
            agent,
            timeout,
            benign_retry_limit,
        }
    }

    pub fn build_prompt(spec: &Specification) -> String {
        let mut prompt = String::from(PLAN_PROMPT);
        prompt.push_str("\nSpecification file: ");
        prompt.push_str(&spec.file_name());
        prompt.push_str("\n\n");
        prompt.push_str(&spec.body);
        prompt.push_str("\n\nOutput ONLY the JSON in a code block. No other text.\n");
        prompt
    }

    pub async fn plan(&self, spec: &Specification) -> Result<StageOutput<Plan>, PlanningError> {
        let request = AgentRequest::new(Stage::Plan, Self::build_prompt(spec), ToolScope::ReadOnly)
            .with_timeout(self.timeout);
        let reply = dispatch_retrying(self.agent.as_ref(), &request, self.benign_retry_limit).await?;

        let plan = Plan::from_value(extract(&reply)?)?;
        debug!(test_name = %plan.test_name, steps = plan.steps.len(), "plan extracted");

        Ok(StageOutput {
            record: plan,
            transcript: reply,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ScriptedAgent;

    fn spec() -> Specification {
        Specification::from_text(
            "specs/example.md",
            "# Test: Example heading\n1. Open https://example.com\n2. Check the heading is visible",
        )
    }

    #[test]
    fn test_prompt_embeds_specification() {
        let prompt = Planner::build_prompt(&spec());
        assert!(prompt.contains("Specification file: example.md"));
        assert!(prompt.contains("Check the heading is visible"));
        assert!(prompt.contains("ACTIONS: navigate, click, fill, assert, screenshot"));
    }

    #[tokio::test]
    async fn test_plan_from_fenced_reply() {
        let agent = Arc::new(ScriptedAgent::new().reply(
            "Here is the plan:\n```json\n{\"testName\": \"Example heading\", \"description\": \"d\", \"baseUrl\": \"https://example.com\", \"steps\": [{\"stepNumber\": 1, \"action\": \"navigate\", \"target\": \"https://example.com\", \"description\": \"Open\"}, {\"stepNumber\": 2, \"action\": \"assert\", \"target\": \"Example Domain\", \"assertion\": {\"type\": \"visible\", \"expected\": true}, \"description\": \"Visible\"}]}\n```",
        ));
        let planner = Planner::new(agent.clone(), Duration::from_secs(5), 0);

        let output = planner.plan(&spec()).await.unwrap();
        let numbers: Vec<u32> = output.record.steps.iter().map(|s| s.step_number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert!(output.transcript.starts_with("Here is the plan"));

        let requests = agent.requests();
        assert_eq!(requests[0].scope, ToolScope::ReadOnly);
        assert_eq!(requests[0].timeout, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_prose_reply_is_extraction_error() {
        let agent = Arc::new(ScriptedAgent::new().reply("I cannot plan this."));
        let planner = Planner::new(agent, Duration::from_secs(5), 0);
        let err = planner.plan(&spec()).await.unwrap_err();
        assert!(matches!(err, PlanningError::Extraction(_)));
    }

    #[tokio::test]
    async fn test_invalid_plan_is_schema_error() {
        let agent = Arc::new(ScriptedAgent::new().reply(
            "```json\n{\"testName\": \"x\", \"baseUrl\": \"https://e.com\", \"steps\": [{\"stepNumber\": 2, \"action\": \"click\"}]}\n```",
        ));
        let planner = Planner::new(agent, Duration::from_secs(5), 0);
        let err = planner.plan(&spec()).await.unwrap_err();
        assert!(matches!(err, PlanningError::Schema(_)));
    }
}
