use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{AgentRequest, AutomationAgent, ToolScope};
use crate::error::AgentError;

/// Characters of stderr kept in [`AgentError::Exited`].
const STDERR_TAIL_CHARS: usize = 2_000;

/// Final message of `claude -p --output-format json`.
#[derive(Debug, Deserialize)]
struct CliReply {
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    result: Option<String>,
}

/// Agent backed by a headless agent CLI process, one process per dispatch.
///
/// The prompt is written to the child's stdin; the reply is read from the
/// JSON result document on stdout. The child is killed if the dispatch
/// times out or is dropped.
#[derive(Debug, Clone)]
pub struct CliAgent {
    command: String,
    extra_args: Vec<String>,
    working_dir: PathBuf,
}

impl CliAgent {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            extra_args: Vec::new(),
            working_dir: working_dir.into(),
        }
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn args(&self, scope: ToolScope) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        match scope {
            ToolScope::Full => {
                args.push("--permission-mode".to_string());
                args.push("bypassPermissions".to_string());
            }
            ToolScope::ReadOnly => {
                args.push("--allowedTools".to_string());
                args.push(scope.allowed_tools().join(","));
            }
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}

/// Pull the reply text out of the CLI's stdout. Output that is not a JSON
/// result document is taken verbatim.
fn parse_reply(stdout: &str) -> Result<String, AgentError> {
    let trimmed = stdout.trim();
    let document = serde_json::from_str::<CliReply>(trimmed).ok().or_else(|| {
        trimmed
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| serde_json::from_str::<CliReply>(line).ok())
    });

    match document {
        Some(reply) if reply.is_error => Err(AgentError::Transport(
            reply
                .result
                .or(reply.subtype)
                .unwrap_or_else(|| "agent reported an error".to_string()),
        )),
        Some(CliReply {
            result: Some(text), ..
        }) => Ok(text),
        Some(_) => Err(AgentError::EmptyResponse),
        None if trimmed.is_empty() => Err(AgentError::EmptyResponse),
        None => Ok(trimmed.to_string()),
    }
}

#[async_trait]
impl AutomationAgent for CliAgent {
    async fn dispatch(&self, request: AgentRequest) -> Result<String, AgentError> {
        let args = self.args(request.scope);
        debug!(
            command = %self.command,
            stage = request.stage.as_str(),
            prompt_chars = request.prompt.len(),
            "spawning agent process"
        );

        let mut child = Command::new(&self.command)
            .args(&args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AgentError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let prompt = request.prompt;
        let exchange = async move {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(prompt.as_bytes())
                    .await
                    .map_err(|err| AgentError::Transport(format!("failed to send prompt: {err}")))?;
                stdin
                    .shutdown()
                    .await
                    .map_err(|err| AgentError::Transport(format!("failed to close stdin: {err}")))?;
            }
            child
                .wait_with_output()
                .await
                .map_err(|err| AgentError::Transport(format!("failed to collect output: {err}")))
        };

        let output = match request.timeout {
            Some(limit) => timeout(limit, exchange)
                .await
                .map_err(|_| AgentError::Timeout(limit))??,
            None => exchange.await?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail: &str = if stderr.trim().is_empty() { &stdout } else { &stderr };
            return Err(AgentError::Exited {
                code: output.status.code(),
                stderr: tail(detail.trim(), STDERR_TAIL_CHARS),
            });
        }

        parse_reply(&stdout)
    }
}
