use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{AgentRequest, AutomationAgent};
use crate::error::AgentError;

struct ScriptedReply {
    outcome: Result<String, AgentError>,
    /// File rewritten before the reply is returned, as an agent fixing a
    /// test in place would.
    write: Option<(PathBuf, String)>,
}

/// Agent that answers from a queue of canned replies and records every
/// request. Used for offline runs and tests.
#[derive(Default)]
pub struct ScriptedAgent {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, reply: ScriptedReply) -> Self {
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(reply);
        self
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        self.push(ScriptedReply {
            outcome: Ok(text.into()),
            write: None,
        })
    }

    pub fn fail(self, error: AgentError) -> Self {
        self.push(ScriptedReply {
            outcome: Err(error),
            write: None,
        })
    }

    /// Overwrite `path` with `contents`, then reply with `text`.
    pub fn reply_after_writing(
        self,
        path: impl Into<PathBuf>,
        contents: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        self.push(ScriptedReply {
            outcome: Ok(text.into()),
            write: Some((path.into(), contents.into())),
        })
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[async_trait]
impl AutomationAgent for ScriptedAgent {
    async fn dispatch(&self, request: AgentRequest) -> Result<String, AgentError> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request);

        let next = self
            .replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        let Some(reply) = next else {
            return Err(AgentError::Transport(
                "scripted agent has no reply queued".to_string(),
            ));
        };

        if let Some((path, contents)) = reply.write {
            fs::write(&path, contents).map_err(|err| {
                AgentError::Transport(format!("failed to write {}: {err}", path.display()))
            })?;
        }
        reply.outcome
    }
}
