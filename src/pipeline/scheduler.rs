use std::path::{Path, PathBuf};

use futures::future::join_all;
use tokio::task::{JoinError, JoinHandle};
use tracing::debug;

use super::{PipelineCoordinator, RunOptions, RunReport};
use crate::error::PipelineError;

/// Handle to a run executing in the background.
#[derive(Debug)]
pub struct RunTicket {
    pub run_id: String,
    pub dir: PathBuf,
    handle: JoinHandle<RunReport>,
}

impl RunTicket {
    pub async fn wait(self) -> Result<RunReport, JoinError> {
        self.handle.await
    }
}

/// Launches runs on the tokio runtime without waiting for them.
///
/// Runs interleave freely; the runtime's concurrency gate bounds how many
/// heavyweight stages execute at once across all of them.
#[derive(Debug, Clone)]
pub struct RunScheduler {
    coordinator: PipelineCoordinator,
}

impl RunScheduler {
    pub fn new(coordinator: PipelineCoordinator) -> Self {
        Self { coordinator }
    }

    /// Allocate the run's namespace now and execute it on a spawned task.
    /// The returned ticket's run id is immediately readable in the store.
    pub fn submit(&self, spec_path: &Path, options: RunOptions) -> Result<RunTicket, PipelineError> {
        let prepared = self.coordinator.prepare(spec_path)?;
        let run_id = prepared.run_id().to_string();
        let dir = prepared.run.dir().to_path_buf();
        debug!(run_id = %run_id, "run submitted");

        let coordinator = self.coordinator.clone();
        let handle = tokio::spawn(async move { coordinator.run_prepared(prepared, options).await });

        Ok(RunTicket { run_id, dir, handle })
    }

    pub async fn wait_all(tickets: Vec<RunTicket>) -> Vec<Result<RunReport, JoinError>> {
        join_all(tickets.into_iter().map(RunTicket::wait)).await
    }
}
