//! Data migration worker
//!
//! Copies everything from the source claim to the target claim through a
//! transfer pod. The pod's exit status is the only success signal.

use crate::config::MigrationConfig;
use crate::domain::ports::ClusterApi;
use crate::engine::events::EventSink;
use crate::engine::worker::{
    TransferStrategy, WorkerMount, WorkerPhase, WorkerRole, WorkerRunner, WorkerSpec,
};
use crate::error::{Error, Result};
use serde::Serialize;
use tracing::info;

/// One copy run between two claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationJob {
    pub source: String,
    pub target: String,
    pub worker: String,
    pub state: WorkerPhase,
}

impl MigrationJob {
    pub fn succeeded(&self) -> bool {
        self.state == WorkerPhase::Succeeded
    }
}

pub struct DataMigrationWorker<'a> {
    cluster: &'a dyn ClusterApi,
    config: &'a MigrationConfig,
    events: &'a EventSink,
    strategy: &'a dyn TransferStrategy,
}

impl<'a> DataMigrationWorker<'a> {
    pub fn new(
        cluster: &'a dyn ClusterApi,
        config: &'a MigrationConfig,
        events: &'a EventSink,
        strategy: &'a dyn TransferStrategy,
    ) -> Self {
        Self {
            cluster,
            config,
            events,
            strategy,
        }
    }

    pub fn spec(&self, source: &str, target: &str) -> WorkerSpec {
        let worker = &self.config.worker;
        WorkerSpec::new(self.config.transfer_pod_name(source), WorkerRole::Transfer, worker)
            .script(
                self.strategy
                    .script(&worker.source_mount_path, &worker.target_mount_path),
            )
            .mount(WorkerMount::read_only(source, worker.source_mount_path.as_str()))
            .mount(WorkerMount::writable(target, worker.target_mount_path.as_str()))
    }

    /// Create the transfer pod
    pub async fn start(&self, namespace: &str, source: &str, target: &str) -> Result<MigrationJob> {
        let spec = self.spec(source, target);
        info!(namespace, source, target, strategy = self.strategy.name(), "starting data transfer");
        WorkerRunner::new(self.cluster, namespace, self.events)
            .launch(&spec)
            .await?;
        Ok(MigrationJob {
            source: source.to_string(),
            target: target.to_string(),
            worker: spec.name,
            state: WorkerPhase::Created,
        })
    }

    /// Wait for the transfer pod to finish. Only a Succeeded pod yields
    /// `Ok`; a Failed pod's log is returned verbatim in the error.
    pub async fn wait(&self, namespace: &str, job: &mut MigrationJob) -> Result<()> {
        let spec = self.spec(&job.source, &job.target);
        let outcome = WorkerRunner::new(self.cluster, namespace, self.events)
            .await_terminal(&spec, self.config.timing.transfer_poll())
            .await?
            .or_timeout(format!("data transfer pod {} to complete", job.worker))?;

        job.state = outcome.phase;
        match outcome.phase {
            WorkerPhase::Succeeded => Ok(()),
            _ => Err(Error::WorkerFailed {
                worker: format!("data transfer pod {}", job.worker),
                logs: outcome.logs,
            }),
        }
    }
}
