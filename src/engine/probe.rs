//! Capacity probing
//!
//! Measures how many bytes a claim currently holds by running `du` in a
//! read-only worker pod. Used before a shrink to refuse targets smaller than
//! the data.

use crate::config::MigrationConfig;
use crate::domain::ports::ClusterApi;
use crate::engine::events::{EventSink, MigrationEvent};
use crate::engine::worker::{WorkerMount, WorkerPhase, WorkerRole, WorkerRunner, WorkerSpec};
use crate::error::{Error, Result};
use tracing::debug;

pub struct CapacityProber<'a> {
    cluster: &'a dyn ClusterApi,
    config: &'a MigrationConfig,
    events: &'a EventSink,
}

impl<'a> CapacityProber<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, config: &'a MigrationConfig, events: &'a EventSink) -> Self {
        Self {
            cluster,
            config,
            events,
        }
    }

    pub fn spec(&self, claim: &str) -> WorkerSpec {
        let mount_path = &self.config.worker.probe_mount_path;
        WorkerSpec::new(self.config.probe_pod_name(claim), WorkerRole::Probe, &self.config.worker)
            .script(format!("du -sb {} | cut -f1", mount_path))
            .mount(WorkerMount::read_only(claim, mount_path.as_str()))
    }

    /// Bytes currently used on `claim`. The probe pod is removed whatever
    /// the outcome.
    pub async fn measure(&self, namespace: &str, claim: &str) -> Result<u64> {
        let runner = WorkerRunner::new(self.cluster, namespace, self.events);
        let spec = self.spec(claim);

        runner.launch(&spec).await?;
        let result = self.collect(&runner, &spec).await;
        runner.remove_quietly(&spec.name).await;

        let used_bytes = result?;
        self.events.emit(MigrationEvent::DataSizeMeasured {
            claim: claim.to_string(),
            used_bytes,
        });
        Ok(used_bytes)
    }

    async fn collect(&self, runner: &WorkerRunner<'_>, spec: &WorkerSpec) -> Result<u64> {
        let outcome = runner
            .await_terminal(spec, self.config.timing.object_poll())
            .await?
            .or_timeout(format!("size check pod {} (probe did not complete)", spec.name))?;

        if outcome.phase == WorkerPhase::Failed {
            return Err(Error::WorkerFailed {
                worker: format!("size check pod {}", spec.name),
                logs: outcome.logs,
            });
        }
        debug!(pod = %spec.name, output = %outcome.logs.trim(), "probe finished");
        parse_used_bytes(&outcome.logs)
    }
}

/// Parse the `du -sb | cut -f1` output
pub fn parse_used_bytes(output: &str) -> Result<u64> {
    output
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::ProbeOutput {
            output: output.trim().to_string(),
        })
}
