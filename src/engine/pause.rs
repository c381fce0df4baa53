//! Workload pausing
//!
//! Stops the pods using a claim and blocks until none remain.

use crate::config::TimingConfig;
use crate::domain::ports::ClusterApi;
use crate::engine::consumers::{Consumer, ConsumerTracker};
use crate::engine::events::{EventSink, MigrationEvent};
use crate::error::Result;
use tracing::{debug, info};

pub struct PauseCoordinator<'a> {
    cluster: &'a dyn ClusterApi,
    timing: &'a TimingConfig,
    events: &'a EventSink,
}

impl<'a> PauseCoordinator<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, timing: &'a TimingConfig, events: &'a EventSink) -> Self {
        Self {
            cluster,
            timing,
            events,
        }
    }

    /// Delete each consumer pod, then wait for the claim to be unused.
    ///
    /// The first failing delete call aborts. Pods owned by a controller are
    /// recreated on the still-existing claim, so for those the drain times
    /// out; scale the owner down before resizing.
    pub async fn stop_pods(&self, namespace: &str, claim: &str, pods: &[Consumer]) -> Result<()> {
        for pod in pods {
            self.events.emit(MigrationEvent::PodStopping {
                pod: pod.name.clone(),
            });
            let outcome = self.cluster.delete_pod(namespace, &pod.name, None).await?;
            debug!(pod = %pod.name, ?outcome, "consumer pod delete issued");
        }
        self.wait_for_drain(namespace, claim).await
    }

    /// Poll the consumer set until it is empty or the drain deadline passes
    pub async fn wait_for_drain(&self, namespace: &str, claim: &str) -> Result<()> {
        let tracker = ConsumerTracker::new(self.cluster);
        let tracker = &tracker;

        self.timing
            .drain_poll()
            .run(|| async move {
                let remaining = tracker.pods_using(namespace, claim).await?;
                if remaining.is_empty() {
                    Ok(Some(()))
                } else {
                    debug!(claim, remaining = remaining.len(), "waiting for pods to terminate");
                    Ok(None)
                }
            })
            .await?
            .or_timeout(format!("pods using PVC {} to terminate", claim))?;

        info!(namespace, claim, "all consumer pods terminated");
        self.events.emit(MigrationEvent::ConsumersDrained {
            claim: claim.to_string(),
        });
        Ok(())
    }

    /// Delete one pod gracefully, force-deleting it if it lingers past the
    /// grace window. Returns whether force was needed.
    pub async fn delete_pod_with_escalation(&self, namespace: &str, pod: &str) -> Result<bool> {
        self.events.emit(MigrationEvent::PodStopping {
            pod: pod.to_string(),
        });
        if self.cluster.delete_pod(namespace, pod, None).await?.was_absent() {
            return Ok(false);
        }

        let cluster = self.cluster;
        let gone = self
            .timing
            .pod_delete_poll()
            .run(|| async move {
                Ok(cluster.get_pod(namespace, pod).await?.is_none().then_some(()))
            })
            .await?;
        if gone.is_ready() {
            return Ok(false);
        }

        self.cluster.delete_pod(namespace, pod, Some(0)).await?;
        self.events.emit(MigrationEvent::PodForceDeleted {
            pod: pod.to_string(),
        });
        Ok(true)
    }
}
