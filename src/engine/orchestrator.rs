//! Volume Orchestrator
//!
//! Public entry point of the engine. Owns the configuration, the cluster
//! handle, the event channel and metrics, and makes sure only one resize or
//! delete runs per claim at a time.

use crate::config::MigrationConfig;
use crate::domain::claim::VolumeSummary;
use crate::domain::ports::ClusterApiRef;
use crate::engine::delete::{DeletionOrchestrator, DeletionReport};
use crate::engine::events::{EventSink, MigrationEvent};
use crate::engine::resize::{ResizeController, ResizeReport};
use crate::engine::worker::{FileCopy, TransferStrategy};
use crate::error::{Error, Result};
use crate::metrics::MigrationMetrics;
use dashmap::DashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, instrument};

/// Releases the in-flight slot for a claim when dropped
struct InFlightGuard<'a> {
    set: &'a DashSet<String>,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

pub struct VolumeOrchestrator {
    config: MigrationConfig,
    cluster: ClusterApiRef,
    strategy: Arc<dyn TransferStrategy>,
    events: EventSink,
    metrics: MigrationMetrics,
    /// `namespace/name` of claims with an operation running
    in_flight: DashSet<String>,
}

impl VolumeOrchestrator {
    pub fn new(config: MigrationConfig, cluster: ClusterApiRef) -> Result<Arc<Self>> {
        Self::with_strategy(config, cluster, Arc::new(FileCopy))
    }

    pub fn with_strategy(
        config: MigrationConfig,
        cluster: ClusterApiRef,
        strategy: Arc<dyn TransferStrategy>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let events = EventSink::new(config.event_channel_capacity);
        Ok(Arc::new(Self {
            config,
            cluster,
            strategy,
            events,
            metrics: MigrationMetrics::new()?,
            in_flight: DashSet::new(),
        }))
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MigrationMetrics {
        &self.metrics
    }

    /// Receive progress events of every subsequent operation
    pub fn subscribe(&self) -> broadcast::Receiver<MigrationEvent> {
        self.events.subscribe()
    }

    /// Claims in a namespace, or in all namespaces
    pub async fn list_volumes(&self, namespace: Option<&str>) -> Result<Vec<VolumeSummary>> {
        let claims = self.cluster.list_claims(namespace).await?;
        Ok(claims.iter().map(VolumeSummary::from).collect())
    }

    /// Resize a claim by migrating its data to a new claim of `size`
    #[instrument(skip(self), fields(operation = "resize"))]
    pub async fn resize_volume(
        &self,
        namespace: &str,
        name: &str,
        size: &str,
    ) -> Result<ResizeReport> {
        self.measured("resize", async {
            let _guard = self.acquire(namespace, name)?;
            ResizeController::new(
                self.cluster.as_ref(),
                &self.config,
                &self.events,
                self.strategy.as_ref(),
            )
            .run(namespace, name, size)
            .await
        })
        .await
    }

    /// Drain every consumer of a claim and delete it
    #[instrument(skip(self), fields(operation = "delete"))]
    pub async fn delete_volume(&self, namespace: &str, name: &str) -> Result<DeletionReport> {
        self.measured("delete", async {
            let _guard = self.acquire(namespace, name)?;
            DeletionOrchestrator::new(self.cluster.as_ref(), &self.config.timing, &self.events)
                .run(namespace, name)
                .await
        })
        .await
    }

    fn acquire(&self, namespace: &str, name: &str) -> Result<InFlightGuard<'_>> {
        let key = format!("{}/{}", namespace, name);
        if !self.in_flight.insert(key.clone()) {
            return Err(Error::MigrationInProgress { volume_name: key });
        }
        Ok(InFlightGuard {
            set: &self.in_flight,
            key,
        })
    }

    async fn measured<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let started = Instant::now();
        self.metrics.started();
        let result = fut.await;
        let label = match &result {
            Ok(_) => "success".to_string(),
            Err(e) => e.class().to_string(),
        };
        self.metrics
            .finished(operation, &label, started.elapsed());
        info!(operation, result = %label, elapsed_secs = started.elapsed().as_secs(), "operation finished");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::{fixtures, InMemoryCluster};
    use crate::domain::claim::ClaimPhase;
    use assert_matches::assert_matches;

    fn orchestrator() -> (Arc<InMemoryCluster>, Arc<VolumeOrchestrator>) {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.seed_storage_class("standard", "example.com/csi");
        cluster.seed_bound_claim("ns", "data", "5Gi", "standard", 1024);
        cluster.seed_bound_claim("other", "logs", "1Gi", "standard", 0);
        let orchestrator =
            VolumeOrchestrator::new(MigrationConfig::default(), cluster.clone()).unwrap();
        (cluster, orchestrator)
    }

    #[tokio::test]
    async fn test_list_volumes() {
        let (_, orchestrator) = orchestrator();

        let all = orchestrator.list_volumes(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let ns = orchestrator.list_volumes(Some("ns")).await.unwrap();
        assert_eq!(ns.len(), 1);
        assert_eq!(ns[0].name, "data");
        assert_eq!(ns[0].size, "5Gi");
        assert_eq!(ns[0].phase, ClaimPhase::Bound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_operations_rejected() {
        let (cluster, orchestrator) = orchestrator();
        cluster.seed_pod(fixtures::pod_using("ns", "web-0", "data"));

        let background = orchestrator.clone();
        let resize = tokio::spawn(async move {
            background.resize_volume("ns", "data", "10Gi").await
        });
        tokio::task::yield_now().await;

        assert_matches!(
            orchestrator.delete_volume("ns", "data").await,
            Err(Error::MigrationInProgress { volume_name }) if volume_name == "ns/data"
        );
        // other claims are unaffected
        orchestrator.delete_volume("other", "logs").await.unwrap();

        resize.await.unwrap().unwrap();
        assert_eq!(orchestrator.metrics().operation_count("resize", "success"), 1);
        assert_eq!(orchestrator.metrics().operation_count("delete", "precondition"), 1);

        // slot released once the resize finished
        orchestrator.delete_volume("ns", "data").await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = MigrationConfig::default();
        config.timing.object_poll_attempts = 0;
        let cluster = Arc::new(InMemoryCluster::new());
        assert_matches!(
            VolumeOrchestrator::new(config, cluster).err(),
            Some(Error::Configuration(_))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_reach_subscribers() {
        let (_, orchestrator) = orchestrator();
        let mut rx = orchestrator.subscribe();

        orchestrator.delete_volume("ns", "data").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_matches!(first, MigrationEvent::DeletionStarted { ref claim, .. } if claim == "data");
    }
}
