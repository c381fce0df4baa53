//! Safe volume deletion
//!
//! Drains every workload referencing a claim before deleting it. Deployments
//! are scaled to zero and are not scaled back afterwards; the replica counts
//! they had are returned in the [`DeletionPlan`].

use crate::config::TimingConfig;
use crate::domain::ports::ClusterApi;
use crate::engine::consumers::ConsumerTracker;
use crate::engine::events::{EventSink, MigrationEvent};
use crate::engine::pause::PauseCoordinator;
use crate::error::Result;
use serde::Serialize;
use tracing::{info, warn};

/// A deployment that was scaled down
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaledDeployment {
    pub name: String,
    pub original_replicas: i32,
}

/// Replica counts captured before scale-down. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeletionPlan {
    pub deployments: Vec<ScaledDeployment>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionReport {
    pub namespace: String,
    pub claim: String,
    pub already_absent: bool,
    pub plan: DeletionPlan,
    pub deleted_pods: Vec<String>,
    pub force_deleted_pods: Vec<String>,
}

pub struct DeletionOrchestrator<'a> {
    cluster: &'a dyn ClusterApi,
    timing: &'a TimingConfig,
    events: &'a EventSink,
}

impl<'a> DeletionOrchestrator<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, timing: &'a TimingConfig, events: &'a EventSink) -> Self {
        Self {
            cluster,
            timing,
            events,
        }
    }

    pub async fn run(&self, namespace: &str, claim: &str) -> Result<DeletionReport> {
        self.events.emit(MigrationEvent::DeletionStarted {
            namespace: namespace.to_string(),
            claim: claim.to_string(),
        });
        match self.delete(namespace, claim).await {
            Ok(report) => {
                self.events.emit(MigrationEvent::DeletionCompleted {
                    claim: claim.to_string(),
                    already_absent: report.already_absent,
                });
                Ok(report)
            }
            Err(e) => {
                warn!(namespace, claim, error = %e, "volume deletion failed");
                self.events.emit(MigrationEvent::DeletionFailed {
                    claim: claim.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn delete(&self, namespace: &str, claim: &str) -> Result<DeletionReport> {
        let mut report = DeletionReport {
            namespace: namespace.to_string(),
            claim: claim.to_string(),
            already_absent: false,
            plan: DeletionPlan::default(),
            deleted_pods: Vec::new(),
            force_deleted_pods: Vec::new(),
        };

        if self.cluster.get_claim(namespace, claim).await?.is_none() {
            info!(namespace, claim, "PVC does not exist, nothing to delete");
            report.already_absent = true;
            return Ok(report);
        }

        let tracker = ConsumerTracker::new(self.cluster);
        for deployment in tracker.deployments_using(namespace, claim).await? {
            let name = deployment.consumer.name;
            if deployment.replicas > 0 {
                self.cluster.scale_deployment(namespace, &name, 0).await?;
                self.events.emit(MigrationEvent::DeploymentScaled {
                    deployment: name.clone(),
                    from_replicas: deployment.replicas,
                    to_replicas: 0,
                });
            }
            report.plan.deployments.push(ScaledDeployment {
                name,
                original_replicas: deployment.replicas,
            });
        }

        let pause = PauseCoordinator::new(self.cluster, self.timing, self.events);
        for pod in tracker.pods_using(namespace, claim).await? {
            if pause.delete_pod_with_escalation(namespace, &pod.name).await? {
                report.force_deleted_pods.push(pod.name.clone());
            }
            report.deleted_pods.push(pod.name);
        }
        pause.wait_for_drain(namespace, claim).await?;

        let outcome = self.cluster.delete_claim(namespace, claim).await?;
        if outcome.was_absent() {
            info!(namespace, claim, "PVC disappeared before delete was issued");
        }
        self.events.emit(MigrationEvent::ClaimDeleting {
            claim: claim.to_string(),
        });

        let cluster = self.cluster;
        self.timing
            .object_poll()
            .run(|| async move { Ok(cluster.get_claim(namespace, claim).await?.is_none().then_some(())) })
            .await?
            .or_timeout(format!("PVC {} to be deleted", claim))?;
        self.events.emit(MigrationEvent::ClaimGone {
            claim: claim.to_string(),
        });

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::{fixtures, ClusterCall, Fault, InMemoryCluster};
    use crate::error::Error;
    use assert_matches::assert_matches;

    fn cluster() -> InMemoryCluster {
        let cluster = InMemoryCluster::new();
        cluster.seed_storage_class("standard", "example.com/csi");
        cluster.seed_bound_claim("ns", "data", "5Gi", "standard", 1024);
        cluster
    }

    async fn delete(cluster: &InMemoryCluster) -> Result<DeletionReport> {
        let timing = TimingConfig::default();
        let events = EventSink::new(64);
        DeletionOrchestrator::new(cluster, &timing, &events)
            .run("ns", "data")
            .await
    }

    // Scenario C: delete a claim used by a deployment and a stray pod
    #[tokio::test(start_paused = true)]
    async fn test_delete_drains_consumers() {
        let cluster = cluster();
        cluster.seed_deployment(fixtures::deployment_using("ns", "api", "data", 2));
        cluster.seed_pod(fixtures::pod_using("ns", "debug", "data"));

        let report = delete(&cluster).await.unwrap();
        assert!(!report.already_absent);
        assert_eq!(
            report.plan.deployments,
            vec![ScaledDeployment {
                name: "api".into(),
                original_replicas: 2,
            }]
        );
        assert!(report.force_deleted_pods.is_empty());

        assert!(cluster.claim("ns", "data").is_none());
        assert!(cluster.pod_names("ns").is_empty());
        assert_eq!(
            cluster.deployment("ns", "api").unwrap().spec.unwrap().replicas,
            Some(0)
        );

        let journal = cluster.journal();
        let scaled = journal
            .iter()
            .position(|c| matches!(c, ClusterCall::ScaleDeployment { replicas: 0, .. }))
            .unwrap();
        let claim_deleted = journal
            .iter()
            .position(|c| matches!(c, ClusterCall::DeleteClaim { .. }))
            .unwrap();
        assert!(scaled < claim_deleted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_absent_claim_is_idempotent() {
        let cluster = InMemoryCluster::new();
        let report = delete(&cluster).await.unwrap();
        assert!(report.already_absent);
        assert!(cluster.journal().is_empty());

        let cluster = self::cluster();
        delete(&cluster).await.unwrap();
        let again = delete(&cluster).await.unwrap();
        assert!(again.already_absent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stubborn_pod_is_forced_before_claim_delete() {
        let cluster = cluster();
        cluster.seed_stubborn_pod(fixtures::pod_using("ns", "stuck", "data"));

        let report = delete(&cluster).await.unwrap();
        assert_eq!(report.force_deleted_pods, vec!["stuck".to_string()]);

        let journal = cluster.journal();
        let forced = journal
            .iter()
            .position(|c| matches!(c, ClusterCall::DeletePod { grace: Some(0), .. }))
            .unwrap();
        let claim_deleted = journal
            .iter()
            .position(|c| matches!(c, ClusterCall::DeleteClaim { .. }))
            .unwrap();
        assert!(forced < claim_deleted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_failure_aborts_before_claim_delete() {
        let cluster = cluster();
        cluster.seed_deployment(fixtures::deployment_using("ns", "api", "data", 1));
        cluster.inject(Fault::ScaleDeployment("api".into()));

        let err = delete(&cluster).await.unwrap_err();
        assert_matches!(err, Error::ControlPlane { .. });
        assert!(!cluster.claim_deletion_requested("ns", "data"));
        assert!(cluster.claim("ns", "data").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_delete_failure() {
        let cluster = cluster();
        cluster.inject(Fault::DeleteClaim("data".into()));

        let err = delete(&cluster).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
