//! Consumer tracking
//!
//! Finds the workloads that reference a claim. Results are computed from a
//! fresh list call every time; nothing is cached between polls.

use crate::domain::claim::{claim_volume_in, pod_mounts_claim};
use crate::domain::ports::ClusterApi;
use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumerKind {
    Pod,
    Deployment,
}

/// A workload referencing a claim through one of its volumes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consumer {
    pub kind: ConsumerKind,
    pub name: String,
    /// Pod volume name that points at the claim
    pub volume: String,
}

/// A deployment consumer along with its current replica count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentConsumer {
    pub consumer: Consumer,
    pub replicas: i32,
}

pub struct ConsumerTracker<'a> {
    cluster: &'a dyn ClusterApi,
}

impl<'a> ConsumerTracker<'a> {
    pub fn new(cluster: &'a dyn ClusterApi) -> Self {
        Self { cluster }
    }

    /// Pods in `namespace` that mount `claim`
    pub async fn pods_using(&self, namespace: &str, claim: &str) -> Result<Vec<Consumer>> {
        let pods = self.cluster.list_pods(namespace).await?;
        Ok(pods
            .iter()
            .filter_map(|pod| {
                let volume = pod_mounts_claim(pod, claim)?;
                Some(Consumer {
                    kind: ConsumerKind::Pod,
                    name: pod.metadata.name.clone()?,
                    volume,
                })
            })
            .collect())
    }

    /// Deployments in `namespace` whose pod template mounts `claim`
    pub async fn deployments_using(
        &self,
        namespace: &str,
        claim: &str,
    ) -> Result<Vec<DeploymentConsumer>> {
        let deployments = self.cluster.list_deployments(namespace).await?;
        Ok(deployments
            .iter()
            .filter_map(|deployment| {
                let spec = deployment.spec.as_ref()?;
                let volume = claim_volume_in(spec.template.spec.as_ref()?, claim)?;
                Some(DeploymentConsumer {
                    consumer: Consumer {
                        kind: ConsumerKind::Deployment,
                        name: deployment.metadata.name.clone()?,
                        volume,
                    },
                    replicas: spec.replicas.unwrap_or(1),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::{fixtures, InMemoryCluster};

    #[tokio::test]
    async fn test_pods_using_claim() {
        let cluster = InMemoryCluster::new();
        cluster.seed_pod(fixtures::pod_using("ns", "web-0", "data"));
        cluster.seed_pod(fixtures::pod_using("ns", "web-1", "data"));
        cluster.seed_pod(fixtures::pod_using("ns", "other", "logs"));
        cluster.seed_pod(fixtures::pod_using("elsewhere", "web-0", "data"));

        let tracker = ConsumerTracker::new(&cluster);
        let pods = tracker.pods_using("ns", "data").await.unwrap();

        let names: Vec<_> = pods.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["web-0", "web-1"]);
        assert!(pods.iter().all(|c| c.kind == ConsumerKind::Pod && c.volume == "storage"));
    }

    #[tokio::test]
    async fn test_no_consumers_is_empty() {
        let cluster = InMemoryCluster::new();
        let tracker = ConsumerTracker::new(&cluster);
        assert!(tracker.pods_using("ns", "data").await.unwrap().is_empty());
        assert!(tracker.deployments_using("ns", "data").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deployments_using_claim() {
        let cluster = InMemoryCluster::new();
        cluster.seed_deployment(fixtures::deployment_using("ns", "api", "data", 3));
        cluster.seed_deployment(fixtures::deployment_using("ns", "worker", "queue", 1));

        let tracker = ConsumerTracker::new(&cluster);
        let deployments = tracker.deployments_using("ns", "data").await.unwrap();

        assert_eq!(deployments.len(), 1);
        assert_eq!(deployments[0].consumer.name, "api");
        assert_eq!(deployments[0].consumer.kind, ConsumerKind::Deployment);
        assert_eq!(deployments[0].replicas, 3);
    }
}
