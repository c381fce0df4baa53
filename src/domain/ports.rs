//! Domain Ports - The cluster boundary of the migration engine
//!
//! Every component reads and writes cluster state through [`ClusterApi`].
//! Adapters implement it against a real API server (`cluster::kube`) or a
//! simulated control plane (`cluster::memory`).

use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Delete Outcome
// =============================================================================

/// Result of a delete call that tolerates absent objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteOutcome {
    /// The API server accepted the delete
    Deleted,
    /// The object did not exist
    NotFound,
}

impl DeleteOutcome {
    /// Whether the object was already gone
    pub fn was_absent(self) -> bool {
        matches!(self, DeleteOutcome::NotFound)
    }
}

// =============================================================================
// Reclaim Policy
// =============================================================================

/// PersistentVolume reclaim policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReclaimPolicy {
    Retain,
    Delete,
    Recycle,
}

impl ReclaimPolicy {
    /// Parse the `spec.persistentVolumeReclaimPolicy` string; the API default is Delete
    pub fn from_spec(value: Option<&str>) -> Self {
        match value {
            Some("Retain") => ReclaimPolicy::Retain,
            Some("Recycle") => ReclaimPolicy::Recycle,
            _ => ReclaimPolicy::Delete,
        }
    }
}

impl std::fmt::Display for ReclaimPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReclaimPolicy::Retain => write!(f, "Retain"),
            ReclaimPolicy::Delete => write!(f, "Delete"),
            ReclaimPolicy::Recycle => write!(f, "Recycle"),
        }
    }
}

// =============================================================================
// Cluster Port
// =============================================================================

/// Port for every control-plane call the engine makes.
///
/// All calls are plain request/response; state is observed by polling
/// `get`/`list`, never by watches. Lookups of absent objects return `None`
/// instead of an error.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List claims in a namespace, or across all namespaces
    async fn list_claims(&self, namespace: Option<&str>) -> Result<Vec<PersistentVolumeClaim>>;

    async fn get_claim(&self, namespace: &str, name: &str)
        -> Result<Option<PersistentVolumeClaim>>;

    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim>;

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<DeleteOutcome>;

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;

    /// Delete a pod; `grace_period_secs = Some(0)` forces immediate removal
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_secs: Option<u32>,
    ) -> Result<DeleteOutcome>;

    /// Fetch the full log of a pod's only container
    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String>;

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>>;

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>>;

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    async fn set_reclaim_policy(&self, name: &str, policy: ReclaimPolicy) -> Result<()>;

    /// Clear a released volume's `claimRef` so a new claim can bind to it
    async fn release_volume(&self, name: &str) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ClusterApiRef = Arc<dyn ClusterApi>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reclaim_policy_parse() {
        assert_eq!(ReclaimPolicy::from_spec(Some("Retain")), ReclaimPolicy::Retain);
        assert_eq!(ReclaimPolicy::from_spec(Some("Delete")), ReclaimPolicy::Delete);
        assert_eq!(ReclaimPolicy::from_spec(None), ReclaimPolicy::Delete);
        assert_eq!(format!("{}", ReclaimPolicy::Retain), "Retain");
    }

    #[test]
    fn test_delete_outcome() {
        assert!(DeleteOutcome::NotFound.was_absent());
        assert!(!DeleteOutcome::Deleted.was_absent());
    }
}
