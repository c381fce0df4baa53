//! Replacement claim provisioning

use crate::config::TimingConfig;
use crate::domain::claim::{claim_phase, ClaimPhase};
use crate::domain::ports::ClusterApi;
use crate::engine::events::{EventSink, MigrationEvent};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

/// Build a claim named `name` shaped like `source` with a new capacity.
///
/// Carries over access modes, storage class, volume mode and labels. Never
/// copies the source's volume binding.
pub fn replacement_claim(
    source: &PersistentVolumeClaim,
    namespace: &str,
    name: &str,
    size: &str,
) -> PersistentVolumeClaim {
    let source_spec = source.spec.clone().unwrap_or_default();
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: source.metadata.labels.clone(),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: source_spec.access_modes,
            storage_class_name: source_spec.storage_class_name,
            volume_mode: source_spec.volume_mode,
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

pub struct VolumeProvisioner<'a> {
    cluster: &'a dyn ClusterApi,
    timing: &'a TimingConfig,
    events: &'a EventSink,
}

impl<'a> VolumeProvisioner<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, timing: &'a TimingConfig, events: &'a EventSink) -> Self {
        Self {
            cluster,
            timing,
            events,
        }
    }

    pub async fn create(
        &self,
        namespace: &str,
        source: &PersistentVolumeClaim,
        name: &str,
        size: &str,
    ) -> Result<PersistentVolumeClaim> {
        let claim = replacement_claim(source, namespace, name, size);
        let created = self.cluster.create_claim(namespace, &claim).await?;
        self.events.emit(MigrationEvent::ClaimCreated {
            claim: name.to_string(),
            size: size.to_string(),
        });
        Ok(created)
    }

    /// Poll until the claim is Bound; returns the bound object
    pub async fn await_bound(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        let (cluster, events) = (self.cluster, self.events);
        let bound = self
            .timing
            .object_poll()
            .run(|| async move {
                let claim = cluster.get_claim(namespace, name).await?.ok_or_else(|| {
                    Error::ResourceNotFound {
                        kind: "PersistentVolumeClaim".into(),
                        name: format!("{}/{}", namespace, name),
                    }
                })?;
                match claim_phase(&claim) {
                    ClaimPhase::Bound => Ok(Some(claim)),
                    phase => {
                        events.emit(MigrationEvent::ClaimWaiting {
                            claim: name.to_string(),
                            phase,
                        });
                        Ok(None)
                    }
                }
            })
            .await?
            .or_timeout(format!("PVC {} to be bound", name))?;

        self.events.emit(MigrationEvent::ClaimBound {
            claim: name.to_string(),
        });
        Ok(bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::{fixtures, Fault, InMemoryCluster};
    use crate::domain::claim::{requested_storage, storage_class_name};
    use assert_matches::assert_matches;

    #[test]
    fn test_replacement_claim_shape() {
        let mut source = fixtures::claim("ns", "data", "5Gi", "fast");
        source.spec.as_mut().unwrap().volume_name = Some("pvc-123".into());
        source.metadata.uid = Some("abc".into());

        let target = replacement_claim(&source, "ns", "data-new", "10Gi");
        assert_eq!(target.metadata.name.as_deref(), Some("data-new"));
        assert_eq!(target.metadata.labels, source.metadata.labels);
        assert!(target.metadata.uid.is_none());
        assert_eq!(requested_storage(&target), Some("10Gi"));
        assert_eq!(storage_class_name(&target), Some("fast"));

        let spec = target.spec.unwrap();
        assert_eq!(spec.access_modes, Some(vec!["ReadWriteOnce".to_string()]));
        assert_eq!(spec.volume_mode.as_deref(), Some("Filesystem"));
        assert!(spec.volume_name.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_and_bind() {
        let cluster = InMemoryCluster::new();
        cluster.seed_storage_class("standard", "example.com/csi");
        cluster.seed_bound_claim("ns", "data", "5Gi", "standard", 0);
        let source = cluster.claim("ns", "data").unwrap();

        let timing = TimingConfig::default();
        let events = EventSink::new(32);
        let provisioner = VolumeProvisioner::new(&cluster, &timing, &events);

        provisioner.create("ns", &source, "data-new", "10Gi").await.unwrap();
        let bound = provisioner.await_bound("ns", "data-new").await.unwrap();
        assert_eq!(claim_phase(&bound), ClaimPhase::Bound);
        assert!(bound.spec.unwrap().volume_name.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_timeout() {
        let cluster = InMemoryCluster::new();
        cluster.seed_storage_class("standard", "example.com/csi");
        cluster.inject(Fault::NeverBind("data-new".into()));
        let source = fixtures::claim("ns", "data", "5Gi", "standard");

        let timing = TimingConfig::default();
        let events = EventSink::new(64);
        let provisioner = VolumeProvisioner::new(&cluster, &timing, &events);

        provisioner.create("ns", &source, "data-new", "10Gi").await.unwrap();
        let err = provisioner.await_bound("ns", "data-new").await.unwrap_err();
        assert_matches!(err, Error::Timeout { .. });
        assert_eq!(err.to_string(), "timeout waiting for PVC data-new to be bound after 29s");
    }
}
