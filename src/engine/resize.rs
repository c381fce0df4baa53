//! Resize by copy-migration
//!
//! A claim is resized by copying its data into a freshly provisioned claim
//! and then moving the original name over to the new volume. The run is a
//! linear state machine:
//!
//! ```text
//! Validating -> PauseConsumers -> ProvisionTarget -> AwaitBound -> TransferData
//!   -> DeleteSource -> AwaitSourceGone -> RenameTarget -> CleanupTemp -> Done
//! ```
//!
//! Up to and including `TransferData` the source claim is untouched, so any
//! failure removes the temporary objects and ends in `Failed`. From
//! `DeleteSource` on there is no way back: failures there surface as
//! [`Error::FinalizeIncomplete`] naming the claim that now holds the data,
//! and failures in `CleanupTemp` only downgrade the result to
//! `DoneWithWarnings`.
//!
//! The recreated claim must land on the migrated volume rather than a new
//! empty one. Before the temporary claim is deleted its volume is switched
//! to the `Retain` reclaim policy; the recreated claim names that volume
//! explicitly, and once the temporary claim is gone the volume's `claimRef`
//! is cleared so the two can bind. The original reclaim policy is restored
//! afterwards.

use crate::config::MigrationConfig;
use crate::domain::capacity::{format_bytes, parse_quantity};
use crate::domain::claim::{bound_volume_name, requested_bytes, requested_storage, storage_class_name};
use crate::domain::ports::{ClusterApi, ReclaimPolicy};
use crate::engine::cleanup::{Cleanup, TempObject};
use crate::engine::consumers::ConsumerTracker;
use crate::engine::events::{EventSink, MigrationEvent};
use crate::engine::pause::PauseCoordinator;
use crate::engine::probe::CapacityProber;
use crate::engine::provision::VolumeProvisioner;
use crate::engine::transfer::{DataMigrationWorker, MigrationJob};
use crate::engine::worker::TransferStrategy;
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Annotation prefixes owned by the volume binding controllers
const BINDING_ANNOTATION_PREFIXES: &[&str] = &[
    "pv.kubernetes.io/",
    "volume.kubernetes.io/",
    "volume.beta.kubernetes.io/",
];

// =============================================================================
// Phases
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResizePhase {
    Validating,
    PauseConsumers,
    ProvisionTarget,
    AwaitBound,
    TransferData,
    DeleteSource,
    AwaitSourceGone,
    RenameTarget,
    CleanupTemp,
    Done,
    DoneWithWarnings,
    Failed,
}

impl ResizePhase {
    /// Whether the source claim is still intact in this phase
    pub fn is_reversible(self) -> bool {
        matches!(
            self,
            ResizePhase::Validating
                | ResizePhase::PauseConsumers
                | ResizePhase::ProvisionTarget
                | ResizePhase::AwaitBound
                | ResizePhase::TransferData
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResizePhase::Done | ResizePhase::DoneWithWarnings | ResizePhase::Failed
        )
    }
}

impl std::fmt::Display for ResizePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResizePhase::Validating => "Validating",
            ResizePhase::PauseConsumers => "PauseConsumers",
            ResizePhase::ProvisionTarget => "ProvisionTarget",
            ResizePhase::AwaitBound => "AwaitBound",
            ResizePhase::TransferData => "TransferData",
            ResizePhase::DeleteSource => "DeleteSource",
            ResizePhase::AwaitSourceGone => "AwaitSourceGone",
            ResizePhase::RenameTarget => "RenameTarget",
            ResizePhase::CleanupTemp => "CleanupTemp",
            ResizePhase::Done => "Done",
            ResizePhase::DoneWithWarnings => "DoneWithWarnings",
            ResizePhase::Failed => "Failed",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Report
// =============================================================================

/// Outcome of a completed resize
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeReport {
    pub namespace: String,
    pub claim: String,
    pub phase: ResizePhase,
    pub previous_size: String,
    pub size: String,
    pub previous_bytes: u64,
    pub target_bytes: u64,
    /// Measured usage; only present when the resize was a shrink
    pub used_bytes: Option<u64>,
    pub stopped_pods: Vec<String>,
    /// Volume now backing the claim
    pub volume_name: Option<String>,
    pub warnings: Vec<String>,
}

impl ResizeReport {
    fn new(namespace: &str, claim: &str, size: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            claim: claim.to_string(),
            phase: ResizePhase::Validating,
            previous_size: String::new(),
            size: size.to_string(),
            previous_bytes: 0,
            target_bytes: 0,
            used_bytes: None,
            stopped_pods: Vec::new(),
            volume_name: None,
            warnings: Vec::new(),
        }
    }
}

/// Mutable state of one run
struct Run<'r> {
    namespace: &'r str,
    claim: &'r str,
    temp_claim: String,
    phase: ResizePhase,
    created: Vec<TempObject>,
}

// =============================================================================
// Controller
// =============================================================================

pub struct ResizeController<'a> {
    cluster: &'a dyn ClusterApi,
    config: &'a MigrationConfig,
    events: &'a EventSink,
    strategy: &'a dyn TransferStrategy,
}

impl<'a> ResizeController<'a> {
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

    /// Resize `namespace/claim` to `size` (a Kubernetes quantity)
    pub async fn run(&self, namespace: &str, claim: &str, size: &str) -> Result<ResizeReport> {
        // the same string is written to both new claims, so it must be exactly
        // what was validated
        let size = size.trim();
        let mut run = Run {
            namespace,
            claim,
            temp_claim: self.config.temp_claim_name(claim),
            phase: ResizePhase::Validating,
            created: Vec::new(),
        };
        let mut report = ResizeReport::new(namespace, claim, size);

        let (source, job) = match self.migrate(&mut run, &mut report, size).await {
            Ok(migrated) => migrated,
            Err(e) => {
                self.abort(&mut run, &e).await;
                return Err(e);
            }
        };

        if let Err(e) = self.finalize(&mut run, &mut report, &source, &job).await {
            self.events.emit(MigrationEvent::ResizeFailed {
                claim: claim.to_string(),
                phase: run.phase,
                error: e.to_string(),
            });
            return Err(e);
        }

        self.events.emit(MigrationEvent::ResizeCompleted {
            claim: claim.to_string(),
            size: size.to_string(),
            warnings: report.warnings.len(),
        });
        Ok(report)
    }

    fn enter(&self, run: &mut Run<'_>, phase: ResizePhase) {
        info!(namespace = run.namespace, claim = run.claim, %phase, "resize phase");
        run.phase = phase;
        self.events.emit(MigrationEvent::PhaseChanged {
            claim: run.claim.to_string(),
            phase,
        });
    }

    // -------------------------------------------------------------------------
    // Reversible stage
    // -------------------------------------------------------------------------

    /// Steps up to and including the data copy. The source is never mutated.
    async fn migrate(
        &self,
        run: &mut Run<'_>,
        report: &mut ResizeReport,
        size: &str,
    ) -> Result<(PersistentVolumeClaim, MigrationJob)> {
        let (ns, claim) = (run.namespace, run.claim);
        let timing = &self.config.timing;

        self.enter(run, ResizePhase::Validating);
        let source = self.validate(run, report, size).await?;

        self.enter(run, ResizePhase::PauseConsumers);
        let pods = ConsumerTracker::new(self.cluster).pods_using(ns, claim).await?;
        if !pods.is_empty() {
            self.events.emit(MigrationEvent::ConsumersFound {
                claim: claim.to_string(),
                pods: pods.iter().map(|p| p.name.clone()).collect(),
            });
            PauseCoordinator::new(self.cluster, timing, self.events)
                .stop_pods(ns, claim, &pods)
                .await?;
            report.stopped_pods = pods.into_iter().map(|p| p.name).collect();
        }

        let provisioner = VolumeProvisioner::new(self.cluster, timing, self.events);

        self.enter(run, ResizePhase::ProvisionTarget);
        provisioner
            .create(ns, &source, &run.temp_claim, size)
            .await?;
        run.created.push(TempObject::Claim(run.temp_claim.clone()));

        self.enter(run, ResizePhase::AwaitBound);
        provisioner.await_bound(ns, &run.temp_claim).await?;

        self.enter(run, ResizePhase::TransferData);
        let worker = DataMigrationWorker::new(self.cluster, self.config, self.events, self.strategy);
        let mut job = worker.start(ns, claim, &run.temp_claim).await?;
        run.created.push(TempObject::Pod(job.worker.clone()));
        worker.wait(ns, &mut job).await?;

        let mut cleanup = Cleanup::new(self.cluster, ns, self.events);
        let pod = TempObject::Pod(job.worker.clone());
        cleanup.remove(&pod).await;
        run.created.retain(|o| *o != pod);
        report.warnings.extend(cleanup.into_warnings());

        Ok((source, job))
    }

    async fn validate(
        &self,
        run: &Run<'_>,
        report: &mut ResizeReport,
        size: &str,
    ) -> Result<PersistentVolumeClaim> {
        let (ns, claim) = (run.namespace, run.claim);
        let target_bytes = parse_quantity(size)?;

        let source = self
            .cluster
            .get_claim(ns, claim)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "PersistentVolumeClaim".into(),
                name: format!("{}/{}", ns, claim),
            })?;

        let class_name = storage_class_name(&source)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::MissingStorageClass {
                claim: claim.to_string(),
            })?;
        let class = self
            .cluster
            .get_storage_class(class_name)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "StorageClass".into(),
                name: class_name.to_string(),
            })?;
        if class.provisioner.is_empty() {
            return Err(Error::MissingProvisioner {
                class: class_name.to_string(),
            });
        }

        if self.cluster.get_claim(ns, &run.temp_claim).await?.is_some() {
            return Err(Error::MigrationInProgress {
                volume_name: format!("{}/{}", ns, claim),
            });
        }

        let current_bytes = requested_bytes(&source)?;
        report.previous_bytes = current_bytes;
        report.target_bytes = target_bytes;
        report.previous_size = requested_storage(&source)
            .map(str::to_string)
            .unwrap_or_else(|| format_bytes(current_bytes));

        self.events.emit(MigrationEvent::ResizeStarted {
            namespace: ns.to_string(),
            claim: claim.to_string(),
            current_size: report.previous_size.clone(),
            target_size: size.to_string(),
        });

        if target_bytes < current_bytes {
            let used_bytes = CapacityProber::new(self.cluster, self.config, self.events)
                .measure(ns, claim)
                .await?;
            report.used_bytes = Some(used_bytes);
            if used_bytes > target_bytes {
                return Err(Error::ShrinkBelowUsage {
                    used_bytes,
                    requested_bytes: target_bytes,
                });
            }
        }

        Ok(source)
    }

    /// Remove everything this run created and report the failure
    async fn abort(&self, run: &mut Run<'_>, error: &Error) {
        let failed_in = run.phase;
        warn!(
            namespace = run.namespace,
            claim = run.claim,
            phase = %failed_in,
            error = %error,
            "resize failed, cleaning up"
        );

        let mut cleanup = Cleanup::new(self.cluster, run.namespace, self.events);
        cleanup.remove_all(&run.created).await;
        run.created.clear();

        self.enter(run, ResizePhase::Failed);
        self.events.emit(MigrationEvent::ResizeFailed {
            claim: run.claim.to_string(),
            phase: failed_in,
            error: error.to_string(),
        });
    }

    // -------------------------------------------------------------------------
    // Irreversible stage
    // -------------------------------------------------------------------------

    fn incomplete(&self, run: &Run<'_>, reason: impl std::fmt::Display) -> Error {
        Error::FinalizeIncomplete {
            claim: run.claim.to_string(),
            temp_claim: run.temp_claim.clone(),
            phase: run.phase.to_string(),
            reason: reason.to_string(),
        }
    }

    async fn finalize(
        &self,
        run: &mut Run<'_>,
        report: &mut ResizeReport,
        source: &PersistentVolumeClaim,
        job: &MigrationJob,
    ) -> Result<()> {
        let (ns, claim) = (run.namespace, run.claim);
        let cluster = self.cluster;

        if !job.succeeded() {
            return Err(Error::Internal(format!(
                "refusing to delete PVC {}/{}: transfer {} did not succeed",
                ns, claim, job.worker
            )));
        }

        self.enter(run, ResizePhase::DeleteSource);
        cluster
            .delete_claim(ns, claim)
            .await
            .map_err(|e| self.incomplete(run, e))?;
        self.events.emit(MigrationEvent::ClaimDeleting {
            claim: claim.to_string(),
        });

        self.enter(run, ResizePhase::AwaitSourceGone);
        self.config
            .timing
            .object_poll()
            .run(|| async move { Ok(cluster.get_claim(ns, claim).await?.is_none().then_some(())) })
            .await
            .and_then(|outcome| outcome.or_timeout(format!("PVC {} to be deleted", claim)))
            .map_err(|e| self.incomplete(run, e))?;
        self.events.emit(MigrationEvent::ClaimGone {
            claim: claim.to_string(),
        });

        self.enter(run, ResizePhase::RenameTarget);
        let (volume, previous_policy) = self
            .rename_target(run, source)
            .await
            .map_err(|e| self.incomplete(run, e))?;
        report.volume_name = Some(volume.clone());

        self.enter(run, ResizePhase::CleanupTemp);
        let mut cleanup = Cleanup::new(cluster, ns, self.events);
        self.cleanup_temp(run, &volume, previous_policy, &mut cleanup)
            .await;
        report.warnings.extend(cleanup.into_warnings());

        let done = if report.warnings.is_empty() {
            ResizePhase::Done
        } else {
            ResizePhase::DoneWithWarnings
        };
        self.enter(run, done);
        report.phase = done;
        Ok(())
    }

    /// Pin the migrated volume and recreate the original claim on it.
    /// Returns the volume name and its previous reclaim policy.
    async fn rename_target(
        &self,
        run: &Run<'_>,
        source: &PersistentVolumeClaim,
    ) -> Result<(String, ReclaimPolicy)> {
        let ns = run.namespace;
        let target = self
            .cluster
            .get_claim(ns, &run.temp_claim)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "PersistentVolumeClaim".into(),
                name: format!("{}/{}", ns, run.temp_claim),
            })?;
        let volume = bound_volume_name(&target)
            .ok_or_else(|| {
                Error::Internal(format!("PVC {} is not bound to a volume", run.temp_claim))
            })?
            .to_string();
        let pv = self
            .cluster
            .get_volume(&volume)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "PersistentVolume".into(),
                name: volume.clone(),
            })?;

        let previous = ReclaimPolicy::from_spec(
            pv.spec
                .as_ref()
                .and_then(|s| s.persistent_volume_reclaim_policy.as_deref()),
        );
        if previous != ReclaimPolicy::Retain {
            self.cluster
                .set_reclaim_policy(&volume, ReclaimPolicy::Retain)
                .await?;
        }

        let renamed = renamed_claim(source, &target, ns, run.claim, &volume);
        self.cluster.create_claim(ns, &renamed).await?;
        self.events.emit(MigrationEvent::ClaimCreated {
            claim: run.claim.to_string(),
            size: requested_storage(&renamed).unwrap_or_default().to_string(),
        });
        Ok((volume, previous))
    }

    /// Best-effort: drop the temporary claim and hand its volume over.
    /// Stops at the first failure, since each step depends on the previous.
    async fn cleanup_temp(
        &self,
        run: &Run<'_>,
        volume: &str,
        previous_policy: ReclaimPolicy,
        cleanup: &mut Cleanup<'_>,
    ) {
        let (ns, claim, temp) = (run.namespace, run.claim, run.temp_claim.as_str());
        let cluster = self.cluster;
        let timing = &self.config.timing;

        if let Err(e) = cluster.delete_claim(ns, temp).await {
            cleanup.record(format!(
                "failed to delete temporary PVC {}: {}; PV {} is retained and still bound to it",
                temp, e, volume
            ));
            return;
        }

        let gone = timing
            .object_poll()
            .run(|| async move { Ok(cluster.get_claim(ns, temp).await?.is_none().then_some(())) })
            .await;
        match gone {
            Ok(outcome) if outcome.is_ready() => {}
            Ok(_) => {
                cleanup.record(format!(
                    "temporary PVC {} is still terminating; PV {} is retained",
                    temp, volume
                ));
                return;
            }
            Err(e) => {
                cleanup.record(format!("failed to check temporary PVC {}: {}", temp, e));
                return;
            }
        }
        self.events.emit(MigrationEvent::ClaimGone {
            claim: temp.to_string(),
        });

        if let Err(e) = cluster.release_volume(volume).await {
            cleanup.record(format!(
                "failed to release PV {} for PVC {}: {}",
                volume, claim, e
            ));
            return;
        }

        if let Err(e) = VolumeProvisioner::new(cluster, timing, self.events)
            .await_bound(ns, claim)
            .await
        {
            cleanup.record(format!(
                "PVC {} did not bind to PV {}: {}; reclaim policy left at Retain",
                claim, volume, e
            ));
            return;
        }

        if previous_policy != ReclaimPolicy::Retain {
            if let Err(e) = cluster.set_reclaim_policy(volume, previous_policy).await {
                cleanup.record(format!(
                    "failed to restore reclaim policy {} on PV {}: {}",
                    previous_policy, volume, e
                ));
            }
        }
    }
}

/// The claim that takes over the original name.
///
/// Built from scratch so no server-assigned metadata (UID, resourceVersion,
/// creationTimestamp, status) is carried over. Spec comes from the target;
/// user annotations come from the source, minus the binding controller's.
pub fn renamed_claim(
    source: &PersistentVolumeClaim,
    target: &PersistentVolumeClaim,
    namespace: &str,
    name: &str,
    volume: &str,
) -> PersistentVolumeClaim {
    let annotations = source.metadata.annotations.as_ref().map(|a| {
        a.iter()
            .filter(|(k, _)| !BINDING_ANNOTATION_PREFIXES.iter().any(|p| k.starts_with(p)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    });

    let mut spec = target.spec.clone().unwrap_or_default();
    spec.volume_name = Some(volume.to_string());

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: target.metadata.labels.clone(),
            annotations,
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::{fixtures, ClusterCall, Fault, InMemoryCluster};
    use crate::domain::claim::{claim_phase, ClaimPhase};
    use crate::engine::worker::FileCopy;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimStatus;
    use std::collections::BTreeMap;
    use std::time::Duration;

    const GI: u64 = 1 << 30;

    fn cluster(size: &str, used: u64) -> InMemoryCluster {
        let cluster = InMemoryCluster::new();
        cluster.seed_storage_class("standard", "example.com/csi");
        cluster.seed_bound_claim("ns", "data", size, "standard", used);
        cluster
    }

    async fn resize(
        cluster: &InMemoryCluster,
        config: &MigrationConfig,
        size: &str,
    ) -> Result<ResizeReport> {
        let events = EventSink::new(256);
        ResizeController::new(cluster, config, &events, &FileCopy)
            .run("ns", "data", size)
            .await
    }

    fn worker_finished(call: &ClusterCall) -> bool {
        matches!(call, ClusterCall::WorkerFinished { pod, succeeded: true, .. } if pod == "transfer-pod-data")
    }

    fn source_deleted(call: &ClusterCall) -> bool {
        matches!(call, ClusterCall::DeleteClaim { name, .. } if name == "data")
    }

    #[test]
    fn test_phase_reversibility() {
        assert!(ResizePhase::TransferData.is_reversible());
        assert!(!ResizePhase::DeleteSource.is_reversible());
        assert!(!ResizePhase::CleanupTemp.is_reversible());
        assert!(ResizePhase::DoneWithWarnings.is_terminal());
        assert_eq!(ResizePhase::AwaitSourceGone.to_string(), "AwaitSourceGone");
    }

    #[test]
    fn test_renamed_claim_strips_server_metadata() {
        let mut source = fixtures::claim("ns", "data", "5Gi", "standard");
        source.metadata.annotations = Some(BTreeMap::from([
            ("team".to_string(), "storage".to_string()),
            ("pv.kubernetes.io/bind-completed".to_string(), "yes".to_string()),
        ]));
        let mut target = fixtures::claim("ns", "data-new", "10Gi", "standard");
        target.metadata.uid = Some("uid-1".into());
        target.metadata.resource_version = Some("77".into());
        target.status = Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".into()),
            ..Default::default()
        });

        let renamed = renamed_claim(&source, &target, "ns", "data", "pvc-abc");
        assert_eq!(renamed.metadata.name.as_deref(), Some("data"));
        assert!(renamed.metadata.uid.is_none());
        assert!(renamed.metadata.resource_version.is_none());
        assert!(renamed.metadata.creation_timestamp.is_none());
        assert!(renamed.status.is_none());
        assert_eq!(
            renamed.metadata.annotations,
            Some(BTreeMap::from([("team".to_string(), "storage".to_string())]))
        );
        let spec = renamed.spec.unwrap();
        assert_eq!(spec.volume_name.as_deref(), Some("pvc-abc"));
        assert_eq!(requested_storage(&target), Some("10Gi"));
    }

    // Scenario A: grow a claim that is in use
    #[tokio::test(start_paused = true)]
    async fn test_grow_in_use_claim() {
        let cluster = cluster("5Gi", 2 * GI);
        cluster.seed_pod(fixtures::pod_using("ns", "web-0", "data"));
        let config = MigrationConfig::default();

        let report = resize(&cluster, &config, "10Gi").await.unwrap();
        assert_eq!(report.phase, ResizePhase::Done);
        assert_eq!(report.stopped_pods, vec!["web-0".to_string()]);
        assert_eq!(report.used_bytes, None);
        assert_eq!(report.previous_bytes, 5 * GI);
        assert_eq!(report.target_bytes, 10 * GI);

        let claim = cluster.claim("ns", "data").unwrap();
        assert_eq!(claim_phase(&claim), ClaimPhase::Bound);
        assert_eq!(requested_storage(&claim), Some("10Gi"));
        assert_eq!(bound_volume_name(&claim), report.volume_name.as_deref());
        assert_eq!(cluster.claim_used_bytes("ns", "data"), Some(2 * GI));
        assert!(cluster.claim("ns", "data-new").is_none());

        let pv = cluster.volume(report.volume_name.as_deref().unwrap()).unwrap();
        assert_eq!(
            pv.spec.unwrap().persistent_volume_reclaim_policy.as_deref(),
            Some("Delete")
        );

        // growing never probes
        assert!(!cluster
            .journal()
            .iter()
            .any(|c| matches!(c, ClusterCall::CreatePod { name, .. } if name.starts_with("size-check-"))));

        let copied = cluster.journal_position(worker_finished).unwrap();
        let deleted = cluster.journal_position(source_deleted).unwrap();
        assert!(copied < deleted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_padded_size_is_normalized() {
        let cluster = cluster("5Gi", GI);
        cluster.seed_pod(fixtures::pod_using("ns", "web-0", "data"));
        let config = MigrationConfig::default();

        let report = resize(&cluster, &config, " 10Gi ").await.unwrap();
        assert_eq!(report.phase, ResizePhase::Done);
        assert_eq!(report.size, "10Gi");
        let claim = cluster.claim("ns", "data").unwrap();
        assert_eq!(requested_storage(&claim), Some("10Gi"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_size_touches_nothing() {
        let cluster = cluster("5Gi", GI);
        cluster.seed_pod(fixtures::pod_using("ns", "web-0", "data"));
        let config = MigrationConfig::default();

        let err = resize(&cluster, &config, "10 Gi").await.unwrap_err();
        assert_matches!(err, Error::CapacityParse(_));
        assert!(cluster.journal().is_empty());
        assert!(cluster.pod("ns", "web-0").is_some());
    }

    // Scenario B: shrinking below current usage is refused
    #[tokio::test(start_paused = true)]
    async fn test_shrink_below_usage_refused() {
        let cluster = cluster("10Gi", 6 * GI);
        cluster.seed_pod(fixtures::pod_using("ns", "web-0", "data"));
        let config = MigrationConfig::default();

        let err = resize(&cluster, &config, "5Gi").await.unwrap_err();
        assert_matches!(
            err,
            Error::ShrinkBelowUsage { used_bytes, requested_bytes }
                if used_bytes == 6 * GI && requested_bytes == 5 * GI
        );
        assert!(err.to_string().starts_with("cannot shrink volume"));

        let journal = cluster.journal();
        assert!(journal.iter().all(|c| match c {
            ClusterCall::CreatePod { name, .. } | ClusterCall::DeletePod { name, .. } =>
                name == "size-check-data",
            ClusterCall::WorkerFinished { .. } => true,
            _ => false,
        }));
        assert!(cluster.pod("ns", "web-0").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrink_within_usage() {
        let cluster = cluster("10Gi", GI);
        let config = MigrationConfig::default();

        let report = resize(&cluster, &config, "5Gi").await.unwrap();
        assert_eq!(report.used_bytes, Some(GI));
        assert_eq!(report.phase, ResizePhase::Done);
        assert_eq!(requested_storage(&cluster.claim("ns", "data").unwrap()), Some("5Gi"));
        assert_eq!(cluster.claim_used_bytes("ns", "data"), Some(GI));
    }

    // Scenario D: the copy fails
    #[tokio::test(start_paused = true)]
    async fn test_transfer_failure_keeps_source() {
        let cluster = cluster("5Gi", GI);
        cluster.inject(Fault::WorkerFails {
            pod: "transfer-pod-data".into(),
            logs: "cp: write error: No space left on device".into(),
        });
        let config = MigrationConfig::default();

        let err = resize(&cluster, &config, "10Gi").await.unwrap_err();
        assert_matches!(err, Error::WorkerFailed { ref logs, .. } if logs.contains("No space left"));

        assert!(!cluster.claim_deletion_requested("ns", "data"));
        assert!(cluster.claim_deletion_requested("ns", "data-new"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(cluster.claim("ns", "data").is_some());
        assert!(cluster.claim("ns", "data-new").is_none());
        assert!(cluster.pod("ns", "transfer-pod-data").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_survives_every_early_fault() {
        let faults = vec![
            Fault::ListPods,
            Fault::DeletePod("web-0".into()),
            Fault::CreateClaim("data-new".into()),
            Fault::NeverBind("data-new".into()),
            Fault::CreatePod("transfer-pod-data".into()),
            Fault::WorkerFails {
                pod: "transfer-pod-data".into(),
                logs: "boom".into(),
            },
            Fault::WorkerHangs("transfer-pod-data".into()),
        ];
        let mut config = MigrationConfig::default();
        config.timing.transfer_timeout_secs = Some(60);

        for fault in faults {
            let cluster = cluster("5Gi", GI);
            cluster.seed_pod(fixtures::pod_using("ns", "web-0", "data"));
            cluster.inject(fault.clone());

            let result = resize(&cluster, &config, "10Gi").await;
            assert!(result.is_err(), "{:?} should fail the resize", fault);
            assert!(
                !cluster.claim_deletion_requested("ns", "data"),
                "{:?} reached source deletion",
                fault
            );

            tokio::time::sleep(Duration::from_secs(10)).await;
            assert!(cluster.claim("ns", "data").is_some());
            assert!(
                cluster.claim("ns", "data-new").is_none(),
                "{:?} left the temporary claim",
                fault
            );
            assert!(cluster.pod("ns", "transfer-pod-data").is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failures() {
        let config = MigrationConfig::default();

        let c = cluster("5Gi", 0);
        assert_matches!(resize(&c, &config, "ten gigs").await, Err(Error::CapacityParse(_)));
        assert!(c.journal().is_empty());

        let c = InMemoryCluster::new();
        let err = resize(&c, &config, "10Gi").await.unwrap_err();
        assert!(err.is_not_found());

        let c = InMemoryCluster::new();
        c.seed_claim(fixtures::claim("ns", "data", "5Gi", ""));
        assert_matches!(
            resize(&c, &config, "10Gi").await,
            Err(Error::MissingStorageClass { .. })
        );

        let c = InMemoryCluster::new();
        c.seed_storage_class("manual", "");
        c.seed_claim(fixtures::claim("ns", "data", "5Gi", "manual"));
        assert_matches!(
            resize(&c, &config, "10Gi").await,
            Err(Error::MissingProvisioner { class }) if class == "manual"
        );

        let c = cluster("5Gi", 0);
        c.seed_claim(fixtures::claim("ns", "data-new", "10Gi", "standard"));
        assert_matches!(
            resize(&c, &config, "10Gi").await,
            Err(Error::MigrationInProgress { .. })
        );
        assert!(!c.claim_deletion_requested("ns", "data-new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_delete_failure_is_incomplete() {
        let cluster = cluster("5Gi", GI);
        cluster.inject(Fault::DeleteClaim("data".into()));
        let config = MigrationConfig::default();

        let err = resize(&cluster, &config, "10Gi").await.unwrap_err();
        assert_matches!(
            err,
            Error::FinalizeIncomplete { ref phase, ref temp_claim, .. }
                if phase == "DeleteSource" && temp_claim == "data-new"
        );
        assert!(err.to_string().contains("data-new"));
        assert_eq!(cluster.claim_used_bytes("ns", "data-new"), Some(GI));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename_failure_keeps_data_retained() {
        let cluster = cluster("5Gi", GI);
        cluster.inject(Fault::CreateClaim("data".into()));
        let config = MigrationConfig::default();

        let err = resize(&cluster, &config, "10Gi").await.unwrap_err();
        assert_matches!(err, Error::FinalizeIncomplete { ref phase, .. } if phase == "RenameTarget");

        let temp = cluster.claim("ns", "data-new").unwrap();
        let pv = cluster.volume(bound_volume_name(&temp).unwrap()).unwrap();
        assert_eq!(
            pv.spec.unwrap().persistent_volume_reclaim_policy.as_deref(),
            Some("Retain")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_failure_is_warning() {
        let cluster = cluster("5Gi", GI);
        cluster.inject(Fault::DeleteClaim("data-new".into()));
        let config = MigrationConfig::default();

        let report = resize(&cluster, &config, "10Gi").await.unwrap();
        assert_eq!(report.phase, ResizePhase::DoneWithWarnings);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("data-new"));
        assert!(cluster.claim("ns", "data").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_narrate_phases() {
        let cluster = cluster("5Gi", GI);
        let config = MigrationConfig::default();
        let events = EventSink::new(256);
        let mut rx = events.subscribe();

        ResizeController::new(&cluster, &config, &events, &FileCopy)
            .run("ns", "data", "10Gi")
            .await
            .unwrap();

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let MigrationEvent::PhaseChanged { phase, .. } = event {
                phases.push(phase);
            }
        }
        assert_eq!(
            phases,
            vec![
                ResizePhase::Validating,
                ResizePhase::PauseConsumers,
                ResizePhase::ProvisionTarget,
                ResizePhase::AwaitBound,
                ResizePhase::TransferData,
                ResizePhase::DeleteSource,
                ResizePhase::AwaitSourceGone,
                ResizePhase::RenameTarget,
                ResizePhase::CleanupTemp,
                ResizePhase::Done,
            ]
        );
    }
}
