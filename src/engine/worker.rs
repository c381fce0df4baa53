//! Worker pods
//!
//! The prober and the data migration both run a short shell script in a
//! throwaway pod with one or more claims mounted. [`WorkerSpec`] describes
//! such a pod; [`WorkerRunner`] launches it, polls it to a terminal phase and
//! collects its log. What the copy step actually runs is a
//! [`TransferStrategy`].

use crate::config::WorkerConfig;
use crate::domain::ports::{ClusterApi, DeleteOutcome};
use crate::engine::events::{EventSink, MigrationEvent};
use crate::engine::poll::{PollOutcome, PollPolicy};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Volume, VolumeMount,
};
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "volume-migrator";
pub const ROLE_LABEL: &str = "volume-migrator/role";
pub const ROLE_PROBE: &str = "probe";
pub const ROLE_TRANSFER: &str = "transfer";

// =============================================================================
// Worker Spec
// =============================================================================

/// What a worker pod is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    Probe,
    Transfer,
}

impl WorkerRole {
    pub fn label(self) -> &'static str {
        match self {
            WorkerRole::Probe => ROLE_PROBE,
            WorkerRole::Transfer => ROLE_TRANSFER,
        }
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerRole::Probe => write!(f, "size check"),
            WorkerRole::Transfer => write!(f, "data transfer"),
        }
    }
}

/// A claim mounted into a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerMount {
    pub claim: String,
    pub mount_path: String,
    pub read_only: bool,
}

impl WorkerMount {
    pub fn read_only(claim: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self {
            claim: claim.into(),
            mount_path: mount_path.into(),
            read_only: true,
        }
    }

    pub fn writable(claim: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self {
            claim: claim.into(),
            mount_path: mount_path.into(),
            read_only: false,
        }
    }
}

/// A single-container pod running one shell script
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub role: WorkerRole,
    pub image: String,
    pub script: String,
    pub mounts: Vec<WorkerMount>,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, role: WorkerRole, config: &WorkerConfig) -> Self {
        Self {
            name: name.into(),
            role,
            image: config.image.clone(),
            script: String::new(),
            mounts: Vec::new(),
        }
    }

    pub fn script(mut self, script: impl Into<String>) -> Self {
        self.script = script.into();
        self
    }

    pub fn mount(mut self, mount: WorkerMount) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Render the pod object
    pub fn to_pod(&self, namespace: &str) -> Pod {
        let labels = BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (ROLE_LABEL.to_string(), self.role.label().to_string()),
        ]);

        let volume_name = |i: usize| format!("vol-{}", i);

        let volume_mounts = self
            .mounts
            .iter()
            .enumerate()
            .map(|(i, m)| VolumeMount {
                name: volume_name(i),
                mount_path: m.mount_path.clone(),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let volumes = self
            .mounts
            .iter()
            .enumerate()
            .map(|(i, m)| Volume {
                name: volume_name(i),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: m.claim.clone(),
                    read_only: Some(m.read_only),
                }),
                ..Default::default()
            })
            .collect();

        Pod {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                containers: vec![Container {
                    name: self.role.label().to_string(),
                    image: Some(self.image.clone()),
                    command: Some(vec!["sh".to_string(), "-c".to_string()]),
                    args: Some(vec![self.script.clone()]),
                    volume_mounts: Some(volume_mounts),
                    ..Default::default()
                }],
                volumes: Some(volumes),
                ..Default::default()
            }),
            status: None,
        }
    }
}

// =============================================================================
// Transfer Strategy
// =============================================================================

/// Produces the script that moves data from the source to the target mount
pub trait TransferStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn script(&self, source_path: &str, target_path: &str) -> String;
}

/// Recursive `cp -a` with listings before and after
#[derive(Debug, Clone, Copy, Default)]
pub struct FileCopy;

impl TransferStrategy for FileCopy {
    fn name(&self) -> &str {
        "file-copy"
    }

    fn script(&self, source: &str, target: &str) -> String {
        format!(
            "echo \"Source contents:\" && ls -la {source} && \
             echo \"Starting copy...\" && cp -av {source}/. {target}/ && \
             echo \"Target contents:\" && ls -la {target} && \
             echo \"Data transfer complete\""
        )
    }
}

// =============================================================================
// Worker Runner
// =============================================================================

/// Lifecycle state of a worker pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerPhase {
    Created,
    Running,
    Succeeded,
    Failed,
}

impl WorkerPhase {
    pub fn of(pod: &Pod) -> Self {
        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Running") => WorkerPhase::Running,
            Some("Succeeded") => WorkerPhase::Succeeded,
            Some("Failed") => WorkerPhase::Failed,
            _ => WorkerPhase::Created,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerPhase::Succeeded | WorkerPhase::Failed)
    }
}

/// Terminal phase and log of a finished worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub phase: WorkerPhase,
    pub logs: String,
}

/// Launches, observes and removes worker pods in one namespace
pub struct WorkerRunner<'a> {
    cluster: &'a dyn ClusterApi,
    namespace: &'a str,
    events: &'a EventSink,
}

impl<'a> WorkerRunner<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, namespace: &'a str, events: &'a EventSink) -> Self {
        Self {
            cluster,
            namespace,
            events,
        }
    }

    pub async fn launch(&self, spec: &WorkerSpec) -> Result<()> {
        self.cluster
            .create_pod(self.namespace, &spec.to_pod(self.namespace))
            .await?;
        self.events.emit(MigrationEvent::WorkerStarted {
            pod: spec.name.clone(),
            role: spec.role.to_string(),
        });
        Ok(())
    }

    /// Poll until the pod is Succeeded or Failed, then read its log.
    ///
    /// A log that cannot be fetched for a failed pod is replaced by a note;
    /// for a succeeded pod the fetch error propagates, since callers parse it.
    pub async fn await_terminal(
        &self,
        spec: &WorkerSpec,
        policy: PollPolicy,
    ) -> Result<PollOutcome<WorkerOutcome>> {
        let (cluster, namespace, name) = (self.cluster, self.namespace, spec.name.as_str());
        let phase = policy
            .run(|| async move {
                let pod = cluster.get_pod(namespace, name).await?;
                let pod = pod.ok_or_else(|| Error::ResourceNotFound {
                    kind: "Pod".into(),
                    name: format!("{}/{}", namespace, name),
                })?;
                let phase = WorkerPhase::of(&pod);
                debug!(pod = %name, ?phase, "worker phase");
                Ok(phase.is_terminal().then_some(phase))
            })
            .await?;

        let phase = match phase {
            PollOutcome::Ready(phase) => phase,
            PollOutcome::TimedOut { waited } => return Ok(PollOutcome::TimedOut { waited }),
        };

        // only a succeeded probe needs its output; elsewhere logs explain a failure
        let logs = match self.cluster.pod_logs(self.namespace, &spec.name).await {
            Ok(logs) => logs,
            Err(e) if spec.role == WorkerRole::Probe && phase == WorkerPhase::Succeeded => {
                return Err(e)
            }
            Err(e) => {
                warn!(pod = %spec.name, error = %e, "failed to fetch worker logs");
                format!("<logs unavailable: {}>", e)
            }
        };

        if phase == WorkerPhase::Succeeded {
            self.events.emit(MigrationEvent::WorkerSucceeded {
                pod: spec.name.clone(),
                role: spec.role.to_string(),
            });
        }
        Ok(PollOutcome::Ready(WorkerOutcome { phase, logs }))
    }

    pub async fn remove(&self, name: &str) -> Result<DeleteOutcome> {
        self.cluster.delete_pod(self.namespace, name, None).await
    }

    /// Remove a worker, downgrading failure to a warning
    pub async fn remove_quietly(&self, name: &str) {
        if let Err(e) = self.remove(name).await {
            warn!(pod = %name, error = %e, "failed to delete worker pod");
            self.events
                .warn(format!("failed to delete worker pod {}: {}", name, e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::{fixtures, Fault, InMemoryCluster};
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn transfer_spec() -> WorkerSpec {
        let config = WorkerConfig::default();
        WorkerSpec::new("transfer-pod-data", WorkerRole::Transfer, &config)
            .script(FileCopy.script("/source", "/target"))
            .mount(WorkerMount::read_only("data", "/source"))
            .mount(WorkerMount::writable("data-new", "/target"))
    }

    #[test]
    fn test_pod_rendering() {
        let pod = transfer_spec().to_pod("ns");
        let labels = pod.metadata.labels.clone().unwrap();
        assert_eq!(labels[MANAGED_BY_LABEL], "volume-migrator");
        assert_eq!(labels[ROLE_LABEL], "transfer");

        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let container = &spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("busybox"));
        assert!(container.args.as_ref().unwrap()[0].contains("cp -av /source/. /target/"));

        let volumes = spec.volumes.unwrap();
        let source = volumes[0].persistent_volume_claim.as_ref().unwrap();
        assert_eq!(source.claim_name, "data");
        assert_eq!(source.read_only, Some(true));
        let target = volumes[1].persistent_volume_claim.as_ref().unwrap();
        assert_eq!(target.claim_name, "data-new");
        assert_eq!(target.read_only, Some(false));
    }

    #[test]
    fn test_file_copy_script() {
        let script = FileCopy.script("/source", "/target");
        assert_eq!(
            script,
            "echo \"Source contents:\" && ls -la /source && echo \"Starting copy...\" && \
             cp -av /source/. /target/ && echo \"Target contents:\" && ls -la /target && \
             echo \"Data transfer complete\""
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_reports_failure_logs() {
        let cluster = InMemoryCluster::new();
        cluster.seed_storage_class("standard", "example.com/csi");
        cluster.seed_bound_claim("ns", "data", "1Gi", "standard", 100);
        cluster.seed_bound_claim("ns", "data-new", "1Gi", "standard", 0);
        cluster.inject(Fault::WorkerFails {
            pod: "transfer-pod-data".into(),
            logs: "cp: can't stat '/source/x'".into(),
        });

        let events = EventSink::new(16);
        let runner = WorkerRunner::new(&cluster, "ns", &events);
        let spec = transfer_spec();
        runner.launch(&spec).await.unwrap();

        let outcome = runner
            .await_terminal(&spec, PollPolicy::unbounded(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Ready(WorkerOutcome {
                phase: WorkerPhase::Failed,
                logs: "cp: can't stat '/source/x'".into(),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_fetch_failure_only_matters_for_probes() {
        let cluster = InMemoryCluster::new();
        cluster.seed_storage_class("standard", "example.com/csi");
        cluster.seed_bound_claim("ns", "data", "1Gi", "standard", 100);
        cluster.seed_bound_claim("ns", "data-new", "1Gi", "standard", 0);
        cluster.inject(Fault::PodLogs("transfer-pod-data".into()));
        cluster.inject(Fault::PodLogs("size-check-data".into()));

        let events = EventSink::new(16);
        let runner = WorkerRunner::new(&cluster, "ns", &events);
        let policy = PollPolicy::unbounded(Duration::from_secs(2));

        let transfer = transfer_spec();
        runner.launch(&transfer).await.unwrap();
        let outcome = runner.await_terminal(&transfer, policy).await.unwrap();
        assert_matches!(
            outcome,
            PollOutcome::Ready(WorkerOutcome { phase: WorkerPhase::Succeeded, ref logs })
                if logs.starts_with("<logs unavailable")
        );

        let probe = WorkerSpec::new("size-check-data", WorkerRole::Probe, &WorkerConfig::default())
            .script("du -sb /data | cut -f1")
            .mount(WorkerMount::read_only("data", "/data"));
        runner.launch(&probe).await.unwrap();
        assert!(runner.await_terminal(&probe, policy).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_times_out_on_hung_worker() {
        let cluster = InMemoryCluster::new();
        cluster.seed_bound_claim("ns", "data", "1Gi", "standard", 0);
        cluster.seed_bound_claim("ns", "data-new", "1Gi", "standard", 0);
        cluster.inject(Fault::WorkerHangs("transfer-pod-data".into()));

        let events = EventSink::new(16);
        let runner = WorkerRunner::new(&cluster, "ns", &events);
        let spec = transfer_spec();
        runner.launch(&spec).await.unwrap();

        let outcome = runner
            .await_terminal(
                &spec,
                PollPolicy::deadline(Duration::from_secs(2), Duration::from_secs(60)),
            )
            .await
            .unwrap();
        assert!(!outcome.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_worker_is_error() {
        let cluster = InMemoryCluster::new();
        let events = EventSink::new(16);
        let runner = WorkerRunner::new(&cluster, "ns", &events);

        let result = runner
            .await_terminal(&transfer_spec(), PollPolicy::attempts(Duration::from_secs(1), 3))
            .await;
        assert!(result.unwrap_err().is_not_found());
    }

    #[test]
    fn test_worker_phase_from_pod() {
        let mut pod = fixtures::pod_using("ns", "p", "data");
        assert_eq!(WorkerPhase::of(&pod), WorkerPhase::Created);
        pod.status = Some(k8s_openapi::api::core::v1::PodStatus {
            phase: Some("Succeeded".into()),
            ..Default::default()
        });
        assert!(WorkerPhase::of(&pod).is_terminal());
    }
}
