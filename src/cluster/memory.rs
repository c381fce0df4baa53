//! In-memory control plane
//!
//! A deterministic stand-in for the Kubernetes API used by tests and the
//! `--standalone` mode. It models the behaviour the migration engine relies
//! on: claims bind after a delay and provision a PersistentVolume, deleted
//! objects linger before disappearing, claims stay while a pod still mounts
//! them, worker pods run their job and finish, and reclaim policies decide
//! whether a volume's data survives its claim.
//!
//! Transitions are driven by `tokio::time`, so tests running with a paused
//! clock advance through them instantly. Every successful mutation is
//! recorded in a journal for ordering assertions, and faults can be injected
//! per object.

use crate::domain::capacity::parse_quantity;
use crate::domain::claim::{claim_phase, pod_mounts_claim, requested_storage, ClaimPhase};
use crate::domain::ports::{ClusterApi, DeleteOutcome, ReclaimPolicy};
use crate::engine::worker::{ROLE_LABEL, ROLE_PROBE, ROLE_TRANSFER};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimStatus,
    PersistentVolumeSpec, PersistentVolumeStatus, Pod, PodStatus,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use kube::error::ErrorResponse;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

// =============================================================================
// Configuration
// =============================================================================

/// Delays of the simulated control plane
#[derive(Debug, Clone)]
pub struct SimTiming {
    /// Time from claim creation to Bound
    pub bind_delay: Duration,
    /// Time a deleted claim lingers once nothing mounts it
    pub claim_delete_delay: Duration,
    /// Time from pod creation to Running
    pub pod_start_delay: Duration,
    /// Time a worker pod runs before finishing
    pub worker_run_time: Duration,
    /// Time a gracefully deleted pod takes to terminate
    pub pod_termination: Duration,
}

impl Default for SimTiming {
    fn default() -> Self {
        Self {
            bind_delay: Duration::from_secs(2),
            claim_delete_delay: Duration::from_secs(1),
            pod_start_delay: Duration::from_secs(1),
            worker_run_time: Duration::from_secs(3),
            pod_termination: Duration::from_secs(2),
        }
    }
}

/// Injected misbehaviour, keyed by object name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    CreateClaim(String),
    DeleteClaim(String),
    CreatePod(String),
    DeletePod(String),
    ListPods,
    ScaleDeployment(String),
    /// Claim never leaves Pending
    NeverBind(String),
    /// Worker pod ends in Failed with these logs
    WorkerFails { pod: String, logs: String },
    /// Worker pod never finishes
    WorkerHangs(String),
    /// Probe pods print this instead of the real usage
    ProbeOutput(String),
    SetReclaimPolicy(String),
    ReleaseVolume(String),
    /// Log requests for this pod fail
    PodLogs(String),
}

/// Journal entry for a successful mutation or a worker completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    CreateClaim { namespace: String, name: String },
    DeleteClaim { namespace: String, name: String },
    CreatePod { namespace: String, name: String },
    DeletePod { namespace: String, name: String, grace: Option<u32> },
    ScaleDeployment { namespace: String, name: String, replicas: i32 },
    SetReclaimPolicy { volume: String, policy: ReclaimPolicy },
    ReleaseVolume { volume: String },
    WorkerFinished { namespace: String, pod: String, succeeded: bool },
}

// =============================================================================
// State
// =============================================================================

struct ClaimEntry {
    object: PersistentVolumeClaim,
    created_at: Instant,
    deleting_since: Option<Instant>,
}

struct PodEntry {
    object: Pod,
    created_at: Instant,
    started_at: Option<Instant>,
    deleting_since: Option<Instant>,
    /// `None` means graceful deletion never completes
    termination: Option<Duration>,
    logs: String,
}

struct VolumeEntry {
    object: PersistentVolume,
    used_bytes: u64,
}

#[derive(Default)]
struct State {
    claims: BTreeMap<Key, ClaimEntry>,
    pods: BTreeMap<Key, PodEntry>,
    deployments: BTreeMap<Key, Deployment>,
    storage_classes: BTreeMap<String, StorageClass>,
    volumes: BTreeMap<String, VolumeEntry>,
    faults: Vec<Fault>,
    journal: Vec<ClusterCall>,
    next_uid: u64,
    timing: SimTiming,
}

// =============================================================================
// In-Memory Cluster
// =============================================================================

/// Simulated control plane implementing [`ClusterApi`]
pub struct InMemoryCluster {
    state: Mutex<State>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::with_timing(SimTiming::default())
    }

    pub fn with_timing(timing: SimTiming) -> Self {
        Self {
            state: Mutex::new(State {
                timing,
                ..Default::default()
            }),
        }
    }

    /// A small cluster for standalone demos: `default/data` (5Gi, 1Gi used)
    /// mounted by deployment `app`
    pub fn demo() -> Self {
        let cluster = Self::new();
        cluster.seed_storage_class("standard", "example.com/simulated");
        cluster.seed_bound_claim("default", "data", "5Gi", "standard", 1 << 30);
        cluster.seed_bound_claim("default", "logs", "1Gi", "standard", 0);
        cluster.seed_deployment(fixtures::deployment_using("default", "app", "data", 2));
        cluster
    }

    // -------------------------------------------------------------------------
    // Seeding
    // -------------------------------------------------------------------------

    pub fn seed_storage_class(&self, name: &str, provisioner: &str) {
        let class = StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            provisioner: provisioner.to_string(),
            reclaim_policy: Some("Delete".to_string()),
            ..Default::default()
        };
        self.state
            .lock()
            .storage_classes
            .insert(name.to_string(), class);
    }

    /// Insert a claim as-is; it binds through the normal simulation
    pub fn seed_claim(&self, claim: PersistentVolumeClaim) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let claim = state.admit(claim);
        let k = key(
            claim.metadata.namespace.as_deref().unwrap_or_default(),
            claim.metadata.name.as_deref().unwrap_or_default(),
        );
        state.claims.insert(
            k,
            ClaimEntry {
                object: claim,
                created_at: now,
                deleting_since: None,
            },
        );
    }

    /// Insert a claim already bound to a fresh volume holding `used_bytes`
    pub fn seed_bound_claim(
        &self,
        namespace: &str,
        name: &str,
        size: &str,
        storage_class: &str,
        used_bytes: u64,
    ) {
        let mut state = self.state.lock();
        let claim = state.admit(fixtures::claim(namespace, name, size, storage_class));
        let k = key(namespace, name);
        state.claims.insert(
            k.clone(),
            ClaimEntry {
                object: claim,
                created_at: Instant::now(),
                deleting_since: None,
            },
        );
        state.provision_volume(&k, used_bytes);
    }

    /// Insert a running pod that terminates normally when deleted
    pub fn seed_pod(&self, pod: Pod) {
        let termination = self.state.lock().timing.pod_termination;
        self.insert_running_pod(pod, Some(termination));
    }

    /// Insert a running pod that only goes away when force-deleted
    pub fn seed_stubborn_pod(&self, pod: Pod) {
        self.insert_running_pod(pod, None);
    }

    /// Insert a deployment and one running pod per replica
    pub fn seed_deployment(&self, deployment: Deployment) {
        let namespace = deployment.metadata.namespace.clone().unwrap_or_default();
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let spec = deployment.spec.clone().unwrap_or_default();
        let replicas = spec.replicas.unwrap_or(1);

        for i in 0..replicas {
            let pod = Pod {
                metadata: ObjectMeta {
                    name: Some(format!("{}-{}", name, i)),
                    namespace: Some(namespace.clone()),
                    labels: spec.template.metadata.as_ref().and_then(|m| m.labels.clone()),
                    ..Default::default()
                },
                spec: spec.template.spec.clone(),
                status: None,
            };
            self.seed_pod(pod);
        }

        self.state
            .lock()
            .deployments
            .insert(key(&namespace, &name), deployment);
    }

    fn insert_running_pod(&self, pod: Pod, termination: Option<Duration>) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let mut pod = state.admit_pod(pod);
        set_pod_phase(&mut pod, "Running");
        let k = key(
            pod.metadata.namespace.as_deref().unwrap_or_default(),
            pod.metadata.name.as_deref().unwrap_or_default(),
        );
        state.pods.insert(
            k,
            PodEntry {
                object: pod,
                created_at: now,
                started_at: Some(now),
                deleting_since: None,
                termination,
                logs: String::new(),
            },
        );
    }

    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn journal(&self) -> Vec<ClusterCall> {
        self.state.lock().journal.clone()
    }

    /// Position of the first journal entry matching `pred`
    pub fn journal_position(&self, pred: impl Fn(&ClusterCall) -> bool) -> Option<usize> {
        self.state.lock().journal.iter().position(pred)
    }

    pub fn claim_deletion_requested(&self, namespace: &str, name: &str) -> bool {
        self.journal_position(|c| {
            matches!(c, ClusterCall::DeleteClaim { namespace: ns, name: n } if ns == namespace && n == name)
        })
        .is_some()
    }

    pub fn claim(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        let mut state = self.state.lock();
        state.settle(Instant::now());
        state.claims.get(&key(namespace, name)).map(|e| e.object.clone())
    }

    pub fn claim_names(&self, namespace: &str) -> Vec<String> {
        let mut state = self.state.lock();
        state.settle(Instant::now());
        state
            .claims
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        let mut state = self.state.lock();
        state.settle(Instant::now());
        state.pods.get(&key(namespace, name)).map(|e| e.object.clone())
    }

    pub fn pod_names(&self, namespace: &str) -> Vec<String> {
        let mut state = self.state.lock();
        state.settle(Instant::now());
        state
            .pods
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.state.lock().deployments.get(&key(namespace, name)).cloned()
    }

    pub fn volume(&self, name: &str) -> Option<PersistentVolume> {
        let mut state = self.state.lock();
        state.settle(Instant::now());
        state.volumes.get(name).map(|v| v.object.clone())
    }

    /// Bytes stored on the volume bound to a claim
    pub fn claim_used_bytes(&self, namespace: &str, name: &str) -> Option<u64> {
        let mut state = self.state.lock();
        state.settle(Instant::now());
        let volume = state
            .claims
            .get(&key(namespace, name))?
            .object
            .spec
            .as_ref()?
            .volume_name
            .clone()?;
        state.volumes.get(&volume).map(|v| v.used_bytes)
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        state.settle(Instant::now());
        f(&mut state)
    }
}

impl State {
    fn has_fault(&self, fault: &Fault) -> bool {
        self.faults.contains(fault)
    }

    fn uid(&mut self) -> String {
        self.next_uid += 1;
        format!("00000000-0000-0000-0000-{:012x}", self.next_uid)
    }

    /// Assign server-side metadata to a claim being created
    fn admit(&mut self, mut claim: PersistentVolumeClaim) -> PersistentVolumeClaim {
        claim.metadata.uid = Some(self.uid());
        claim.metadata.resource_version = Some(self.next_uid.to_string());
        claim.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        claim.status = Some(PersistentVolumeClaimStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        });
        claim
    }

    fn admit_pod(&mut self, mut pod: Pod) -> Pod {
        pod.metadata.uid = Some(self.uid());
        pod.metadata.resource_version = Some(self.next_uid.to_string());
        pod.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        set_pod_phase(&mut pod, "Pending");
        pod
    }

    /// Create a PersistentVolume for a claim and bind them
    fn provision_volume(&mut self, claim_key: &Key, used_bytes: u64) {
        let uid = self.uid();
        let Some(entry) = self.claims.get(claim_key) else {
            return;
        };
        let claim = &entry.object;
        let class_name = claim
            .spec
            .as_ref()
            .and_then(|s| s.storage_class_name.clone());
        let reclaim = class_name
            .as_ref()
            .and_then(|c| self.storage_classes.get(c))
            .and_then(|c| c.reclaim_policy.clone())
            .unwrap_or_else(|| "Delete".to_string());
        let capacity = claim
            .spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.clone())
            .unwrap_or_default();

        let volume_name = format!("pvc-{}", &uid[uid.len() - 12..]);
        let volume = PersistentVolume {
            metadata: ObjectMeta {
                name: Some(volume_name.clone()),
                uid: Some(uid),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                capacity: Some(capacity),
                storage_class_name: class_name,
                persistent_volume_reclaim_policy: Some(reclaim),
                access_modes: claim.spec.as_ref().and_then(|s| s.access_modes.clone()),
                claim_ref: Some(claim_reference(claim)),
                ..Default::default()
            }),
            status: Some(PersistentVolumeStatus {
                phase: Some("Bound".to_string()),
                ..Default::default()
            }),
        };
        self.volumes.insert(
            volume_name.clone(),
            VolumeEntry {
                object: volume,
                used_bytes,
            },
        );
        if let Some(entry) = self.claims.get_mut(claim_key) {
            mark_bound(&mut entry.object, &volume_name, &self.volumes[&volume_name].object);
        }
    }

    fn claim_in_use(&self, claim_key: &Key) -> bool {
        self.pods.iter().any(|((ns, _), pod)| {
            ns == &claim_key.0 && pod_mounts_claim(&pod.object, &claim_key.1).is_some()
        })
    }

    /// Apply every transition due at `now`
    fn settle(&mut self, now: Instant) {
        self.settle_pods(now);
        self.settle_claims(now);
    }

    fn settle_pods(&mut self, now: Instant) {
        let timing = self.timing.clone();

        let gone: Vec<Key> = self
            .pods
            .iter()
            .filter(|(_, p)| match (p.deleting_since, p.termination) {
                (Some(since), Some(grace)) => now >= since + grace,
                _ => false,
            })
            .map(|(k, _)| k.clone())
            .collect();
        for k in gone {
            debug!(pod = %k.1, "simulated pod terminated");
            self.pods.remove(&k);
        }

        let keys: Vec<Key> = self.pods.keys().cloned().collect();
        for k in keys {
            let (phase, created_at, started_at, deleting) = {
                let p = &self.pods[&k];
                (
                    pod_phase(&p.object),
                    p.created_at,
                    p.started_at,
                    p.deleting_since.is_some(),
                )
            };
            if deleting {
                continue;
            }
            match phase.as_str() {
                "Pending" if now >= created_at + timing.pod_start_delay => {
                    if self.pod_claims_ready(&k) {
                        if let Some(pod) = self.pods.get_mut(&k) {
                            set_pod_phase(&mut pod.object, "Running");
                            pod.started_at = Some(created_at + timing.pod_start_delay);
                        }
                    }
                }
                "Running" => {
                    let finished = started_at
                        .map(|s| now >= s + timing.worker_run_time)
                        .unwrap_or(false);
                    if finished && worker_role(&self.pods[&k].object).is_some() {
                        self.finish_worker(&k);
                    }
                }
                _ => {}
            }
        }
    }

    fn pod_claims_ready(&self, pod_key: &Key) -> bool {
        let pod = &self.pods[pod_key].object;
        let volumes = pod
            .spec
            .as_ref()
            .and_then(|s| s.volumes.clone())
            .unwrap_or_default();
        volumes
            .iter()
            .filter_map(|v| v.persistent_volume_claim.as_ref())
            .all(|src| {
                self.claims
                    .get(&key(&pod_key.0, &src.claim_name))
                    .map(|c| claim_phase(&c.object) == ClaimPhase::Bound)
                    .unwrap_or(false)
            })
    }

    fn mounted_volume(&self, namespace: &str, pod: &Pod, read_only: bool) -> Option<String> {
        let volumes = pod.spec.as_ref()?.volumes.as_ref()?;
        let claim_name = volumes
            .iter()
            .filter_map(|v| v.persistent_volume_claim.as_ref())
            .find(|src| src.read_only.unwrap_or(false) == read_only)?
            .claim_name
            .clone();
        self.claims
            .get(&key(namespace, &claim_name))?
            .object
            .spec
            .as_ref()?
            .volume_name
            .clone()
    }

    fn finish_worker(&mut self, pod_key: &Key) {
        let pod = self.pods[pod_key].object.clone();
        let pod_name = pod_key.1.clone();
        let role = worker_role(&pod).unwrap_or_default();

        if self.has_fault(&Fault::WorkerHangs(pod_name.clone())) {
            return;
        }

        let injected_failure = self.faults.iter().find_map(|f| match f {
            Fault::WorkerFails { pod, logs } if *pod == pod_name => Some(logs.clone()),
            _ => None,
        });

        let (succeeded, logs) = if let Some(logs) = injected_failure {
            (false, logs)
        } else if role == ROLE_PROBE {
            let output = self.faults.iter().find_map(|f| match f {
                Fault::ProbeOutput(out) => Some(out.clone()),
                _ => None,
            });
            let used = self
                .mounted_volume(&pod_key.0, &pod, true)
                .and_then(|v| self.volumes.get(&v))
                .map(|v| v.used_bytes)
                .unwrap_or(0);
            (true, output.unwrap_or_else(|| format!("{}\n", used)))
        } else {
            self.copy_between_volumes(&pod_key.0, &pod)
        };

        if let Some(entry) = self.pods.get_mut(pod_key) {
            set_pod_phase(&mut entry.object, if succeeded { "Succeeded" } else { "Failed" });
            entry.logs = logs;
        }
        self.journal.push(ClusterCall::WorkerFinished {
            namespace: pod_key.0.clone(),
            pod: pod_name,
            succeeded,
        });
    }

    fn copy_between_volumes(&mut self, namespace: &str, pod: &Pod) -> (bool, String) {
        let (Some(source), Some(target)) = (
            self.mounted_volume(namespace, pod, true),
            self.mounted_volume(namespace, pod, false),
        ) else {
            return (false, "sh: /source: No such file or directory\n".to_string());
        };

        let used = self.volumes.get(&source).map(|v| v.used_bytes).unwrap_or(0);
        let target_capacity = self
            .volumes
            .get(&target)
            .and_then(|v| v.object.spec.as_ref())
            .and_then(|s| s.capacity.as_ref())
            .and_then(|c| c.get("storage"))
            .and_then(|q| parse_quantity(&q.0).ok())
            .unwrap_or(0);

        let mut logs = String::from("Source contents:\ntotal 0\nStarting copy...\n");
        if used > target_capacity {
            logs.push_str("cp: write error: No space left on device\n");
            return (false, logs);
        }
        if let Some(v) = self.volumes.get_mut(&target) {
            v.used_bytes = used;
        }
        logs.push_str("Target contents:\ntotal 0\nData transfer complete\n");
        (true, logs)
    }

    fn settle_claims(&mut self, now: Instant) {
        let timing = self.timing.clone();

        let removable: Vec<Key> = self
            .claims
            .iter()
            .filter(|(k, c)| {
                c.deleting_since
                    .map(|since| now >= since + timing.claim_delete_delay)
                    .unwrap_or(false)
                    && !self.claim_in_use(k)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for k in removable {
            if let Some(entry) = self.claims.remove(&k) {
                self.release_after_claim_removal(&entry.object);
            }
        }

        let pending: Vec<Key> = self
            .claims
            .iter()
            .filter(|(_, c)| {
                c.deleting_since.is_none()
                    && claim_phase(&c.object) == ClaimPhase::Pending
                    && now >= c.created_at + timing.bind_delay
            })
            .map(|(k, _)| k.clone())
            .collect();
        for k in pending {
            if self.has_fault(&Fault::NeverBind(k.1.clone())) {
                continue;
            }
            let requested_volume = self.claims[&k]
                .object
                .spec
                .as_ref()
                .and_then(|s| s.volume_name.clone());
            match requested_volume {
                Some(volume) => self.bind_existing(&k, &volume),
                None => {
                    let provisionable = self.claims[&k]
                        .object
                        .spec
                        .as_ref()
                        .and_then(|s| s.storage_class_name.as_ref())
                        .and_then(|c| self.storage_classes.get(c))
                        .map(|c| !c.provisioner.is_empty())
                        .unwrap_or(false);
                    if provisionable {
                        self.provision_volume(&k, 0);
                    }
                }
            }
        }
    }

    fn bind_existing(&mut self, claim_key: &Key, volume: &str) {
        let available = self
            .volumes
            .get(volume)
            .map(|v| v.object.spec.as_ref().and_then(|s| s.claim_ref.as_ref()).is_none())
            .unwrap_or(false);
        if !available {
            return;
        }
        let reference = claim_reference(&self.claims[claim_key].object);
        let Some(entry) = self.volumes.get_mut(volume) else {
            return;
        };
        if let Some(spec) = entry.object.spec.as_mut() {
            spec.claim_ref = Some(reference);
        }
        entry.object.status = Some(PersistentVolumeStatus {
            phase: Some("Bound".to_string()),
            ..Default::default()
        });
        let pv = entry.object.clone();
        if let Some(claim) = self.claims.get_mut(claim_key) {
            mark_bound(&mut claim.object, volume, &pv);
        }
    }

    fn release_after_claim_removal(&mut self, claim: &PersistentVolumeClaim) {
        let Some(volume) = claim.spec.as_ref().and_then(|s| s.volume_name.clone()) else {
            return;
        };
        let bound_here = self
            .volumes
            .get(&volume)
            .and_then(|v| v.object.spec.as_ref())
            .and_then(|s| s.claim_ref.as_ref())
            .map(|r| r.uid == claim.metadata.uid)
            .unwrap_or(false);
        if !bound_here {
            return;
        }
        let policy = ReclaimPolicy::from_spec(
            self.volumes[&volume]
                .object
                .spec
                .as_ref()
                .and_then(|s| s.persistent_volume_reclaim_policy.as_deref()),
        );
        match policy {
            ReclaimPolicy::Retain => {
                if let Some(v) = self.volumes.get_mut(&volume) {
                    v.object.status = Some(PersistentVolumeStatus {
                        phase: Some("Released".to_string()),
                        ..Default::default()
                    });
                }
            }
            _ => {
                debug!(volume = %volume, "simulated volume reclaimed");
                self.volumes.remove(&volume);
            }
        }
    }
}

// =============================================================================
// Object Helpers
// =============================================================================

fn pod_phase(pod: &Pod) -> String {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Pending".to_string())
}

fn set_pod_phase(pod: &mut Pod, phase: &str) {
    pod.status = Some(PodStatus {
        phase: Some(phase.to_string()),
        ..Default::default()
    });
}

fn worker_role(pod: &Pod) -> Option<String> {
    pod.metadata
        .labels
        .as_ref()?
        .get(ROLE_LABEL)
        .filter(|r| r.as_str() == ROLE_PROBE || r.as_str() == ROLE_TRANSFER)
        .cloned()
}

fn claim_reference(claim: &PersistentVolumeClaim) -> ObjectReference {
    ObjectReference {
        kind: Some("PersistentVolumeClaim".to_string()),
        namespace: claim.metadata.namespace.clone(),
        name: claim.metadata.name.clone(),
        uid: claim.metadata.uid.clone(),
        ..Default::default()
    }
}

fn mark_bound(claim: &mut PersistentVolumeClaim, volume: &str, pv: &PersistentVolume) {
    if let Some(spec) = claim.spec.as_mut() {
        spec.volume_name = Some(volume.to_string());
    }
    claim.status = Some(PersistentVolumeClaimStatus {
        phase: Some("Bound".to_string()),
        capacity: pv.spec.as_ref().and_then(|s| s.capacity.clone()),
        access_modes: pv.spec.as_ref().and_then(|s| s.access_modes.clone()),
        ..Default::default()
    });
}

fn injected(step: &str) -> Error {
    Error::control_plane(
        step,
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("injected failure: {}", step),
            reason: "InternalError".to_string(),
            code: 500,
        }),
    )
}

fn conflict(step: &str, message: String) -> Error {
    Error::control_plane(
        step,
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message,
            reason: "AlreadyExists".to_string(),
            code: 409,
        }),
    )
}

fn invalid(step: &str, message: String) -> Error {
    Error::control_plane(
        step,
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message,
            reason: "Invalid".to_string(),
            code: 422,
        }),
    )
}

fn object_key(meta: &ObjectMeta, namespace: &str) -> Key {
    key(namespace, meta.name.as_deref().unwrap_or_default())
}

// =============================================================================
// ClusterApi Implementation
// =============================================================================

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn list_claims(&self, namespace: Option<&str>) -> Result<Vec<PersistentVolumeClaim>> {
        self.with_state(|state| {
            Ok(state
                .claims
                .iter()
                .filter(|((ns, _), _)| namespace.map(|n| n == ns).unwrap_or(true))
                .map(|(_, c)| c.object.clone())
                .collect())
        })
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        self.with_state(|state| Ok(state.claims.get(&key(namespace, name)).map(|c| c.object.clone())))
    }

    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        self.with_state(|state| {
            let k = object_key(&claim.metadata, namespace);
            let step = format!("create PVC {}/{}", k.0, k.1);
            if state.has_fault(&Fault::CreateClaim(k.1.clone())) {
                return Err(injected(&step));
            }
            if claim.metadata.resource_version.is_some() || claim.metadata.uid.is_some() {
                return Err(invalid(
                    &step,
                    "resourceVersion should not be set on objects to be created".into(),
                ));
            }
            if state.claims.contains_key(&k) {
                return Err(conflict(
                    &step,
                    format!("persistentvolumeclaims \"{}\" already exists", k.1),
                ));
            }
            let storage = requested_storage(claim).unwrap_or_default();
            if storage.trim() != storage || parse_quantity(storage).is_err() {
                return Err(invalid(
                    &step,
                    format!(
                        "spec.resources.requests[storage]: Invalid value: {:?}: quantities must match the regular expression",
                        storage
                    ),
                ));
            }
            let mut claim = claim.clone();
            claim.metadata.namespace = Some(namespace.to_string());
            let admitted = state.admit(claim);
            state.claims.insert(
                k.clone(),
                ClaimEntry {
                    object: admitted.clone(),
                    created_at: Instant::now(),
                    deleting_since: None,
                },
            );
            state.journal.push(ClusterCall::CreateClaim {
                namespace: k.0,
                name: k.1,
            });
            Ok(admitted)
        })
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<DeleteOutcome> {
        self.with_state(|state| {
            if state.has_fault(&Fault::DeleteClaim(name.to_string())) {
                return Err(injected(&format!("delete PVC {}/{}", namespace, name)));
            }
            let Some(entry) = state.claims.get_mut(&key(namespace, name)) else {
                return Ok(DeleteOutcome::NotFound);
            };
            if entry.deleting_since.is_none() {
                entry.deleting_since = Some(Instant::now());
                entry.object.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            }
            state.journal.push(ClusterCall::DeleteClaim {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
            Ok(DeleteOutcome::Deleted)
        })
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        self.with_state(|state| {
            if state.has_fault(&Fault::ListPods) {
                return Err(injected(&format!("list pods in {}", namespace)));
            }
            Ok(state
                .pods
                .iter()
                .filter(|((ns, _), _)| ns == namespace)
                .map(|(_, p)| p.object.clone())
                .collect())
        })
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.with_state(|state| Ok(state.pods.get(&key(namespace, name)).map(|p| p.object.clone())))
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        self.with_state(|state| {
            let k = object_key(&pod.metadata, namespace);
            let step = format!("create pod {}/{}", k.0, k.1);
            if state.has_fault(&Fault::CreatePod(k.1.clone())) {
                return Err(injected(&step));
            }
            if state.pods.contains_key(&k) {
                return Err(conflict(&step, format!("pods \"{}\" already exists", k.1)));
            }
            let mut pod = pod.clone();
            pod.metadata.namespace = Some(namespace.to_string());
            let admitted = state.admit_pod(pod);
            let termination = Some(state.timing.pod_termination);
            state.pods.insert(
                k.clone(),
                PodEntry {
                    object: admitted.clone(),
                    created_at: Instant::now(),
                    started_at: None,
                    deleting_since: None,
                    termination,
                    logs: String::new(),
                },
            );
            state.journal.push(ClusterCall::CreatePod {
                namespace: k.0,
                name: k.1,
            });
            Ok(admitted)
        })
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_secs: Option<u32>,
    ) -> Result<DeleteOutcome> {
        self.with_state(|state| {
            if state.has_fault(&Fault::DeletePod(name.to_string())) {
                return Err(injected(&format!("delete pod {}/{}", namespace, name)));
            }
            let k = key(namespace, name);
            let Some(entry) = state.pods.get_mut(&k) else {
                return Ok(DeleteOutcome::NotFound);
            };
            if grace_period_secs == Some(0) {
                state.pods.remove(&k);
            } else if entry.deleting_since.is_none() {
                entry.deleting_since = Some(Instant::now());
                entry.object.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            }
            state.journal.push(ClusterCall::DeletePod {
                namespace: namespace.to_string(),
                name: name.to_string(),
                grace: grace_period_secs,
            });
            Ok(DeleteOutcome::Deleted)
        })
    }

    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String> {
        self.with_state(|state| {
            if state.has_fault(&Fault::PodLogs(name.to_string())) {
                return Err(injected(&format!("get logs of pod {}/{}", namespace, name)));
            }
            state
                .pods
                .get(&key(namespace, name))
                .map(|p| p.logs.clone())
                .ok_or_else(|| Error::ResourceNotFound {
                    kind: "Pod".into(),
                    name: format!("{}/{}", namespace, name),
                })
        })
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>> {
        self.with_state(|state| {
            Ok(state
                .deployments
                .iter()
                .filter(|((ns, _), _)| ns == namespace)
                .map(|(_, d)| d.clone())
                .collect())
        })
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        self.with_state(|state| {
            if state.has_fault(&Fault::ScaleDeployment(name.to_string())) {
                return Err(injected(&format!("scale deployment {}/{}", namespace, name)));
            }
            let k = key(namespace, name);
            let deployment = state.deployments.get_mut(&k).ok_or_else(|| Error::ResourceNotFound {
                kind: "Deployment".into(),
                name: format!("{}/{}", namespace, name),
            })?;
            let spec = deployment.spec.get_or_insert_with(Default::default);
            spec.replicas = Some(replicas);
            let selector = spec.selector.match_labels.clone().unwrap_or_default();

            let now = Instant::now();
            let owned: Vec<Key> = state
                .pods
                .iter()
                .filter(|((ns, _), p)| {
                    ns == namespace
                        && !selector.is_empty()
                        && selector.iter().all(|(lk, lv)| {
                            p.object
                                .metadata
                                .labels
                                .as_ref()
                                .and_then(|l| l.get(lk))
                                == Some(lv)
                        })
                })
                .map(|(k, _)| k.clone())
                .collect();
            let surplus = owned.len().saturating_sub(replicas.max(0) as usize);
            for pk in owned.into_iter().rev().take(surplus) {
                if let Some(p) = state.pods.get_mut(&pk) {
                    p.deleting_since.get_or_insert(now);
                }
            }

            state.journal.push(ClusterCall::ScaleDeployment {
                namespace: namespace.to_string(),
                name: name.to_string(),
                replicas,
            });
            Ok(())
        })
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        self.with_state(|state| Ok(state.storage_classes.get(name).cloned()))
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        self.with_state(|state| Ok(state.volumes.get(name).map(|v| v.object.clone())))
    }

    async fn set_reclaim_policy(&self, name: &str, policy: ReclaimPolicy) -> Result<()> {
        self.with_state(|state| {
            if state.has_fault(&Fault::SetReclaimPolicy(name.to_string())) {
                return Err(injected(&format!("patch PV {}", name)));
            }
            let volume = state.volumes.get_mut(name).ok_or_else(|| Error::ResourceNotFound {
                kind: "PersistentVolume".into(),
                name: name.to_string(),
            })?;
            if let Some(spec) = volume.object.spec.as_mut() {
                spec.persistent_volume_reclaim_policy = Some(policy.to_string());
            }
            state.journal.push(ClusterCall::SetReclaimPolicy {
                volume: name.to_string(),
                policy,
            });
            Ok(())
        })
    }

    async fn release_volume(&self, name: &str) -> Result<()> {
        self.with_state(|state| {
            if state.has_fault(&Fault::ReleaseVolume(name.to_string())) {
                return Err(injected(&format!("patch PV {}", name)));
            }
            let volume = state.volumes.get_mut(name).ok_or_else(|| Error::ResourceNotFound {
                kind: "PersistentVolume".into(),
                name: name.to_string(),
            })?;
            if let Some(spec) = volume.object.spec.as_mut() {
                spec.claim_ref = None;
            }
            volume.object.status = Some(PersistentVolumeStatus {
                phase: Some("Available".to_string()),
                ..Default::default()
            });
            state.journal.push(ClusterCall::ReleaseVolume {
                volume: name.to_string(),
            });
            Ok(())
        })
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// Object builders for seeding the simulated cluster
pub mod fixtures {
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
    use k8s_openapi::api::core::v1::{
        Container, PersistentVolumeClaim, PersistentVolumeClaimSpec,
        PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodTemplateSpec, Volume, VolumeMount,
        VolumeResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    /// An unbound ReadWriteOnce claim
    pub fn claim(namespace: &str, name: &str, size: &str, storage_class: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), name.to_string())])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: Some(storage_class.to_string()),
                volume_mode: Some("Filesystem".to_string()),
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

    fn pod_spec_using(claim: &str) -> PodSpec {
        PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                image: Some("nginx".to_string()),
                volume_mounts: Some(vec![VolumeMount {
                    name: "storage".to_string(),
                    mount_path: "/var/lib/app".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "storage".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.to_string(),
                    read_only: None,
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    /// A bare pod mounting `claim`
    pub fn pod_using(namespace: &str, name: &str, claim: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(pod_spec_using(claim)),
            status: None,
        }
    }

    /// A deployment whose template mounts `claim`, selected by `app=<name>`
    pub fn deployment_using(namespace: &str, name: &str, claim: &str, replicas: i32) -> Deployment {
        let labels = BTreeMap::from([("app".to_string(), name.to_string())]);
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec_using(claim)),
                },
                ..Default::default()
            }),
            status: None,
        }
    }
}
