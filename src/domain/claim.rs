//! Volume claim views
//!
//! Read helpers over `k8s_openapi` claims, pods and deployments, plus the
//! list view returned to operators.

use crate::domain::capacity::parse_quantity;
use crate::error::Result;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, PodSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Claim Phase
// =============================================================================

/// Lifecycle phase of a claim, as reported by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimPhase {
    Pending,
    Bound,
    Lost,
}

impl ClaimPhase {
    fn from_status(phase: Option<&str>) -> Self {
        match phase {
            Some("Bound") => ClaimPhase::Bound,
            Some("Lost") => ClaimPhase::Lost,
            _ => ClaimPhase::Pending,
        }
    }
}

impl std::fmt::Display for ClaimPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimPhase::Pending => f.pad("Pending"),
            ClaimPhase::Bound => f.pad("Bound"),
            ClaimPhase::Lost => f.pad("Lost"),
        }
    }
}

/// Current phase of a claim
pub fn claim_phase(claim: &PersistentVolumeClaim) -> ClaimPhase {
    ClaimPhase::from_status(claim.status.as_ref().and_then(|s| s.phase.as_deref()))
}

/// Requested storage as the raw quantity string
pub fn requested_storage(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .map(|q| q.0.as_str())
}

/// Requested storage in bytes; a claim without a request counts as zero
pub fn requested_bytes(claim: &PersistentVolumeClaim) -> Result<u64> {
    match requested_storage(claim) {
        Some(q) => parse_quantity(q),
        None => Ok(0),
    }
}

pub fn storage_class_name(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim.spec.as_ref()?.storage_class_name.as_deref()
}

pub fn access_modes(claim: &PersistentVolumeClaim) -> Vec<String> {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.access_modes.clone())
        .unwrap_or_default()
}

/// Name of the PersistentVolume a bound claim points at
pub fn bound_volume_name(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim.spec.as_ref()?.volume_name.as_deref()
}

// =============================================================================
// Claim References
// =============================================================================

/// Name of the first pod volume that mounts the claim, if any
pub fn claim_volume_in(spec: &PodSpec, claim_name: &str) -> Option<String> {
    spec.volumes.as_ref()?.iter().find_map(|volume| {
        volume
            .persistent_volume_claim
            .as_ref()
            .filter(|src| src.claim_name == claim_name)
            .map(|_| volume.name.clone())
    })
}

/// Name of the pod volume that mounts the claim, if the pod uses it
pub fn pod_mounts_claim(pod: &Pod, claim_name: &str) -> Option<String> {
    pod.spec.as_ref().and_then(|spec| claim_volume_in(spec, claim_name))
}

// =============================================================================
// Volume Summary
// =============================================================================

/// List view of a claim
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSummary {
    pub namespace: String,
    pub name: String,
    pub size: String,
    pub phase: ClaimPhase,
    pub storage_class: String,
    pub access_modes: Vec<String>,
    pub volume_mode: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl From<&PersistentVolumeClaim> for VolumeSummary {
    fn from(claim: &PersistentVolumeClaim) -> Self {
        Self {
            namespace: claim.metadata.namespace.clone().unwrap_or_default(),
            name: claim.metadata.name.clone().unwrap_or_default(),
            size: requested_storage(claim).unwrap_or("0").to_string(),
            phase: claim_phase(claim),
            storage_class: storage_class_name(claim).unwrap_or_default().to_string(),
            access_modes: access_modes(claim),
            volume_mode: claim.spec.as_ref().and_then(|s| s.volume_mode.clone()),
            labels: claim.metadata.labels.clone().unwrap_or_default(),
            annotations: claim.metadata.annotations.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for VolumeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ({})", self.namespace, self.name, self.size)
    }
}
