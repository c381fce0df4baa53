//! Migration Events
//!
//! Progress events emitted while a resize or deletion runs. They are
//! broadcast to any subscriber (the CLI prints them) and mirrored to the
//! tracing log. Nobody has to listen: sends without receivers are dropped.

use crate::domain::capacity::format_bytes;
use crate::domain::claim::ClaimPhase;
use crate::engine::resize::ResizePhase;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Events emitted by the migration engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MigrationEvent {
    /// A resize request was accepted
    ResizeStarted {
        namespace: String,
        claim: String,
        current_size: String,
        target_size: String,
    },

    /// The resize state machine advanced
    PhaseChanged { claim: String, phase: ResizePhase },

    /// The capacity probe measured the claim
    DataSizeMeasured { claim: String, used_bytes: u64 },

    /// Pods currently mounting the claim
    ConsumersFound { claim: String, pods: Vec<String> },

    /// A consumer pod is being stopped
    PodStopping { pod: String },

    /// A pod ignored graceful deletion and was force-deleted
    PodForceDeleted { pod: String },

    /// No pod mounts the claim anymore
    ConsumersDrained { claim: String },

    /// A deployment was scaled down
    DeploymentScaled {
        deployment: String,
        from_replicas: i32,
        to_replicas: i32,
    },

    /// A claim object was created
    ClaimCreated { claim: String, size: String },

    /// A claim was observed in a non-final phase while waiting
    ClaimWaiting { claim: String, phase: ClaimPhase },

    /// A claim reached Bound
    ClaimBound { claim: String },

    /// A delete was issued for a claim
    ClaimDeleting { claim: String },

    /// A claim is gone from the cluster
    ClaimGone { claim: String },

    /// Worker pod launched
    WorkerStarted { pod: String, role: String },

    /// Worker pod finished successfully
    WorkerSucceeded { pod: String, role: String },

    /// A non-fatal problem
    Warning { message: String },

    /// Resize finished
    ResizeCompleted {
        claim: String,
        size: String,
        warnings: usize,
    },

    /// Resize aborted
    ResizeFailed {
        claim: String,
        phase: ResizePhase,
        error: String,
    },

    /// A deletion request was accepted
    DeletionStarted { namespace: String, claim: String },

    /// Deletion finished
    DeletionCompleted { claim: String, already_absent: bool },

    /// Deletion aborted
    DeletionFailed { claim: String, error: String },
}

impl MigrationEvent {
    /// Whether this event reports a problem
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            MigrationEvent::Warning { .. }
                | MigrationEvent::ResizeFailed { .. }
                | MigrationEvent::DeletionFailed { .. }
        )
    }

    /// Claim this event concerns, if any
    pub fn claim(&self) -> Option<&str> {
        match self {
            MigrationEvent::ResizeStarted { claim, .. }
            | MigrationEvent::PhaseChanged { claim, .. }
            | MigrationEvent::DataSizeMeasured { claim, .. }
            | MigrationEvent::ConsumersFound { claim, .. }
            | MigrationEvent::ConsumersDrained { claim }
            | MigrationEvent::ClaimCreated { claim, .. }
            | MigrationEvent::ClaimWaiting { claim, .. }
            | MigrationEvent::ClaimBound { claim }
            | MigrationEvent::ClaimDeleting { claim }
            | MigrationEvent::ClaimGone { claim }
            | MigrationEvent::ResizeCompleted { claim, .. }
            | MigrationEvent::ResizeFailed { claim, .. }
            | MigrationEvent::DeletionStarted { claim, .. }
            | MigrationEvent::DeletionCompleted { claim, .. }
            | MigrationEvent::DeletionFailed { claim, .. } => Some(claim),
            _ => None,
        }
    }
}

impl std::fmt::Display for MigrationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationEvent::ResizeStarted {
                namespace,
                claim,
                current_size,
                target_size,
            } => write!(
                f,
                "Resizing PVC {}/{}: current size {}, target size {}",
                namespace, claim, current_size, target_size
            ),
            MigrationEvent::PhaseChanged { phase, .. } => write!(f, "-> {}", phase),
            MigrationEvent::DataSizeMeasured { used_bytes, .. } => write!(
                f,
                "Safe to shrink - current data size: {} bytes ({})",
                used_bytes,
                format_bytes(*used_bytes)
            ),
            MigrationEvent::ConsumersFound { pods, .. } => {
                write!(f, "Found {} pods using the PVC", pods.len())
            }
            MigrationEvent::PodStopping { pod } => write!(f, "    └─ Stopping pod: {}", pod),
            MigrationEvent::PodForceDeleted { pod } => {
                write!(f, "    └─ Pod {} did not stop in time, force deleted", pod)
            }
            MigrationEvent::ConsumersDrained { .. } => write!(f, "All pods terminated"),
            MigrationEvent::DeploymentScaled {
                deployment,
                from_replicas,
                to_replicas,
            } => write!(
                f,
                "Scaled deployment {} from {} to {} replicas",
                deployment, from_replicas, to_replicas
            ),
            MigrationEvent::ClaimCreated { claim, size } => {
                write!(f, "Created PVC {} ({})", claim, size)
            }
            MigrationEvent::ClaimWaiting { phase, .. } => write!(f, "    └─ Status: {}", phase),
            MigrationEvent::ClaimBound { claim } => write!(f, "PVC {} bound", claim),
            MigrationEvent::ClaimDeleting { claim } => write!(f, "Deleting PVC {}", claim),
            MigrationEvent::ClaimGone { claim } => write!(f, "PVC {} deleted", claim),
            MigrationEvent::WorkerStarted { pod, role } => {
                write!(f, "Started {} pod {}", role, pod)
            }
            MigrationEvent::WorkerSucceeded { pod, role } => {
                write!(f, "{} pod {} completed", role, pod)
            }
            MigrationEvent::Warning { message } => write!(f, "Warning: {}", message),
            MigrationEvent::ResizeCompleted {
                claim,
                size,
                warnings,
            } => {
                if *warnings == 0 {
                    write!(f, "Resized PVC {} to {}", claim, size)
                } else {
                    write!(f, "Resized PVC {} to {} with {} warnings", claim, size, warnings)
                }
            }
            MigrationEvent::ResizeFailed {
                claim,
                phase,
                error,
            } => write!(f, "Resize of {} failed during {}: {}", claim, phase, error),
            MigrationEvent::DeletionStarted { namespace, claim } => {
                write!(f, "Deleting volume {}/{}", namespace, claim)
            }
            MigrationEvent::DeletionCompleted {
                claim,
                already_absent,
            } => {
                if *already_absent {
                    write!(f, "PVC {} does not exist, nothing to delete", claim)
                } else {
                    write!(f, "Successfully deleted volume {}", claim)
                }
            }
            MigrationEvent::DeletionFailed { claim, error } => {
                write!(f, "Failed to delete volume {}: {}", claim, error)
            }
        }
    }
}

// =============================================================================
// Event Sink
// =============================================================================

/// Broadcasts events and mirrors them to the log
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<MigrationEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<MigrationEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: MigrationEvent) {
        if event.is_error() {
            warn!(event = ?event, "{}", event);
        } else {
            info!("{}", event);
        }
        let _ = self.tx.send(event);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(MigrationEvent::Warning {
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_display() {
        let started = MigrationEvent::ResizeStarted {
            namespace: "ns".into(),
            claim: "data".into(),
            current_size: "5Gi".into(),
            target_size: "10Gi".into(),
        };
        assert_eq!(
            started.to_string(),
            "Resizing PVC ns/data: current size 5Gi, target size 10Gi"
        );
        assert_eq!(started.claim(), Some("data"));
        assert!(!started.is_error());

        let measured = MigrationEvent::DataSizeMeasured {
            claim: "data".into(),
            used_bytes: 2048,
        };
        assert!(measured.to_string().ends_with("2048 bytes (2Ki)"));

        let warning = MigrationEvent::Warning {
            message: "failed to delete transfer pod".into(),
        };
        assert!(warning.is_error());
        assert_eq!(warning.claim(), None);
    }

    #[tokio::test]
    async fn test_sink_broadcasts() {
        let sink = EventSink::new(8);
        let mut rx = sink.subscribe();

        sink.emit(MigrationEvent::ClaimBound {
            claim: "data-new".into(),
        });
        sink.warn("temporary PVC still terminating");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.to_string(), "PVC data-new bound");
        let second = rx.recv().await.unwrap();
        assert!(second.is_error());
    }

    #[test]
    fn test_emit_without_subscribers() {
        let sink = EventSink::new(1);
        sink.emit(MigrationEvent::ConsumersDrained {
            claim: "data".into(),
        });
    }
}
