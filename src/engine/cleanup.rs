//! Best-effort cleanup of temporary objects
//!
//! Cleanup runs on failure paths, so its own failures must never replace the
//! primary error. Each failed removal becomes a warning that is logged,
//! broadcast, and handed back to the caller.

use crate::domain::ports::ClusterApi;
use crate::engine::events::EventSink;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A temporary object created during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TempObject {
    Claim(String),
    Pod(String),
}

impl std::fmt::Display for TempObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TempObject::Claim(name) => write!(f, "PVC {}", name),
            TempObject::Pod(name) => write!(f, "pod {}", name),
        }
    }
}

/// Collects secondary failures while removing temporary objects
pub struct Cleanup<'a> {
    cluster: &'a dyn ClusterApi,
    namespace: &'a str,
    events: &'a EventSink,
    warnings: Vec<String>,
}

impl<'a> Cleanup<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, namespace: &'a str, events: &'a EventSink) -> Self {
        Self {
            cluster,
            namespace,
            events,
            warnings: Vec::new(),
        }
    }

    /// Delete one object; absent objects count as removed
    pub async fn remove(&mut self, object: &TempObject) {
        let result = match object {
            TempObject::Claim(name) => self.cluster.delete_claim(self.namespace, name).await,
            TempObject::Pod(name) => self.cluster.delete_pod(self.namespace, name, None).await,
        };
        match result {
            Ok(outcome) => debug!(object = %object, ?outcome, "cleanup removed object"),
            Err(e) => self.record(format!("failed to cleanup {}: {}", object, e)),
        }
    }

    /// Delete objects in reverse creation order
    pub async fn remove_all(&mut self, objects: &[TempObject]) {
        for object in objects.iter().rev() {
            self.remove(object).await;
        }
    }

    /// Record a warning produced outside `remove`
    pub fn record(&mut self, message: String) {
        self.events.warn(message.clone());
        self.warnings.push(message);
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn into_warnings(self) -> Vec<String> {
        self.warnings
    }
}
