//! Migrator configuration
//!
//! Defaults reproduce the fixed timings of the migration workflow. A YAML
//! file may override any field; CLI flags override the file.

use crate::engine::poll::PollPolicy;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Worker Configuration
// =============================================================================

/// Settings for the ephemeral worker pods
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Shell-capable image used for probe and transfer pods
    pub image: String,
    /// Probe pod name prefix
    pub probe_prefix: String,
    /// Transfer pod name prefix
    pub transfer_prefix: String,
    /// Mount path of the probed claim
    pub probe_mount_path: String,
    /// Mount path of the source claim during transfer
    pub source_mount_path: String,
    /// Mount path of the target claim during transfer
    pub target_mount_path: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            image: "busybox".to_string(),
            probe_prefix: "size-check-".to_string(),
            transfer_prefix: "transfer-pod-".to_string(),
            probe_mount_path: "/data".to_string(),
            source_mount_path: "/source".to_string(),
            target_mount_path: "/target".to_string(),
        }
    }
}

// =============================================================================
// Timing Configuration
// =============================================================================

/// Poll intervals and budgets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimingConfig {
    /// Interval for bind/existence/probe polls
    pub object_poll_interval_secs: u64,
    /// Attempts for bind/existence/probe polls
    pub object_poll_attempts: u32,
    /// Interval between consumer drain checks
    pub drain_poll_interval_secs: u64,
    /// Wall-clock deadline for consumer drain
    pub drain_timeout_secs: u64,
    /// Wait before force-deleting a pod that ignores graceful deletion
    pub pod_delete_grace_secs: u64,
    /// Interval between transfer pod phase checks
    pub transfer_poll_interval_secs: u64,
    /// Optional deadline for the data copy; unbounded when absent
    pub transfer_timeout_secs: Option<u64>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            object_poll_interval_secs: 1,
            object_poll_attempts: 30,
            drain_poll_interval_secs: 2,
            drain_timeout_secs: 300,
            pod_delete_grace_secs: 30,
            transfer_poll_interval_secs: 2,
            transfer_timeout_secs: None,
        }
    }
}

impl TimingConfig {
    /// Policy for short object transitions (bound, gone, probe done)
    pub fn object_poll(&self) -> PollPolicy {
        PollPolicy::attempts(
            Duration::from_secs(self.object_poll_interval_secs),
            self.object_poll_attempts,
        )
    }

    /// Policy for waiting until a claim has no consumers
    pub fn drain_poll(&self) -> PollPolicy {
        PollPolicy::deadline(
            Duration::from_secs(self.drain_poll_interval_secs),
            Duration::from_secs(self.drain_timeout_secs),
        )
    }

    /// Policy for waiting out a graceful pod deletion
    pub fn pod_delete_poll(&self) -> PollPolicy {
        PollPolicy::deadline(
            Duration::from_secs(self.object_poll_interval_secs),
            Duration::from_secs(self.pod_delete_grace_secs),
        )
    }

    /// Policy for the data transfer worker
    pub fn transfer_poll(&self) -> PollPolicy {
        let interval = Duration::from_secs(self.transfer_poll_interval_secs);
        match self.transfer_timeout_secs {
            Some(secs) => PollPolicy::deadline(interval, Duration::from_secs(secs)),
            None => PollPolicy::unbounded(interval),
        }
    }
}

// =============================================================================
// Migration Configuration
// =============================================================================

/// Top-level configuration for the migration engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MigrationConfig {
    /// Suffix appended to the source claim name for the replacement claim
    pub temp_claim_suffix: String,
    /// Worker pod settings
    pub worker: WorkerConfig,
    /// Poll timings
    pub timing: TimingConfig,
    /// Capacity of the progress event channel
    pub event_channel_capacity: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            temp_claim_suffix: "-new".to_string(),
            worker: WorkerConfig::default(),
            timing: TimingConfig::default(),
            event_channel_capacity: 256,
        }
    }
}

impl MigrationConfig {
    /// Load from a YAML file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: MigrationConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make polling loops degenerate
    pub fn validate(&self) -> Result<()> {
        let t = &self.timing;
        if t.object_poll_interval_secs == 0
            || t.drain_poll_interval_secs == 0
            || t.transfer_poll_interval_secs == 0
        {
            return Err(Error::Configuration("poll intervals must be at least 1s".into()));
        }
        if t.object_poll_attempts == 0 {
            return Err(Error::Configuration("objectPollAttempts must be positive".into()));
        }
        if t.drain_timeout_secs == 0 || t.transfer_timeout_secs == Some(0) {
            return Err(Error::Configuration("timeouts must be positive".into()));
        }
        if self.temp_claim_suffix.is_empty() {
            return Err(Error::Configuration("tempClaimSuffix must not be empty".into()));
        }
        if self.worker.image.is_empty() {
            return Err(Error::Configuration("worker image must not be empty".into()));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::Configuration("eventChannelCapacity must be positive".into()));
        }
        Ok(())
    }

    /// Name of the temporary replacement claim for `source`
    pub fn temp_claim_name(&self, source: &str) -> String {
        format!("{}{}", source, self.temp_claim_suffix)
    }

    pub fn probe_pod_name(&self, claim: &str) -> String {
        format!("{}{}", self.worker.probe_prefix, claim)
    }

    pub fn transfer_pod_name(&self, claim: &str) -> String {
        format!("{}{}", self.worker.transfer_prefix, claim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = MigrationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.temp_claim_name("data"), "data-new");
        assert_eq!(config.probe_pod_name("data"), "size-check-data");
        assert_eq!(config.transfer_pod_name("data"), "transfer-pod-data");
        assert_eq!(config.timing.object_poll_attempts, 30);
        assert_eq!(config.timing.drain_timeout_secs, 300);
    }

    #[test]
    fn test_load_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "tempClaimSuffix: -migrated\nworker:\n  image: alpine:3.19\ntiming:\n  transferTimeoutSecs: 3600"
        )
        .unwrap();

        let config = MigrationConfig::from_file(file.path()).unwrap();
        assert_eq!(config.temp_claim_name("data"), "data-migrated");
        assert_eq!(config.worker.image, "alpine:3.19");
        assert_eq!(config.worker.source_mount_path, "/source");
        assert_eq!(config.timing.transfer_timeout_secs, Some(3600));
        assert_eq!(config.timing.object_poll_interval_secs, 1);
    }

    #[test]
    fn test_rejects_zero_interval() {
        let mut config = MigrationConfig::default();
        config.timing.drain_poll_interval_secs = 0;
        assert_matches!(config.validate(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_missing_file() {
        assert_matches!(
            MigrationConfig::from_file("/nonexistent/migrator.yaml"),
            Err(Error::Io(_))
        );
    }
}
