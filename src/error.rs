//! Error types for the Volume Migrator
//!
//! Provides structured error types for every migration component. Each
//! variant belongs to one [`ErrorClass`], which decides how the operator
//! surfaces it and whether re-invoking the request can succeed.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the migrator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error during {step}: {source}")]
    ControlPlane {
        step: String,
        #[source]
        source: kube::Error,
    },

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    // =========================================================================
    // Input / Precondition Errors
    // =========================================================================
    #[error("Invalid size format: {0}")]
    CapacityParse(String),

    #[error(
        "cannot shrink volume: current data size ({used_bytes} bytes) is larger than requested size ({requested_bytes} bytes)"
    )]
    ShrinkBelowUsage { used_bytes: u64, requested_bytes: u64 },

    #[error("PVC {claim} has no storage class specified")]
    MissingStorageClass { claim: String },

    #[error("storage class {class} has no provisioner")]
    MissingProvisioner { class: String },

    #[error("Migration already in progress for volume {volume_name}")]
    MigrationInProgress { volume_name: String },

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    #[error("timeout waiting for {operation} after {}s", .waited.as_secs())]
    Timeout { operation: String, waited: Duration },

    // =========================================================================
    // Worker Errors
    // =========================================================================
    #[error("{worker} failed: {logs}")]
    WorkerFailed { worker: String, logs: String },

    #[error("failed to parse probe output {output:?}: not a byte count")]
    ProbeOutput { output: String },

    // =========================================================================
    // Finalize Errors
    // =========================================================================
    #[error(
        "resize of {claim} stopped during {phase}: {reason}; the migrated data is held by claim {temp_claim} and must be recovered manually"
    )]
    FinalizeIncomplete {
        claim: String,
        temp_claim: String,
        phase: String,
        reason: String,
    },

    // =========================================================================
    // Config File Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broad category an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed request or missing object; nothing was mutated
    Input,
    /// A safety check refused the operation before any destructive step
    Precondition,
    /// A fixed polling budget was exhausted
    Timeout,
    /// An API call or worker pod failed
    ControlPlane,
    /// Failed after the source claim was deleted; cannot be rolled back
    Incomplete,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Input => write!(f, "input"),
            ErrorClass::Precondition => write!(f, "precondition"),
            ErrorClass::Timeout => write!(f, "timeout"),
            ErrorClass::ControlPlane => write!(f, "control_plane"),
            ErrorClass::Incomplete => write!(f, "incomplete"),
        }
    }
}

impl Error {
    /// Wrap a kube error with the step that issued the call
    pub fn control_plane(step: impl Into<String>, source: kube::Error) -> Self {
        Error::ControlPlane {
            step: step.into(),
            source,
        }
    }

    /// Build a timeout error
    pub fn timeout(operation: impl Into<String>, waited: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            waited,
        }
    }

    /// Determine the class of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::CapacityParse(_)
            | Error::ResourceNotFound { .. }
            | Error::Configuration(_) => ErrorClass::Input,

            Error::ShrinkBelowUsage { .. }
            | Error::MissingStorageClass { .. }
            | Error::MissingProvisioner { .. }
            | Error::MigrationInProgress { .. } => ErrorClass::Precondition,

            Error::Timeout { .. } => ErrorClass::Timeout,

            Error::FinalizeIncomplete { .. } => ErrorClass::Incomplete,

            _ => ErrorClass::ControlPlane,
        }
    }

    /// Check whether re-invoking the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self.class() {
            ErrorClass::Timeout | ErrorClass::ControlPlane => true,
            ErrorClass::Precondition => matches!(self, Error::MigrationInProgress { .. }),
            ErrorClass::Input | ErrorClass::Incomplete => false,
        }
    }

    /// Check whether the error came back as an HTTP 404 from the API server
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::ControlPlane {
                source: kube::Error::Api(ae),
                ..
            } => ae.code == 404,
            _ => false,
        }
    }
}

/// Result type alias for the migrator
pub type Result<T> = std::result::Result<T, Error>;
