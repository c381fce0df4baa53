//! Volume Migrator
//!
//! Resizes Kubernetes PersistentVolumeClaims by copying their data onto a
//! freshly provisioned claim, and deletes claims only after every workload
//! using them has been drained. Works with any storage class, including
//! ones that do not support volume expansion, and allows shrinking.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                CLI (clap)          REST API (axum)               │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                       VolumeOrchestrator                         │
//! │        in-flight guard · metrics · progress event channel        │
//! ├────────────────────────────────┬─────────────────────────────────┤
//! │       ResizeController         │      DeletionOrchestrator       │
//! │  validate → pause → provision  │  scale down → drain → delete    │
//! │  → transfer → swap → cleanup   │                                 │
//! ├────────────────────────────────┴─────────────────────────────────┤
//! │  ConsumerTracker · CapacityProber · PauseCoordinator             │
//! │  VolumeProvisioner · DataMigrationWorker · WorkerRunner          │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                     ClusterApi (port)                            │
//! │        KubeCluster (kube-rs)  ·  InMemoryCluster (simulator)     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`engine`]: Resize state machine, deletion, and their components
//! - [`cluster`]: `ClusterApi` adapters for a live cluster and a simulator
//! - [`domain`]: Capacity arithmetic, claim helpers, and the cluster port
//! - [`api`]: REST server
//! - [`config`]: Tunables loaded from YAML
//! - [`metrics`]: Prometheus counters for finished operations
//! - [`error`]: Error types and classification

pub mod api;
pub mod cluster;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig, RestRouter};

pub use cluster::{InMemoryCluster, KubeCluster};

pub use config::{MigrationConfig, TimingConfig, WorkerConfig};

pub use domain::ports::{ClusterApi, ClusterApiRef, DeleteOutcome, ReclaimPolicy};
pub use domain::{format_bytes, parse_quantity, ClaimPhase, VolumeSummary};

pub use engine::{
    DeletionReport, EventSink, FileCopy, MigrationEvent, ResizePhase, ResizeReport,
    TransferStrategy, VolumeOrchestrator,
};

pub use error::{Error, ErrorClass, Result};

pub use metrics::MigrationMetrics;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
