//! Migration engine
//!
//! Components that observe and mutate the cluster through the
//! [`ClusterApi`](crate::domain::ports::ClusterApi) port, the resize state
//! machine built from them, and the orchestrator in front of both operations.

pub mod cleanup;
pub mod consumers;
pub mod delete;
pub mod events;
pub mod orchestrator;
pub mod pause;
pub mod poll;
pub mod probe;
pub mod provision;
pub mod resize;
pub mod transfer;
pub mod worker;

pub use delete::{DeletionOrchestrator, DeletionPlan, DeletionReport, ScaledDeployment};
pub use events::{EventSink, MigrationEvent};
pub use orchestrator::VolumeOrchestrator;
pub use poll::{PollLimit, PollOutcome, PollPolicy};
pub use resize::{ResizeController, ResizePhase, ResizeReport};
pub use transfer::{DataMigrationWorker, MigrationJob};
pub use worker::{FileCopy, TransferStrategy, WorkerPhase};
