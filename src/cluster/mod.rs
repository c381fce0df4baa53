//! Cluster adapters
//!
//! Implementations of the [`ClusterApi`](crate::domain::ports::ClusterApi)
//! port: the kube-rs client for real clusters and an in-memory simulator.

pub mod kubernetes;
pub mod memory;

pub use kubernetes::KubeCluster;
pub use memory::{ClusterCall, Fault, InMemoryCluster, SimTiming};
