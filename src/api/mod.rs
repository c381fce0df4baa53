//! API Module
//!
//! REST surface over the [`VolumeOrchestrator`](crate::engine::VolumeOrchestrator):
//! volume listing, resize, delete, health and Prometheus metrics.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
