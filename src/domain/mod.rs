//! Domain layer - Core types and the cluster port
//!
//! This module defines the boundary trait adapters implement and the
//! claim/capacity helpers shared by every engine component.

pub mod capacity;
pub mod claim;
pub mod ports;

pub use capacity::*;
pub use claim::*;
pub use ports::*;
