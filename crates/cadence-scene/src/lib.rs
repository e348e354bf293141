//! Cadence Scene - Transform hierarchy
//!
//! Nodes live in an arena and refer to each other through generational
//! [`NodeId`] handles, so a removed node can never be reached through a stale
//! handle and reparenting is a plain relink of two slots.

mod hierarchy;
mod transform;

pub use hierarchy::{Hierarchy, HierarchyError, NodeId, SharedHierarchy};
pub use transform::TransformComponent;
