//! Cadence Core - Shared types for the Cadence entity runtime
//!
//! This crate provides the foundational types used by the other crates:
//! - Mathematical primitives (re-exported from glam)
//! - Identity types for entities and components
//! - Transform value used by the scene hierarchy
//! - Frame time tracking handed to the per-frame driving call

pub mod time;
pub mod types;

pub use glam::{Mat4, Quat, Vec3};
pub use time::{GameTime, TimeConfig, TimeError};
pub use types::{ComponentId, EntityId, Transform};
