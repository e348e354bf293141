//! Cadence ECS - Entity/component lifecycle runtime
//!
//! Entities are containers of pluggable components. An [`EntityManager`] drives a
//! once-per-frame lifecycle (register, initialize, start, update, clean up) and
//! stays consistent when components create or destroy entities and components
//! in the middle of that same frame, from the driving thread or any other.

mod builder;
mod component;
mod entity;
mod error;
mod manager;
mod message;
mod notify;

pub use builder::EntityBuilder;
pub use component::{Component, ComponentHandle, ComponentState, Context, Hooks};
pub use entity::{Entity, EntityState};
pub use error::EntityError;
pub use manager::{EntityManager, FrameStats, Phase};
pub use message::{Delivery, MessageBus, SubscriptionId};
pub use notify::{NotificationCenter, ObserverId, Posted, Sender};

pub use cadence_core::{ComponentId, EntityId, GameTime};
