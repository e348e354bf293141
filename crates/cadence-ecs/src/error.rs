//! Error types for the entity runtime

use cadence_core::{ComponentId, EntityId};

use crate::manager::Phase;

/// Errors raised by entities, components, and the entity manager
#[derive(Debug, thiserror::Error)]
pub enum EntityError {
    #[error("entity {entity} is already registered with an entity manager")]
    AlreadyRegistered { entity: EntityId },

    #[error("entity {entity} belongs to a different entity manager")]
    ManagerMismatch { entity: EntityId },

    #[error("entity {entity} is not registered with an entity manager")]
    UnregisteredOwner { entity: EntityId },

    #[error("component {component} is not attached to an entity")]
    DetachedComponent { component: ComponentId },

    #[error("component {component} is already registered")]
    ComponentAlreadyRegistered { component: ComponentId },

    #[error("entity {entity} has been disposed")]
    EntityDisposed { entity: EntityId },

    #[error("malformed component {type_name}: it must handle being attached to an entity")]
    MalformedComponent { type_name: &'static str },

    #[error("entity {entity} already has a component of type {type_name}")]
    ComponentExists {
        entity: EntityId,
        type_name: &'static str,
    },

    #[error("component {component} is busy running a callback")]
    ComponentBusy { component: ComponentId },

    #[error("component {component} is not a {expected}")]
    ComponentTypeMismatch {
        component: ComponentId,
        expected: &'static str,
    },

    #[error("illegal re-entrant call to EntityManager::update")]
    ReentrantUpdate,

    #[error("{component} failed during {phase}")]
    Hook {
        component: &'static str,
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },
}

impl EntityError {
    /// True for misuse of the registration protocol, as opposed to failures
    /// raised by component code.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(
            self,
            EntityError::Hook { .. }
                | EntityError::ComponentBusy { .. }
                | EntityError::ComponentTypeMismatch { .. }
        )
    }
}
