//! Batch construction of entities

use tracing::debug;

use crate::entity::Entity;
use crate::error::EntityError;
use crate::manager::EntityManager;

/// Builds entities off to the side and registers them as one batch, so none
/// of them is started before all of them are registered.
pub struct EntityBuilder {
    manager: EntityManager,
    pending: Vec<Entity>,
}

impl EntityBuilder {
    pub fn new(manager: &EntityManager) -> Self {
        Self {
            manager: manager.clone(),
            pending: Vec::new(),
        }
    }

    pub fn manager(&self) -> &EntityManager {
        &self.manager
    }

    /// Create an entity for the next batch
    pub fn create_entity(&mut self, name: Option<&str>) -> Entity {
        let entity = match name {
            Some(name) => Entity::named(name),
            None => Entity::new(),
        };
        self.pending.push(entity.clone());
        entity
    }

    /// Create an entity for the next batch and attach its components.
    ///
    /// If `attach` fails the entity is discarded along with whatever it had
    /// attached so far.
    pub fn create_entity_with<F>(&mut self, name: Option<&str>, attach: F) -> Result<Entity, EntityError>
    where
        F: FnOnce(&Entity) -> Result<(), EntityError>,
    {
        let entity = match name {
            Some(name) => Entity::named(name),
            None => Entity::new(),
        };
        if let Err(err) = attach(&entity) {
            entity.dispose_detached()?;
            return Err(err);
        }
        self.pending.push(entity.clone());
        Ok(entity)
    }

    /// Entities waiting for the next batch registration
    pub fn pending(&self) -> &[Entity] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Register every pending entity with the manager. On failure nothing is
    /// registered and the batch stays pending.
    pub fn register_entities(&mut self) -> Result<Vec<Entity>, EntityError> {
        let batch = std::mem::take(&mut self.pending);
        if let Err(err) = self.manager.register_entities(&batch) {
            self.pending = batch;
            return Err(err);
        }
        debug!("Registered a batch of {} entities", batch.len());
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, Context, Hooks};
    use cadence_core::GameTime;
    use std::sync::Arc;
    use parking_lot::Mutex;

    /// Records how many live entities the manager had when it started.
    struct Census {
        seen: Arc<Mutex<Vec<usize>>>,
    }

    impl Component for Census {
        fn start(&mut self, ctx: &Context<'_>) -> anyhow::Result<()> {
            self.seen.lock().push(ctx.manager().entity_count());
            Ok(())
        }
    }

    struct Loose;

    impl Component for Loose {
        fn hooks(&self) -> Hooks {
            Hooks::UPDATE
        }
    }

    #[test]
    fn whole_batch_is_live_before_anything_starts() {
        let manager = EntityManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut builder = EntityBuilder::new(&manager);

        for i in 0..3 {
            let seen = seen.clone();
            builder
                .create_entity_with(Some(format!("unit-{}", i).as_str()), |entity| {
                    entity.add_component(Census { seen })?;
                    Ok(())
                })
                .unwrap();
        }
        builder.create_entity(Some("marker"));
        assert_eq!(builder.len(), 4);

        let batch = builder.register_entities().unwrap();
        assert_eq!(batch.len(), 4);
        assert!(builder.is_empty());

        manager.update(&GameTime::from_delta(0.016)).unwrap();
        assert_eq!(*seen.lock(), vec![4, 4, 4]);
        assert!(manager.find("marker").is_some());
    }

    #[test]
    fn failed_attach_discards_the_entity() {
        let manager = EntityManager::new();
        let mut builder = EntityBuilder::new(&manager);

        let err = builder
            .create_entity_with(None, |entity| {
                entity.add_component(Loose)?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, EntityError::MalformedComponent { .. }));
        assert!(builder.is_empty());
    }

    #[test]
    fn failed_batch_stays_pending() {
        let manager = EntityManager::new();
        let mut builder = EntityBuilder::new(&manager);
        let taken = builder.create_entity(Some("taken"));
        builder.create_entity(None);
        manager.register_entity(&taken).unwrap();

        assert!(builder.register_entities().is_err());
        assert_eq!(builder.len(), 2);
    }
}
