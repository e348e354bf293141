//! Binds an entity to a node of a shared hierarchy

use cadence_core::Transform;
use cadence_ecs::{Component, Entity, Hooks};
use glam::{Mat4, Quat, Vec3};
use tracing::trace;

use crate::hierarchy::{HierarchyError, NodeId, SharedHierarchy};

/// Gives its entity a place in a [`Hierarchy`](crate::Hierarchy).
///
/// The node is created when the component is attached and removed when the
/// component is destroyed; children of the node are re-rooted at that point.
pub struct TransformComponent {
    hierarchy: SharedHierarchy,
    initial: Transform,
    node: Option<NodeId>,
}

impl TransformComponent {
    pub fn new(hierarchy: &SharedHierarchy, local: Transform) -> Self {
        Self {
            hierarchy: hierarchy.clone(),
            initial: local,
            node: None,
        }
    }

    /// The node owned by this component, once attached
    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    /// The node of the transform component attached to `entity`, if any
    pub fn node_of(entity: &Entity) -> Option<NodeId> {
        entity
            .get_component::<TransformComponent>()?
            .read::<TransformComponent, _>(|t| t.node)
            .ok()
            .flatten()
    }

    fn attached(&self) -> Result<NodeId, HierarchyError> {
        self.node.ok_or(HierarchyError::Unattached)
    }

    pub fn local(&self) -> Result<Transform, HierarchyError> {
        self.hierarchy.lock().local(self.attached()?)
    }

    pub fn set_local(&self, local: Transform) -> Result<(), HierarchyError> {
        self.hierarchy.lock().set_local(self.attached()?, local)
    }

    pub fn translate(&self, offset: Vec3) -> Result<(), HierarchyError> {
        let node = self.attached()?;
        self.hierarchy.lock().local_mut(node)?.translate(offset);
        Ok(())
    }

    pub fn rotate(&self, rotation: Quat) -> Result<(), HierarchyError> {
        let node = self.attached()?;
        self.hierarchy.lock().local_mut(node)?.rotate(rotation);
        Ok(())
    }

    /// Move under another node, or to the root with `None`
    pub fn set_parent(&self, parent: Option<NodeId>) -> Result<(), HierarchyError> {
        self.hierarchy.lock().reparent(self.attached()?, parent)
    }

    pub fn parent(&self) -> Result<Option<NodeId>, HierarchyError> {
        self.hierarchy.lock().parent(self.attached()?)
    }

    pub fn world_matrix(&self) -> Result<Mat4, HierarchyError> {
        self.hierarchy.lock().world_matrix(self.attached()?)
    }

    pub fn world_position(&self) -> Result<Vec3, HierarchyError> {
        self.hierarchy.lock().world_position(self.attached()?)
    }
}

impl Component for TransformComponent {
    fn hooks(&self) -> Hooks {
        Hooks::ATTACHED | Hooks::DISPOSE
    }

    fn on_attached(&mut self, entity: &Entity) {
        let mut hierarchy = self.hierarchy.lock();
        let node = hierarchy.insert(self.initial);
        // A freshly inserted node always accepts a binding.
        let _ = hierarchy.bind_entity(node, Some(entity.id()));
        trace!("Node {} created for {}", node, entity);
        self.node = Some(node);
    }

    fn on_dispose(&mut self) {
        if let Some(node) = self.node.take() {
            if let Ok(local) = self.hierarchy.lock().remove(node) {
                self.initial = local;
            }
            trace!("Node {} removed", node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Hierarchy;
    use cadence_core::GameTime;
    use cadence_ecs::EntityManager;

    #[test]
    fn node_follows_component_lifetime() {
        let hierarchy = Hierarchy::shared();
        let manager = EntityManager::new();
        let entity = manager.create_entity(Some("ship")).unwrap();
        entity
            .add_component(TransformComponent::new(
                &hierarchy,
                Transform::from_position(Vec3::Y),
            ))
            .unwrap();

        let node = TransformComponent::node_of(&entity).unwrap();
        assert_eq!(hierarchy.lock().entity(node).unwrap(), Some(entity.id()));
        assert_eq!(hierarchy.lock().len(), 1);

        manager.update(&GameTime::from_delta(0.016)).unwrap();
        manager.destroy_entity(&entity).unwrap();
        assert!(hierarchy.lock().is_empty());
        assert!(!hierarchy.lock().contains(node));
    }

    #[test]
    fn children_follow_parent_entities() {
        let hierarchy = Hierarchy::shared();
        let parent = Entity::named("parent");
        let child = Entity::named("child");
        let parent_transform = parent
            .add_component(TransformComponent::new(
                &hierarchy,
                Transform::from_position(Vec3::new(3.0, 0.0, 0.0)),
            ))
            .unwrap();
        let child_transform = child
            .add_component(TransformComponent::new(
                &hierarchy,
                Transform::from_position(Vec3::new(0.0, 1.0, 0.0)),
            ))
            .unwrap();

        let parent_node = TransformComponent::node_of(&parent);
        child_transform
            .with::<TransformComponent, _>(|t| t.set_parent(parent_node))
            .unwrap()
            .unwrap();
        parent_transform
            .with::<TransformComponent, _>(|t| t.translate(Vec3::X))
            .unwrap()
            .unwrap();

        let world = child_transform
            .read::<TransformComponent, _>(|t| t.world_position())
            .unwrap()
            .unwrap();
        assert!((world - Vec3::new(4.0, 1.0, 0.0)).length() < 1e-5);

        // Destroying the parent re-roots the child in place.
        parent.dispose_detached().unwrap();
        let local = child_transform
            .read::<TransformComponent, _>(|t| (t.parent(), t.world_position()))
            .unwrap();
        assert_eq!(local.0, Ok(None));
        assert!((local.1.unwrap() - Vec3::Y).length() < 1e-5);
    }

    #[test]
    fn unattached_component_reports_error() {
        let hierarchy = Hierarchy::shared();
        let component = TransformComponent::new(&hierarchy, Transform::IDENTITY);
        assert_eq!(component.world_matrix(), Err(HierarchyError::Unattached));
        assert!(component.node().is_none());
    }
}
