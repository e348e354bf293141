//! Parent/child transform hierarchy stored in a generational arena

use std::fmt;
use std::sync::Arc;

use cadence_core::{EntityId, Transform};
use glam::{Mat4, Vec3};
use parking_lot::Mutex;
use tracing::trace;

/// A hierarchy shared between the transform components of many entities
pub type SharedHierarchy = Arc<Mutex<Hierarchy>>;

/// A generational node handle. Removing a node bumps the slot's generation,
/// so old handles are rejected rather than aliasing a new node.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    /// The slot index of this node.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The generation of this node (incremented on reuse).
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Errors raised by hierarchy operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HierarchyError {
    #[error("node {0} does not exist")]
    StaleNode(NodeId),

    #[error("making {parent} the parent of {child} would create a cycle")]
    Cycle { child: NodeId, parent: NodeId },

    #[error("transform component is not attached to an entity")]
    Unattached,
}

#[derive(Debug, Clone)]
struct Node {
    local: Transform,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    entity: Option<EntityId>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Arena of transform nodes with parent/child links
#[derive(Debug, Default)]
pub struct Hierarchy {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    len: usize,
}

impl Hierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a new hierarchy for sharing between components
    pub fn shared() -> SharedHierarchy {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Insert a root node, reusing a freed slot if available.
    pub fn insert(&mut self, local: Transform) -> NodeId {
        let node = Node {
            local,
            parent: None,
            children: Vec::new(),
            entity: None,
        };
        self.len += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            NodeId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            NodeId {
                index,
                generation: 0,
            }
        }
    }

    /// Insert a node under `parent`
    pub fn insert_child(&mut self, parent: NodeId, local: Transform) -> Result<NodeId, HierarchyError> {
        self.node(parent)?;
        let child = self.insert(local);
        self.link(child, parent);
        Ok(child)
    }

    fn node(&self, id: NodeId) -> Result<&Node, HierarchyError> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
            .ok_or(HierarchyError::StaleNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, HierarchyError> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
            .ok_or(HierarchyError::StaleNode(id))
    }

    /// Check if a handle refers to a live node.
    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_ok()
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn local(&self, id: NodeId) -> Result<Transform, HierarchyError> {
        Ok(self.node(id)?.local)
    }

    pub fn local_mut(&mut self, id: NodeId) -> Result<&mut Transform, HierarchyError> {
        Ok(&mut self.node_mut(id)?.local)
    }

    pub fn set_local(&mut self, id: NodeId, local: Transform) -> Result<(), HierarchyError> {
        self.node_mut(id)?.local = local;
        Ok(())
    }

    pub fn parent(&self, id: NodeId) -> Result<Option<NodeId>, HierarchyError> {
        Ok(self.node(id)?.parent)
    }

    /// Children in insertion order
    pub fn children(&self, id: NodeId) -> Result<&[NodeId], HierarchyError> {
        Ok(&self.node(id)?.children)
    }

    /// The entity bound to a node, if any
    pub fn entity(&self, id: NodeId) -> Result<Option<EntityId>, HierarchyError> {
        Ok(self.node(id)?.entity)
    }

    pub fn bind_entity(&mut self, id: NodeId, entity: Option<EntityId>) -> Result<(), HierarchyError> {
        self.node_mut(id)?.entity = entity;
        Ok(())
    }

    /// Every node without a parent
    pub fn roots(&self) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, node)| node.parent.is_none())
            .map(|(id, _)| id)
            .collect()
    }

    fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.node.as_ref().map(|node| {
                (
                    NodeId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    node,
                )
            })
        })
    }

    /// True if `ancestor` is `node` or lies on its path to the root
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> Result<bool, HierarchyError> {
        self.node(ancestor)?;
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return Ok(true);
            }
            current = self.node(id)?.parent;
        }
        Ok(false)
    }

    /// Depth-first list of every node below `id`
    pub fn descendants(&self, id: NodeId) -> Result<Vec<NodeId>, HierarchyError> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.node(id)?.children.iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.node(next)?.children.iter().rev().copied());
        }
        Ok(out)
    }

    fn link(&mut self, child: NodeId, parent: NodeId) {
        if let Ok(node) = self.node_mut(parent) {
            node.children.push(child);
        }
        if let Ok(node) = self.node_mut(child) {
            node.parent = Some(parent);
        }
    }

    fn unlink(&mut self, child: NodeId) {
        let parent = match self.node_mut(child) {
            Ok(node) => node.parent.take(),
            Err(_) => None,
        };
        if let Some(parent) = parent {
            if let Ok(node) = self.node_mut(parent) {
                node.children.retain(|c| *c != child);
            }
        }
    }

    /// Move `child` under `new_parent`, or make it a root with `None`.
    ///
    /// Both handles are validated and cycles rejected before any link changes,
    /// so a failed call leaves the hierarchy untouched.
    pub fn reparent(&mut self, child: NodeId, new_parent: Option<NodeId>) -> Result<(), HierarchyError> {
        self.node(child)?;
        if let Some(parent) = new_parent {
            if self.is_ancestor(child, parent)? {
                return Err(HierarchyError::Cycle { child, parent });
            }
        }

        self.unlink(child);
        if let Some(parent) = new_parent {
            self.link(child, parent);
        }
        trace!("Reparented node {} under {:?}", child, new_parent);
        Ok(())
    }

    /// Remove a node. Its children become roots and keep their local transforms.
    pub fn remove(&mut self, id: NodeId) -> Result<Transform, HierarchyError> {
        self.node(id)?;
        self.unlink(id);

        let slot = &mut self.slots[id.index as usize];
        let node = slot.node.take().ok_or(HierarchyError::StaleNode(id))?;
        slot.generation += 1;
        self.free_list.push(id.index);
        self.len -= 1;

        for child in &node.children {
            if let Ok(child) = self.node_mut(*child) {
                child.parent = None;
            }
        }
        Ok(node.local)
    }

    /// Compose local matrices from the root down to `id`
    pub fn world_matrix(&self, id: NodeId) -> Result<Mat4, HierarchyError> {
        let mut matrix = Mat4::IDENTITY;
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = self.node(node_id)?;
            matrix = node.local.matrix() * matrix;
            current = node.parent;
        }
        Ok(matrix)
    }

    pub fn world_position(&self, id: NodeId) -> Result<Vec3, HierarchyError> {
        Ok(self.world_matrix(id)?.transform_point3(Vec3::ZERO))
    }
}
