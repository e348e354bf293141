//! Entities: named containers of components with an aggregated update hook

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use cadence_core::{EntityId, GameTime};
use parking_lot::Mutex;
use tracing::debug;

use crate::component::{short_type_name, Component, ComponentCell, ComponentHandle, Hooks};
use crate::error::EntityError;
use crate::manager::{EntityManager, ManagerInner};
use crate::message::{Delivery, MessageBus, SubscriptionId};

/// Where an entity is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntityState {
    /// Not yet registered with a manager
    Detached = 0,
    /// Registered, waiting for the next frame to admit it
    Staged = 1,
    /// In the manager's live set
    Live = 2,
    /// Destroyed
    Disposed = 3,
}

impl EntityState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EntityState::Detached,
            1 => EntityState::Staged,
            2 => EntityState::Live,
            _ => EntityState::Disposed,
        }
    }
}

pub(crate) struct EntityInner {
    id: EntityId,
    name: Option<String>,
    /// Claimed once, by the first manager the entity is registered with
    manager: OnceLock<Weak<ManagerInner>>,
    state: AtomicU8,
    components: Mutex<Vec<Arc<ComponentCell>>>,
    /// Components taking part in the per-frame update, in attachment order
    updaters: Mutex<Vec<Arc<ComponentCell>>>,
    messages: MessageBus,
}

/// Shared handle to an entity. Clones refer to the same entity.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

impl Entity {
    /// Create an unnamed, unregistered entity
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a named, unregistered entity
    pub fn named(name: impl Into<String>) -> Self {
        Self::build(Some(name.into()))
    }

    fn build(name: Option<String>) -> Self {
        Self {
            inner: Arc::new(EntityInner {
                id: EntityId::new(),
                name,
                manager: OnceLock::new(),
                state: AtomicU8::new(EntityState::Detached as u8),
                components: Mutex::new(Vec::new()),
                updaters: Mutex::new(Vec::new()),
                messages: MessageBus::new(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<EntityInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn is_inner(&self, weak: &Weak<EntityInner>) -> bool {
        std::ptr::eq(weak.as_ptr(), Arc::as_ptr(&self.inner))
    }

    pub fn id(&self) -> EntityId {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn state(&self) -> EntityState {
        EntityState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == EntityState::Disposed
    }

    /// True once the entity has been registered with a manager, even if it was
    /// destroyed since.
    pub fn is_registered(&self) -> bool {
        self.inner.manager.get().is_some()
    }

    /// The manager this entity was registered with, if it is still alive
    pub fn manager(&self) -> Option<EntityManager> {
        self.inner
            .manager
            .get()
            .and_then(Weak::upgrade)
            .map(EntityManager::from_inner)
    }

    pub(crate) fn is_managed_by(&self, manager: &Arc<ManagerInner>) -> bool {
        self.inner
            .manager
            .get()
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(manager)))
    }

    /// Bind the entity to `manager`. Fails if any manager already claimed it.
    pub(crate) fn claim(&self, manager: &Arc<ManagerInner>) -> Result<(), EntityError> {
        self.inner
            .manager
            .set(Arc::downgrade(manager))
            .map_err(|_| EntityError::AlreadyRegistered { entity: self.id() })
    }

    fn advance(&self, from: EntityState, to: EntityState) -> bool {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn mark_staged(&self) -> bool {
        self.advance(EntityState::Detached, EntityState::Staged)
    }

    /// Move into the live set state. False if the entity was disposed meanwhile.
    pub(crate) fn mark_live(&self) -> bool {
        self.advance(EntityState::Staged, EntityState::Live)
            || self.advance(EntityState::Detached, EntityState::Live)
    }

    pub(crate) fn cells(&self) -> Vec<Arc<ComponentCell>> {
        self.inner.components.lock().clone()
    }

    // ---- Components ----

    /// Attach a component. It is initialized and started by the manager once
    /// the entity is live; attaching to a live entity registers it right away.
    ///
    /// An entity holds at most one component per type; a second one fails with
    /// [`EntityError::ComponentExists`]. Check [`Entity::get_component`] first
    /// to reuse an existing one.
    pub fn add_component<C: Component>(&self, component: C) -> Result<ComponentHandle, EntityError> {
        if self.is_disposed() {
            return Err(EntityError::EntityDisposed { entity: self.id() });
        }
        if !component.hooks().contains(Hooks::ATTACHED) {
            return Err(EntityError::MalformedComponent {
                type_name: short_type_name::<C>(),
            });
        }

        let cell = ComponentCell::new(component, Arc::downgrade(&self.inner));
        {
            let mut components = self.inner.components.lock();
            if components.iter().any(|c| c.type_id() == cell.type_id()) {
                return Err(EntityError::ComponentExists {
                    entity: self.id(),
                    type_name: cell.type_name(),
                });
            }
            components.push(cell.clone());
        }

        cell.on_attached(self);
        if cell.hooks().contains(Hooks::UPDATE) {
            self.inner.updaters.lock().push(cell.clone());
        }

        let handle = ComponentHandle::from_cell(cell);
        if self.is_disposed() {
            // Lost a race with destruction; don't leave the component behind.
            self.detach(&handle.cell);
            handle.cell.dispose();
            return Err(EntityError::EntityDisposed { entity: self.id() });
        }
        if self.state() == EntityState::Live {
            if let Some(manager) = self.manager() {
                manager.queue_attached(&handle.cell)?;
            }
        }

        debug!("Attached {} ({}) to {}", handle.type_name(), handle.id(), self);
        Ok(handle)
    }

    /// The component of type `T`, if attached
    pub fn get_component<T: Component>(&self) -> Option<ComponentHandle> {
        let type_id = TypeId::of::<T>();
        self.inner
            .components
            .lock()
            .iter()
            .find(|c| c.type_id() == type_id)
            .cloned()
            .map(ComponentHandle::from_cell)
    }

    pub fn has_component<T: Component>(&self) -> bool {
        let type_id = TypeId::of::<T>();
        self.inner
            .components
            .lock()
            .iter()
            .any(|c| c.type_id() == type_id)
    }

    /// All attached components in attachment order
    pub fn components(&self) -> Vec<ComponentHandle> {
        self.cells().into_iter().map(ComponentHandle::from_cell).collect()
    }

    pub fn component_count(&self) -> usize {
        self.inner.components.lock().len()
    }

    /// Destroy the component of type `T`. Returns false if none was attached.
    pub fn remove_component<T: Component>(&self) -> Result<bool, EntityError> {
        match self.get_component::<T>() {
            Some(handle) => self.remove(&handle),
            None => Ok(false),
        }
    }

    /// Destroy an attached component. Returns false if it is not attached here.
    pub fn remove(&self, handle: &ComponentHandle) -> Result<bool, EntityError> {
        if !handle.cell.is_owned_by(self) {
            return Ok(false);
        }
        match self.manager() {
            Some(manager) => manager.destroy_component(handle)?,
            None => {
                self.detach(&handle.cell);
                handle.cell.dispose();
            }
        }
        Ok(true)
    }

    /// Unlink a component from this entity without disposing it.
    pub(crate) fn detach(&self, cell: &Arc<ComponentCell>) -> bool {
        let removed = {
            let mut components = self.inner.components.lock();
            let before = components.len();
            components.retain(|c| !Arc::ptr_eq(c, cell));
            components.len() != before
        };
        self.inner.updaters.lock().retain(|c| !Arc::ptr_eq(c, cell));
        self.inner.messages.remove_owned(cell.id());
        removed
    }

    /// Mark the entity destroyed and dispose every component. Returns false if
    /// it was already disposed.
    pub(crate) fn dispose(&self) -> bool {
        let previous = self
            .inner
            .state
            .swap(EntityState::Disposed as u8, Ordering::SeqCst);
        if previous == EntityState::Disposed as u8 {
            return false;
        }

        let manager = self.manager();
        for cell in self.cells() {
            match &manager {
                Some(manager) => {
                    manager.release_component(self, &cell);
                }
                None => {
                    self.detach(&cell);
                    cell.dispose();
                }
            }
        }
        self.inner.updaters.lock().clear();
        self.inner.messages.clear();
        debug!("Disposed {}", self);
        true
    }

    /// Destroy a detached entity and all of its components. Entities owned by
    /// a manager must be destroyed through [`EntityManager::destroy_entity`].
    pub fn dispose_detached(&self) -> Result<bool, EntityError> {
        if self.is_registered() {
            return Err(EntityError::ManagerMismatch { entity: self.id() });
        }
        Ok(self.dispose())
    }

    /// The aggregated per-frame hook: every started component that declares
    /// [`Hooks::UPDATE`], in attachment order.
    pub(crate) fn run_update(&self, manager: &EntityManager, time: &GameTime) -> Result<(), EntityError> {
        if self.is_disposed() {
            return Ok(());
        }
        let updaters = self.inner.updaters.lock().clone();
        for cell in updaters {
            cell.run_update(self, manager, time)?;
        }
        Ok(())
    }

    // ---- Messaging ----

    pub fn messages(&self) -> &MessageBus {
        &self.inner.messages
    }

    /// Subscribe a handler for messages of type `M` sent to this entity
    pub fn subscribe<M, F>(&self, handler: F) -> SubscriptionId
    where
        M: 'static,
        F: Fn(&M) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.messages.subscribe::<M, F>(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.messages.unsubscribe(id)
    }

    /// Deliver a message to every handler subscribed for its type. Handler
    /// failures are logged and counted, never propagated.
    pub fn send_message<M: 'static>(&self, message: &M) -> Delivery {
        self.inner.messages.dispatch(message)
    }
}

impl Default for Entity {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.name {
            Some(name) => write!(f, "{} ({})", name, self.inner.id),
            None => write!(f, "{}", self.inner.id),
        }
    }
}
