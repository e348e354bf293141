//! The component contract and the shared cell every attached component lives in

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use cadence_core::{ComponentId, GameTime};
use parking_lot::Mutex;

use crate::entity::{Entity, EntityInner};
use crate::error::EntityError;
use crate::manager::{EntityManager, Phase};
use crate::message::SubscriptionId;

bitflags::bitflags! {
    /// Lifecycle callbacks a component takes part in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Hooks: u8 {
        const ATTACHED = 1 << 0;
        const INITIALIZE = 1 << 1;
        const START = 1 << 2;
        const UPDATE = 1 << 3;
        const DISPOSE = 1 << 4;
    }
}

impl Hooks {
    /// Everything except the per-frame update.
    pub const STANDARD: Hooks = Hooks::ATTACHED
        .union(Hooks::INITIALIZE)
        .union(Hooks::START)
        .union(Hooks::DISPOSE);
}

impl Default for Hooks {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// A pluggable unit of behavior attached to exactly one entity.
///
/// Only the callbacks named by [`Component::hooks`] are ever invoked. A component
/// that does not declare [`Hooks::ATTACHED`] is rejected when it is attached.
pub trait Component: Send + 'static {
    fn hooks(&self) -> Hooks {
        Hooks::STANDARD
    }

    /// Called exactly once, when the component joins its entity.
    fn on_attached(&mut self, _entity: &Entity) {}

    /// Called once after the owning entity is admitted by a manager.
    fn initialize(&mut self, _ctx: &Context<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once, after every component admitted alongside it was initialized.
    fn start(&mut self, _ctx: &Context<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Per-frame callback. Requires [`Hooks::UPDATE`].
    fn update(&mut self, _ctx: &Context<'_>, _time: &GameTime) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called exactly once, when the component is destroyed.
    fn on_dispose(&mut self) {}
}

pub(crate) trait ErasedComponent: Component {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Component> ErasedComponent for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Where a component is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ComponentState {
    /// Attached to an entity, not yet known to a manager
    Attached = 0,
    /// Waiting for its initialize callback
    Queued = 1,
    /// Initialized, waiting for its start callback
    Initialized = 2,
    /// Fully started; receives per-frame updates
    Started = 3,
    /// Destroyed; receives nothing further
    Disposed = 4,
}

impl ComponentState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ComponentState::Attached,
            1 => ComponentState::Queued,
            2 => ComponentState::Initialized,
            3 => ComponentState::Started,
            _ => ComponentState::Disposed,
        }
    }
}

/// Callback context handed to lifecycle hooks.
pub struct Context<'a> {
    entity: &'a Entity,
    manager: &'a EntityManager,
    component: ComponentId,
}

impl<'a> Context<'a> {
    pub(crate) fn new(entity: &'a Entity, manager: &'a EntityManager, component: ComponentId) -> Self {
        Self {
            entity,
            manager,
            component,
        }
    }

    /// The entity the component is attached to
    pub fn entity(&self) -> &Entity {
        self.entity
    }

    /// The manager driving the current callback
    pub fn manager(&self) -> &EntityManager {
        self.manager
    }

    pub fn component_id(&self) -> ComponentId {
        self.component
    }

    /// Subscribe to a message type on the owning entity. The handler is dropped
    /// when this component is destroyed.
    pub fn subscribe<M, F>(&self, handler: F) -> SubscriptionId
    where
        M: 'static,
        F: Fn(&M) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.entity
            .messages()
            .subscribe_owned::<M, F>(Some(self.component), handler)
    }

    /// Destroy the owning entity (deferred to clean-up while entities update).
    pub fn destroy_entity(&self) -> Result<(), EntityError> {
        self.manager.destroy_entity(self.entity)
    }
}

// ---- Cell ----

pub(crate) struct ComponentCell {
    id: ComponentId,
    type_id: TypeId,
    type_name: &'static str,
    hooks: Hooks,
    owner: Mutex<Option<Weak<EntityInner>>>,
    state: AtomicU8,
    dispose_ran: AtomicBool,
    component: Mutex<Box<dyn ErasedComponent>>,
}

impl ComponentCell {
    pub(crate) fn new<C: Component>(component: C, owner: Weak<EntityInner>) -> Arc<Self> {
        Arc::new(Self {
            id: ComponentId::next(),
            type_id: TypeId::of::<C>(),
            type_name: short_type_name::<C>(),
            hooks: component.hooks(),
            owner: Mutex::new(Some(owner)),
            state: AtomicU8::new(ComponentState::Attached as u8),
            dispose_ran: AtomicBool::new(false),
            component: Mutex::new(Box::new(component)),
        })
    }

    pub(crate) fn id(&self) -> ComponentId {
        self.id
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub(crate) fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn hooks(&self) -> Hooks {
        self.hooks
    }

    pub(crate) fn state(&self) -> ComponentState {
        ComponentState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.state() == ComponentState::Disposed
    }

    pub(crate) fn owner(&self) -> Option<Entity> {
        self.owner
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Entity::from_inner)
    }

    pub(crate) fn is_owned_by(&self, entity: &Entity) -> bool {
        self.owner
            .lock()
            .as_ref()
            .is_some_and(|weak| entity.is_inner(weak))
    }

    fn advance(&self, from: ComponentState, to: ComponentState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Claim the component for a manager's queues. Only the first caller wins.
    pub(crate) fn try_queue(&self) -> bool {
        self.advance(ComponentState::Attached, ComponentState::Queued)
    }

    /// Mark the component destroyed, clear its owner, and run its dispose hook.
    /// Returns false if it was already disposed.
    pub(crate) fn dispose(&self) -> bool {
        let previous = self.state.swap(ComponentState::Disposed as u8, Ordering::SeqCst);
        if previous == ComponentState::Disposed as u8 {
            return false;
        }
        self.owner.lock().take();
        // If a callback of this component is on the stack, it runs the hook on unlock.
        if let Some(mut component) = self.component.try_lock() {
            self.run_dispose_hook(&mut **component);
        }
        true
    }

    fn run_dispose_hook(&self, component: &mut dyn ErasedComponent) {
        if self.hooks.contains(Hooks::DISPOSE) && !self.dispose_ran.swap(true, Ordering::SeqCst) {
            component.on_dispose();
        }
    }

    fn after_unlock(&self) {
        if self.is_disposed() {
            if let Some(mut component) = self.component.try_lock() {
                self.run_dispose_hook(&mut **component);
            }
        }
    }

    /// Run `f` with the component locked; blocks while another thread holds it.
    pub(crate) fn invoke<R>(&self, f: impl FnOnce(&mut dyn ErasedComponent) -> R) -> R {
        let result = {
            let mut component = self.component.lock();
            f(&mut **component)
        };
        self.after_unlock();
        result
    }

    /// Run `f` with the component locked, failing instead of waiting.
    pub(crate) fn try_invoke<R>(
        &self,
        f: impl FnOnce(&mut dyn ErasedComponent) -> R,
    ) -> Result<R, EntityError> {
        let result = {
            let mut component = self
                .component
                .try_lock()
                .ok_or(EntityError::ComponentBusy { component: self.id })?;
            f(&mut **component)
        };
        self.after_unlock();
        Ok(result)
    }

    pub(crate) fn on_attached(&self, entity: &Entity) {
        self.invoke(|component| component.on_attached(entity));
    }

    /// Initialize a queued component. Returns false when it was disposed in the meantime.
    pub(crate) fn run_initialize(&self, manager: &EntityManager) -> Result<bool, EntityError> {
        let Some(entity) = self.owner() else {
            return Ok(false);
        };
        if self.hooks.contains(Hooks::INITIALIZE) {
            let ctx = Context::new(&entity, manager, self.id);
            self.invoke(|component| component.initialize(&ctx))
                .map_err(|source| self.hook_error(Phase::Initializing, source))?;
        }
        Ok(self.advance(ComponentState::Queued, ComponentState::Initialized))
    }

    /// Start an initialized component. Returns false when it was disposed in the meantime.
    pub(crate) fn run_start(&self, manager: &EntityManager) -> Result<bool, EntityError> {
        let Some(entity) = self.owner() else {
            return Ok(false);
        };
        if self.hooks.contains(Hooks::START) {
            let ctx = Context::new(&entity, manager, self.id);
            self.invoke(|component| component.start(&ctx))
                .map_err(|source| self.hook_error(Phase::Starting, source))?;
        }
        Ok(self.advance(ComponentState::Initialized, ComponentState::Started))
    }

    pub(crate) fn run_update(
        &self,
        entity: &Entity,
        manager: &EntityManager,
        time: &GameTime,
    ) -> Result<(), EntityError> {
        if self.state() != ComponentState::Started || !self.hooks.contains(Hooks::UPDATE) {
            return Ok(());
        }
        let ctx = Context::new(entity, manager, self.id);
        self.invoke(|component| component.update(&ctx, time))
            .map_err(|source| self.hook_error(Phase::Updating, source))
    }

    fn hook_error(&self, phase: Phase, source: anyhow::Error) -> EntityError {
        EntityError::Hook {
            component: self.type_name,
            phase,
            source,
        }
    }
}

pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    // Keep generic arguments intact, strip the module path of the outer type.
    let outer = full.split('<').next().unwrap_or(full);
    match outer.rfind("::") {
        Some(index) => &full[index + 2..],
        None => full,
    }
}

// ---- Handle ----

/// Shared handle to a component attached to an entity.
#[derive(Clone)]
pub struct ComponentHandle {
    pub(crate) cell: Arc<ComponentCell>,
}

impl ComponentHandle {
    pub(crate) fn from_cell(cell: Arc<ComponentCell>) -> Self {
        Self { cell }
    }

    pub fn id(&self) -> ComponentId {
        self.cell.id()
    }

    /// Short type name of the component, as used in logs and errors
    pub fn type_name(&self) -> &'static str {
        self.cell.type_name()
    }

    pub fn hooks(&self) -> Hooks {
        self.cell.hooks()
    }

    pub fn state(&self) -> ComponentState {
        self.cell.state()
    }

    pub fn is_disposed(&self) -> bool {
        self.cell.is_disposed()
    }

    /// The owning entity. `None` once the component is destroyed.
    pub fn entity(&self) -> Option<Entity> {
        self.cell.owner()
    }

    /// Check the concrete type of the component
    pub fn is<T: Component>(&self) -> bool {
        self.cell.type_id() == TypeId::of::<T>()
    }

    /// Borrow the component as its concrete type.
    ///
    /// Fails with [`EntityError::ComponentBusy`] while one of the component's own
    /// callbacks is running, so a component can never alias itself.
    pub fn with<T: Component, R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, EntityError> {
        let expected = EntityError::ComponentTypeMismatch {
            component: self.id(),
            expected: std::any::type_name::<T>(),
        };
        if !self.is::<T>() {
            return Err(expected);
        }
        self.cell
            .try_invoke(|component| component.as_any_mut().downcast_mut::<T>().map(f))?
            .ok_or(expected)
    }

    /// Read-only variant of [`ComponentHandle::with`]
    pub fn read<T: Component, R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, EntityError> {
        if !self.is::<T>() {
            return Err(EntityError::ComponentTypeMismatch {
                component: self.id(),
                expected: std::any::type_name::<T>(),
            });
        }
        self.cell
            .try_invoke(|component| component.as_any().downcast_ref::<T>().map(f))?
            .ok_or(EntityError::ComponentTypeMismatch {
                component: self.id(),
                expected: std::any::type_name::<T>(),
            })
    }
}

impl PartialEq for ComponentHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Eq for ComponentHandle {}

impl fmt::Debug for ComponentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentHandle")
            .field("id", &self.id())
            .field("type", &self.type_name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        disposed: Arc<AtomicUsize>,
        value: u32,
    }

    impl Component for Counter {
        fn on_dispose(&mut self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Silent;

    impl Component for Silent {
        fn hooks(&self) -> Hooks {
            Hooks::ATTACHED
        }
    }

    #[test]
    fn standard_hooks_exclude_update() {
        assert!(Hooks::default().contains(Hooks::ATTACHED | Hooks::START));
        assert!(!Hooks::default().contains(Hooks::UPDATE));
    }

    #[test]
    fn short_type_names() {
        assert_eq!(short_type_name::<Counter>(), "Counter");
        assert_eq!(short_type_name::<Vec<u8>>(), "Vec<u8>");
    }

    #[test]
    fn state_only_queues_once() {
        let entity = Entity::new();
        let handle = entity.add_component(Silent).unwrap();
        assert_eq!(handle.state(), ComponentState::Attached);
        assert!(handle.cell.try_queue());
        assert!(!handle.cell.try_queue());
        assert_eq!(handle.state(), ComponentState::Queued);
    }

    #[test]
    fn dispose_runs_hook_once() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let entity = Entity::new();
        let handle = entity
            .add_component(Counter {
                disposed: disposed.clone(),
                value: 0,
            })
            .unwrap();

        assert!(handle.cell.dispose());
        assert!(!handle.cell.dispose());
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert!(handle.entity().is_none());
    }

    #[test]
    fn dispose_while_busy_defers_hook() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let entity = Entity::new();
        let handle = entity
            .add_component(Counter {
                disposed: disposed.clone(),
                value: 0,
            })
            .unwrap();

        let cell = handle.cell.clone();
        handle
            .with::<Counter, _>(|counter| {
                counter.value = 7;
                assert!(cell.dispose());
                // Still inside the borrow, so the hook has not run yet.
                assert_eq!(counter.disposed.load(Ordering::SeqCst), 0);
            })
            .unwrap();
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn typed_access() {
        let entity = Entity::new();
        let handle = entity
            .add_component(Counter {
                disposed: Arc::new(AtomicUsize::new(0)),
                value: 3,
            })
            .unwrap();

        assert!(handle.is::<Counter>());
        handle.with::<Counter, _>(|c| c.value += 1).unwrap();
        assert_eq!(handle.read::<Counter, _>(|c| c.value).unwrap(), 4);
        assert!(matches!(
            handle.with::<Silent, _>(|_| ()),
            Err(EntityError::ComponentTypeMismatch { .. })
        ));
    }

    #[test]
    fn nested_access_is_busy() {
        let entity = Entity::new();
        let handle = entity
            .add_component(Counter {
                disposed: Arc::new(AtomicUsize::new(0)),
                value: 0,
            })
            .unwrap();

        let inner = handle.clone();
        let nested = handle
            .with::<Counter, _>(|_| inner.read::<Counter, _>(|c| c.value))
            .unwrap();
        assert!(matches!(nested, Err(EntityError::ComponentBusy { .. })));
    }
}
