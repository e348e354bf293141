//! The entity manager: live set, staging queues, and the per-frame phase machine
//!
//! Every frame runs four phases in order. Work requested in the middle of a
//! frame is either applied right away (when the driving thread asks during
//! `Starting`) or staged for the next `Initializing` phase. Entities destroyed
//! while entities are updating leave the live set during `CleanUp`.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use cadence_core::{EntityId, GameTime};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::component::{ComponentCell, ComponentHandle};
use crate::entity::{Entity, EntityState};
use crate::error::EntityError;

/// The manager's position in its per-frame phase machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Phase {
    /// Outside of a frame
    #[default]
    None,
    /// Admitting staged entities and initializing staged components
    Initializing,
    /// Starting every initialized component
    Starting,
    /// Running the per-frame update of every live entity
    Updating,
    /// Removing entities destroyed during the update
    CleanUp,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::None => "None",
            Phase::Initializing => "Initializing",
            Phase::Starting => "Starting",
            Phase::Updating => "Updating",
            Phase::CleanUp => "CleanUp",
        };
        f.write_str(name)
    }
}

/// What one call to [`EntityManager::update`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Entities moved from staging into the live set
    pub admitted: usize,
    /// Components whose initialize phase completed
    pub initialized: usize,
    /// Components whose start phase completed
    pub started: usize,
    /// Live entities whose update hook ran
    pub updated: usize,
    /// Destroyed entities removed from the live set during clean-up
    pub removed: usize,
}

#[derive(Default)]
struct FrameState {
    phase: Phase,
    driver: Option<ThreadId>,
}

#[derive(Default)]
struct Staging {
    entities: VecDeque<Entity>,
    components: VecDeque<Arc<ComponentCell>>,
    dead: Vec<Entity>,
}

/// Lock order is `frame`, then `live`, then `staging`. No lock is held while a
/// component callback runs.
pub(crate) struct ManagerInner {
    frame: Mutex<FrameState>,
    live: Mutex<Vec<Entity>>,
    staging: Mutex<Staging>,
    start_pending: Mutex<VecDeque<Arc<ComponentCell>>>,
}

/// Owns the live set of entities and drives their lifecycle once per frame.
///
/// Cloning yields another handle to the same manager, so components can hold
/// one and the manager can be shared with other threads.
#[derive(Clone)]
pub struct EntityManager {
    inner: Arc<ManagerInner>,
}

enum Dispatch {
    Immediate,
    Staged,
}

/// Resets the phase and the driving-thread marker when a frame ends, including
/// when it is cut short by an error.
struct FrameGuard<'a> {
    manager: &'a EntityManager,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        let mut frame = self.manager.inner.frame.lock();
        frame.phase = Phase::None;
        frame.driver = None;
    }
}

impl EntityManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                frame: Mutex::new(FrameState::default()),
                live: Mutex::new(Vec::new()),
                staging: Mutex::new(Staging::default()),
                start_pending: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    /// The current phase
    pub fn phase(&self) -> Phase {
        self.inner.frame.lock().phase
    }

    /// True when called from the thread currently running [`EntityManager::update`]
    pub fn is_driving_thread(&self) -> bool {
        self.inner.frame.lock().driver == Some(thread::current().id())
    }

    fn dispatch(&self) -> Dispatch {
        let frame = self.inner.frame.lock();
        if frame.phase == Phase::Starting && frame.driver == Some(thread::current().id()) {
            Dispatch::Immediate
        } else {
            Dispatch::Staged
        }
    }

    fn set_phase(&self, phase: Phase) {
        self.inner.frame.lock().phase = phase;
        trace!("Entity manager phase: {}", phase);
    }

    fn owns(&self, entity: &Entity) -> Result<(), EntityError> {
        if entity.is_managed_by(&self.inner) {
            Ok(())
        } else if entity.is_registered() {
            Err(EntityError::ManagerMismatch { entity: entity.id() })
        } else {
            Err(EntityError::UnregisteredOwner { entity: entity.id() })
        }
    }

    // ---- Queries ----

    /// Number of entities in the live set
    pub fn entity_count(&self) -> usize {
        self.inner.live.lock().len()
    }

    /// Whether the entity is in the live set
    pub fn is_managing(&self, entity: &Entity) -> bool {
        self.inner.live.lock().iter().any(|e| e == entity)
    }

    /// First live entity with the given name
    pub fn find(&self, name: &str) -> Option<Entity> {
        self.inner
            .live
            .lock()
            .iter()
            .find(|e| e.name() == Some(name))
            .cloned()
    }

    /// Live entity with the given ID
    pub fn get(&self, id: EntityId) -> Option<Entity> {
        self.inner.live.lock().iter().find(|e| e.id() == id).cloned()
    }

    /// Snapshot of the live set
    pub fn entities(&self) -> Vec<Entity> {
        self.inner.live.lock().clone()
    }

    // ---- Registration ----

    /// Create a named entity and register it with this manager
    pub fn create_entity(&self, name: Option<&str>) -> Result<Entity, EntityError> {
        let entity = match name {
            Some(name) => Entity::named(name),
            None => Entity::new(),
        };
        self.register_entity(&entity)?;
        Ok(entity)
    }

    /// Register an entity with this manager.
    ///
    /// From the driving thread during [`Phase::Starting`] the entity is admitted
    /// immediately and its components are initialized and started in the same
    /// frame. Otherwise it is staged until the next frame.
    pub fn register_entity(&self, entity: &Entity) -> Result<(), EntityError> {
        if entity.is_disposed() {
            return Err(EntityError::EntityDisposed { entity: entity.id() });
        }
        entity.claim(&self.inner)?;

        match self.dispatch() {
            Dispatch::Immediate => {
                self.admit(entity)?;
            }
            Dispatch::Staged => {
                entity.mark_staged();
                self.inner.staging.lock().entities.push_back(entity.clone());
                debug!("Staged {}", entity);
            }
        }
        Ok(())
    }

    /// Register a batch of entities at once. Every entity is checked before any
    /// is claimed, and the batch is staged under a single lock acquisition.
    ///
    /// When admitted immediately, every entity joins the live set before any
    /// component is initialized, so a failing initialize leaves the rest of the
    /// batch live with its components staged for the next frame.
    pub fn register_entities(&self, entities: &[Entity]) -> Result<(), EntityError> {
        let mut seen = HashSet::new();
        for entity in entities {
            if entity.is_disposed() {
                return Err(EntityError::EntityDisposed { entity: entity.id() });
            }
            if entity.is_registered() || !seen.insert(entity.id()) {
                return Err(EntityError::AlreadyRegistered { entity: entity.id() });
            }
        }
        self.claim_batch(entities)?;

        match self.dispatch() {
            Dispatch::Immediate => {
                let mut cells = Vec::new();
                for entity in entities {
                    if self.enter_live(entity) {
                        cells.extend(entity.cells().into_iter().filter(|c| c.try_queue()));
                    }
                }
                self.initialize_now(cells)?;
            }
            Dispatch::Staged => self.stage(entities),
        }
        Ok(())
    }

    /// Claim every entity of a batch. If another manager wins one of them
    /// first, the entities already claimed are staged so none is left bound
    /// to this manager without a way in.
    fn claim_batch(&self, entities: &[Entity]) -> Result<(), EntityError> {
        for (index, entity) in entities.iter().enumerate() {
            if let Err(err) = entity.claim(&self.inner) {
                self.stage(&entities[..index]);
                return Err(err);
            }
        }
        Ok(())
    }

    fn stage(&self, entities: &[Entity]) {
        if entities.is_empty() {
            return;
        }
        for entity in entities {
            entity.mark_staged();
        }
        self.inner
            .staging
            .lock()
            .entities
            .extend(entities.iter().cloned());
        debug!("Staged a batch of {} entities", entities.len());
    }

    /// Register a component whose entity is already registered with this manager.
    ///
    /// Components of an entity that is still staged are picked up when the
    /// entity is admitted, so this only queues components of live entities.
    pub fn register_component(&self, handle: &ComponentHandle) -> Result<(), EntityError> {
        self.queue_component(&handle.cell, true)
    }

    /// Registration that follows an attach. Admission of the entity may have
    /// queued the component already, which is not an error here.
    pub(crate) fn queue_attached(&self, cell: &Arc<ComponentCell>) -> Result<(), EntityError> {
        self.queue_component(cell, false)
    }

    fn queue_component(&self, cell: &Arc<ComponentCell>, explicit: bool) -> Result<(), EntityError> {
        let entity = cell
            .owner()
            .ok_or(EntityError::DetachedComponent { component: cell.id() })?;
        self.owns(&entity)?;
        if entity.state() != EntityState::Live {
            return Ok(());
        }
        if !cell.try_queue() {
            if !explicit && !cell.is_disposed() {
                return Ok(());
            }
            return Err(EntityError::ComponentAlreadyRegistered { component: cell.id() });
        }

        match self.dispatch() {
            Dispatch::Immediate => self.initialize_now(vec![cell.clone()])?,
            Dispatch::Staged => {
                self.inner.staging.lock().components.push_back(cell.clone());
                trace!("Staged component {} of {}", cell.id(), entity);
            }
        }
        Ok(())
    }

    /// Move an entity into the live set, then initialize its components.
    fn admit(&self, entity: &Entity) -> Result<bool, EntityError> {
        if !self.enter_live(entity) {
            return Ok(false);
        }
        let cells = entity.cells().into_iter().filter(|c| c.try_queue()).collect();
        self.initialize_now(cells)?;
        Ok(true)
    }

    fn enter_live(&self, entity: &Entity) -> bool {
        if !entity.mark_live() {
            return false;
        }
        self.inner.live.lock().push(entity.clone());
        debug!("Admitted {}", entity);
        true
    }

    /// Initialize queued components right away. If one fails, the ones after
    /// it go back to staging for the next frame before the error is returned.
    fn initialize_now(&self, cells: Vec<Arc<ComponentCell>>) -> Result<(), EntityError> {
        let mut cells = cells.into_iter();
        while let Some(cell) = cells.next() {
            match cell.run_initialize(self) {
                Ok(true) => self.inner.start_pending.lock().push_back(cell),
                Ok(false) => {}
                Err(err) => {
                    self.inner.staging.lock().components.extend(cells);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    // ---- Destruction ----

    /// Destroy an entity owned by this manager.
    ///
    /// The entity and its components are disposed right away. While entities
    /// are updating, removal from the live set waits for [`Phase::CleanUp`];
    /// otherwise it happens immediately.
    pub fn destroy_entity(&self, entity: &Entity) -> Result<(), EntityError> {
        self.owns(entity)?;
        if !entity.dispose() {
            return Ok(());
        }

        let frame = self.inner.frame.lock();
        if frame.phase == Phase::Updating {
            let mut staging = self.inner.staging.lock();
            staging.entities.retain(|e| e != entity);
            staging.dead.push(entity.clone());
            trace!("Deferred removal of {}", entity);
        } else {
            self.inner.live.lock().retain(|e| e != entity);
            self.inner.staging.lock().entities.retain(|e| e != entity);
        }
        debug!("Destroyed {}", entity);
        Ok(())
    }

    /// Destroy a component of an entity owned by this manager.
    pub fn destroy_component(&self, handle: &ComponentHandle) -> Result<(), EntityError> {
        let cell = &handle.cell;
        let entity = cell
            .owner()
            .ok_or(EntityError::DetachedComponent { component: cell.id() })?;
        self.owns(&entity)?;
        if !self.release_component(&entity, cell) {
            return Err(EntityError::DetachedComponent { component: cell.id() });
        }
        debug!("Destroyed {} ({}) of {}", cell.type_name(), cell.id(), entity);
        Ok(())
    }

    /// Detach, unstage, and dispose a component. False if it was already disposed.
    pub(crate) fn release_component(&self, entity: &Entity, cell: &Arc<ComponentCell>) -> bool {
        entity.detach(cell);
        self.inner
            .staging
            .lock()
            .components
            .retain(|c| !Arc::ptr_eq(c, cell));
        cell.dispose()
    }

    // ---- Frame ----

    fn begin_frame(&self) -> Result<FrameGuard<'_>, EntityError> {
        let mut frame = self.inner.frame.lock();
        if frame.driver.is_some() {
            return Err(EntityError::ReentrantUpdate);
        }
        frame.driver = Some(thread::current().id());
        frame.phase = Phase::Initializing;
        trace!("Entity manager phase: {}", Phase::Initializing);
        Ok(FrameGuard { manager: self })
    }

    /// Run one frame: initialize, start, update, clean up.
    ///
    /// Calling this while a frame is already running, from any thread, fails
    /// with [`EntityError::ReentrantUpdate`]. A failing component callback aborts
    /// the frame; work already applied stays applied.
    pub fn update(&self, time: &GameTime) -> Result<FrameStats, EntityError> {
        let _guard = self.begin_frame()?;
        let mut stats = FrameStats::default();

        self.initialize_staged(&mut stats)?;

        self.set_phase(Phase::Starting);
        self.start_pending(&mut stats)?;

        self.set_phase(Phase::Updating);
        self.update_live(time, &mut stats)?;

        self.set_phase(Phase::CleanUp);
        self.clean_up(&mut stats);

        debug!(
            "Frame {}: admitted {}, initialized {}, started {}, updated {}, removed {}",
            time.frame_count,
            stats.admitted,
            stats.initialized,
            stats.started,
            stats.updated,
            stats.removed
        );
        Ok(stats)
    }

    /// Drain both staging queues until neither has work, so entities and
    /// components created by initialize callbacks are handled this frame too.
    fn initialize_staged(&self, stats: &mut FrameStats) -> Result<(), EntityError> {
        loop {
            let next_entity = self.inner.staging.lock().entities.pop_front();
            if let Some(entity) = next_entity {
                if entity.mark_live() {
                    self.inner.live.lock().push(entity.clone());
                    stats.admitted += 1;
                    let queued: Vec<_> = entity.cells().into_iter().filter(|c| c.try_queue()).collect();
                    self.inner.staging.lock().components.extend(queued);
                    debug!("Admitted {}", entity);
                }
                continue;
            }

            let next_component = self.inner.staging.lock().components.pop_front();
            if let Some(cell) = next_component {
                if cell.run_initialize(self)? {
                    stats.initialized += 1;
                    self.inner.start_pending.lock().push_back(cell);
                }
                continue;
            }

            return Ok(());
        }
    }

    fn start_pending(&self, stats: &mut FrameStats) -> Result<(), EntityError> {
        loop {
            let next = self.inner.start_pending.lock().pop_front();
            let Some(cell) = next else {
                return Ok(());
            };
            if cell.run_start(self)? {
                stats.started += 1;
            }
        }
    }

    /// Walks the live set by index, re-locking per entity. Registrations made
    /// now are staged and destructions are deferred to clean-up, so the set
    /// does not change under the walk.
    fn update_live(&self, time: &GameTime, stats: &mut FrameStats) -> Result<(), EntityError> {
        let mut index = 0;
        loop {
            let next = self.inner.live.lock().get(index).cloned();
            let Some(entity) = next else {
                return Ok(());
            };
            index += 1;
            if entity.is_disposed() {
                continue;
            }
            entity.run_update(self, time)?;
            stats.updated += 1;
        }
    }

    fn clean_up(&self, stats: &mut FrameStats) {
        let dead = std::mem::take(&mut self.inner.staging.lock().dead);
        if dead.is_empty() {
            return;
        }
        let dead: HashSet<EntityId> = dead.iter().map(Entity::id).collect();
        let mut live = self.inner.live.lock();
        let before = live.len();
        live.retain(|e| !dead.contains(&e.id()));
        stats.removed += before - live.len();
        trace!("Removed {} destroyed entities", before - live.len());
    }
}

impl Default for EntityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityManager")
            .field("phase", &self.phase())
            .field("entities", &self.entity_count())
            .finish()
    }
}
