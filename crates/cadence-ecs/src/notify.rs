//! Notification center: typed broadcasts with global and sender-specific observers
//!
//! Observers either watch every notification of a type, or only those posted
//! by one sender. A sender is an entity or a component; observers of a
//! component's entity also hear what the component posts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cadence_core::{ComponentId, EntityId, GameTime};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::component::ComponentHandle;
use crate::entity::Entity;
use crate::message::{Delivery, MessageBus, SubscriptionId};

/// Who posted a notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sender {
    Entity(Entity),
    Component(ComponentHandle),
}

impl Sender {
    /// The entity behind the sender; a component's owner while it is attached
    pub fn entity(&self) -> Option<Entity> {
        match self {
            Sender::Entity(entity) => Some(entity.clone()),
            Sender::Component(component) => component.entity(),
        }
    }

    fn key(&self) -> SenderKey {
        match self {
            Sender::Entity(entity) => SenderKey::Entity(entity.id()),
            Sender::Component(component) => SenderKey::Component(component.id()),
        }
    }

    fn is_alive(&self) -> bool {
        match self {
            Sender::Entity(entity) => !entity.is_disposed(),
            Sender::Component(component) => !component.is_disposed(),
        }
    }
}

impl From<&Entity> for Sender {
    fn from(entity: &Entity) -> Self {
        Sender::Entity(entity.clone())
    }
}

impl From<Entity> for Sender {
    fn from(entity: Entity) -> Self {
        Sender::Entity(entity)
    }
}

impl From<&ComponentHandle> for Sender {
    fn from(component: &ComponentHandle) -> Self {
        Sender::Component(component.clone())
    }
}

impl From<ComponentHandle> for Sender {
    fn from(component: ComponentHandle) -> Self {
        Sender::Component(component)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SenderKey {
    Entity(EntityId),
    Component(ComponentId),
}

/// A notification as observers receive it
#[derive(Debug, Clone)]
pub struct Posted<T> {
    pub sender: Sender,
    pub notification: T,
}

/// Identifies a registered observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId {
    key: Option<SenderKey>,
    subscription: SubscriptionId,
}

struct SenderObservers {
    sender: Sender,
    bus: Arc<MessageBus>,
}

/// Broadcasts typed notifications to observers.
pub struct NotificationCenter {
    global: MessageBus,
    senders: Mutex<HashMap<SenderKey, SenderObservers>>,
    purge_interval: f64,
    last_purge: Mutex<f64>,
}

impl NotificationCenter {
    /// Default time between purges of observers keyed to destroyed senders
    pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(5 * 60);

    pub fn new() -> Self {
        Self::with_purge_interval(Self::DEFAULT_PURGE_INTERVAL)
    }

    pub fn with_purge_interval(interval: Duration) -> Self {
        Self {
            global: MessageBus::new(),
            senders: Mutex::new(HashMap::new()),
            purge_interval: interval.as_secs_f64(),
            last_purge: Mutex::new(0.0),
        }
    }

    /// Observe every notification of type `T`, whoever posts it
    pub fn observe<T, F>(&self, handler: F) -> ObserverId
    where
        T: 'static,
        F: Fn(&Posted<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        ObserverId {
            key: None,
            subscription: self.global.subscribe::<Posted<T>, F>(handler),
        }
    }

    /// Observe notifications of type `T` posted by one sender
    pub fn observe_sender<T, F>(&self, sender: impl Into<Sender>, handler: F) -> ObserverId
    where
        T: 'static,
        F: Fn(&Posted<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let sender = sender.into();
        let key = sender.key();
        let bus = self
            .senders
            .lock()
            .entry(key)
            .or_insert_with(|| SenderObservers {
                sender,
                bus: Arc::new(MessageBus::new()),
            })
            .bus
            .clone();
        ObserverId {
            key: Some(key),
            subscription: bus.subscribe::<Posted<T>, F>(handler),
        }
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        match id.key {
            None => self.global.unsubscribe(id.subscription),
            Some(key) => {
                let mut senders = self.senders.lock();
                let Some(entry) = senders.get(&key) else {
                    return false;
                };
                let removed = entry.bus.unsubscribe(id.subscription);
                if entry.bus.is_empty() {
                    senders.remove(&key);
                }
                removed
            }
        }
    }

    /// Drop every observer keyed to `sender`. For an entity this includes the
    /// observers of its components.
    pub fn forget_sender(&self, sender: impl Into<Sender>) -> usize {
        let sender = sender.into();
        let key = sender.key();
        let mut senders = self.senders.lock();
        let before = senders.len();
        match &sender {
            Sender::Entity(entity) => senders.retain(|k, observers| {
                *k != key && observers.sender.entity().as_ref() != Some(entity)
            }),
            Sender::Component(_) => {
                senders.remove(&key);
            }
        }
        before - senders.len()
    }

    /// Post a notification.
    ///
    /// Observers of the sender hear it first, then observers of the sender's
    /// entity when the sender is a component, then global observers. A failing
    /// observer is logged and counted and does not stop the others.
    pub fn post<T: 'static>(&self, sender: impl Into<Sender>, notification: T) -> Delivery {
        let posted = Posted {
            sender: sender.into(),
            notification,
        };

        let mut keys = vec![posted.sender.key()];
        if let Sender::Component(component) = &posted.sender {
            if let Some(entity) = component.entity() {
                keys.push(SenderKey::Entity(entity.id()));
            }
        }
        let buses: Vec<Arc<MessageBus>> = {
            let senders = self.senders.lock();
            keys.iter()
                .filter_map(|key| senders.get(key).map(|o| o.bus.clone()))
                .collect()
        };

        let mut delivery = Delivery::default();
        for bus in buses {
            delivery.merge(bus.dispatch(&posted));
        }
        delivery.merge(self.global.dispatch(&posted));
        trace!(
            "Posted {} to {} observers",
            std::any::type_name::<T>(),
            delivery.reached()
        );
        delivery
    }

    /// Forget observers keyed to destroyed senders. Returns how many senders
    /// were dropped.
    pub fn purge(&self) -> usize {
        let mut senders = self.senders.lock();
        let before = senders.len();
        senders.retain(|_, observers| observers.sender.is_alive() && !observers.bus.is_empty());
        let purged = before - senders.len();
        if purged > 0 {
            debug!("Purged observers of {} destroyed senders", purged);
        }
        purged
    }

    /// Purge when at least the purge interval of game time has passed since
    /// the last purge.
    pub fn tick(&self, time: &GameTime) -> usize {
        {
            let mut last = self.last_purge.lock();
            if time.total_time - *last < self.purge_interval {
                return 0;
            }
            *last = time.total_time;
        }
        self.purge()
    }

    /// Number of senders with dedicated observers
    pub fn sender_count(&self) -> usize {
        self.senders.lock().len()
    }
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::manager::EntityManager;

    #[derive(Debug, Clone, PartialEq)]
    struct Scored(u32);

    struct Scoreboard;

    impl Component for Scoreboard {}

    type Seen = Arc<Mutex<Vec<String>>>;

    fn tagged(seen: &Seen, tag: &'static str) -> impl Fn(&Posted<Scored>) -> anyhow::Result<()> + Send + Sync + 'static {
        let seen = seen.clone();
        move |posted: &Posted<Scored>| {
            seen.lock().push(format!("{}:{}", tag, posted.notification.0));
            Ok(())
        }
    }

    #[test]
    fn post_reaches_sender_then_entity_then_global() {
        let center = NotificationCenter::new();
        let entity = Entity::named("player");
        let board = entity.add_component(Scoreboard).unwrap();
        let seen = Seen::default();

        center.observe::<Scored, _>(tagged(&seen, "global"));
        center.observe_sender::<Scored, _>(&entity, tagged(&seen, "entity"));
        center.observe_sender::<Scored, _>(&board, tagged(&seen, "component"));

        let delivery = center.post(&board, Scored(3));
        assert_eq!(delivery.delivered, 3);
        assert_eq!(*seen.lock(), vec!["component:3", "entity:3", "global:3"]);

        seen.lock().clear();
        center.post(&entity, Scored(4));
        assert_eq!(*seen.lock(), vec!["entity:4", "global:4"]);
    }

    #[test]
    fn unrelated_senders_only_reach_global() {
        let center = NotificationCenter::new();
        let seen = Seen::default();
        let watched = Entity::new();
        center.observe_sender::<Scored, _>(&watched, tagged(&seen, "watched"));
        center.observe::<Scored, _>(tagged(&seen, "global"));

        center.post(Entity::new(), Scored(1));
        assert_eq!(*seen.lock(), vec!["global:1"]);
    }

    #[test]
    fn failing_observer_is_isolated() {
        let center = NotificationCenter::new();
        let seen = Seen::default();
        center.observe::<Scored, _>(|_| anyhow::bail!("observer broke"));
        center.observe::<Scored, _>(tagged(&seen, "after"));

        let delivery = center.post(Entity::new(), Scored(9));
        assert_eq!(delivery, Delivery { delivered: 1, failed: 1 });
        assert_eq!(*seen.lock(), vec!["after:9"]);
    }

    #[test]
    fn remove_and_forget() {
        let center = NotificationCenter::new();
        let entity = Entity::new();
        let board = entity.add_component(Scoreboard).unwrap();

        let global = center.observe::<Scored, _>(|_| Ok(()));
        let single = center.observe_sender::<Scored, _>(&entity, |_| Ok(()));
        center.observe_sender::<Scored, _>(&board, |_| Ok(()));
        assert_eq!(center.sender_count(), 2);

        assert!(center.remove_observer(global));
        assert!(!center.remove_observer(global));
        assert!(center.remove_observer(single));
        assert_eq!(center.sender_count(), 1);

        center.observe_sender::<Scored, _>(&entity, |_| Ok(()));
        assert_eq!(center.forget_sender(&entity), 2);
        assert_eq!(center.sender_count(), 0);
    }

    #[test]
    fn purge_drops_destroyed_senders() {
        let manager = EntityManager::new();
        let center = NotificationCenter::with_purge_interval(Duration::from_secs(1));
        let alive = manager.create_entity(None).unwrap();
        let doomed = manager.create_entity(None).unwrap();
        center.observe_sender::<Scored, _>(&alive, |_| Ok(()));
        center.observe_sender::<Scored, _>(&doomed, |_| Ok(()));

        manager.destroy_entity(&doomed).unwrap();

        let mut time = GameTime::default();
        time.update(0.1);
        assert_eq!(center.tick(&time), 0);
        for _ in 0..8 {
            time.update(0.2);
        }
        assert_eq!(center.tick(&time), 1);
        assert_eq!(center.sender_count(), 1);
        assert_eq!(center.purge(), 0);
    }
}
