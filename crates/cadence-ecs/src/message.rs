//! Typed message dispatch with per-handler failure isolation

use std::any::{Any, TypeId};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cadence_core::ComponentId;
use parking_lot::Mutex;
use tracing::warn;

type Handler<M> = Box<dyn Fn(&M) -> anyhow::Result<()> + Send + Sync>;

/// Identifies a registered message handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub:{}", self.0)
    }
}

/// Outcome of a broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Handlers that returned `Ok`
    pub delivered: usize,
    /// Handlers that returned an error or panicked
    pub failed: usize,
}

impl Delivery {
    /// Total number of handlers that were invoked
    pub fn reached(&self) -> usize {
        self.delivered + self.failed
    }

    pub fn merge(&mut self, other: Delivery) {
        self.delivered += other.delivered;
        self.failed += other.failed;
    }
}

struct Subscription {
    id: SubscriptionId,
    owner: Option<ComponentId>,
    message: TypeId,
    handler: Arc<dyn Any + Send + Sync>,
}

/// Handlers keyed by message type, invoked in registration order.
pub struct MessageBus {
    next_id: AtomicU64,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler for messages of type `M`
    pub fn subscribe<M, F>(&self, handler: F) -> SubscriptionId
    where
        M: 'static,
        F: Fn(&M) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_owned::<M, F>(None, handler)
    }

    /// Register a handler that is dropped together with its owning component
    pub fn subscribe_owned<M, F>(&self, owner: Option<ComponentId>, handler: F) -> SubscriptionId
    where
        M: 'static,
        F: Fn(&M) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler<M> = Box::new(handler);
        self.subscriptions.lock().push(Subscription {
            id,
            owner,
            message: TypeId::of::<M>(),
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a handler. Returns false if it was not registered here.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Remove every handler owned by `owner`, returning how many were dropped
    pub fn remove_owned(&self, owner: ComponentId) -> usize {
        let mut subscriptions = self.subscriptions.lock();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.owner != Some(owner));
        before - subscriptions.len()
    }

    pub fn clear(&self) {
        self.subscriptions.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.lock().is_empty()
    }

    /// Invoke every handler registered for `M`.
    ///
    /// Handlers run without the bus locked, so they may subscribe, unsubscribe,
    /// or dispatch again. A handler that fails or panics is logged and counted;
    /// the remaining handlers still run.
    pub fn dispatch<M: 'static>(&self, message: &M) -> Delivery {
        let message_type = TypeId::of::<M>();
        let handlers: Vec<(SubscriptionId, Arc<dyn Any + Send + Sync>)> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.message == message_type)
            .map(|s| (s.id, s.handler.clone()))
            .collect();

        let mut delivery = Delivery::default();
        for (id, handler) in handlers {
            let Some(handler) = handler.downcast_ref::<Handler<M>>() else {
                continue;
            };
            match panic::catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(Ok(())) => delivery.delivered += 1,
                Ok(Err(err)) => {
                    warn!(
                        "Handler {} for {} failed: {:#}",
                        id,
                        std::any::type_name::<M>(),
                        err
                    );
                    delivery.failed += 1;
                }
                Err(_) => {
                    warn!(
                        "Handler {} for {} panicked",
                        id,
                        std::any::type_name::<M>()
                    );
                    delivery.failed += 1;
                }
            }
        }
        delivery
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Ping(u32);
    struct Pong;

    #[test]
    fn dispatch_by_type() {
        let bus = MessageBus::new();
        let pings = Arc::new(AtomicUsize::new(0));
        let p = pings.clone();
        bus.subscribe::<Ping, _>(move |ping| {
            p.fetch_add(ping.0 as usize, Ordering::SeqCst);
            Ok(())
        });

        let delivery = bus.dispatch(&Ping(5));
        assert_eq!(delivery.delivered, 1);
        assert_eq!(pings.load(Ordering::SeqCst), 5);

        let delivery = bus.dispatch(&Pong);
        assert_eq!(delivery.reached(), 0);
    }

    #[test]
    fn failing_handlers_do_not_stop_later_ones() {
        let bus = MessageBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        bus.subscribe::<Ping, _>(move |_| {
            o.lock().push("first");
            anyhow::bail!("refused")
        });
        bus.subscribe::<Ping, _>(|_| panic!("handler blew up"));
        let o = order.clone();
        bus.subscribe::<Ping, _>(move |_| {
            o.lock().push("last");
            Ok(())
        });

        let delivery = bus.dispatch(&Ping(1));
        assert_eq!(delivery, Delivery { delivered: 1, failed: 2 });
        assert_eq!(*order.lock(), vec!["first", "last"]);
    }

    #[test]
    fn owned_handlers_are_removed_together() {
        let bus = MessageBus::new();
        let owner = ComponentId::next();
        bus.subscribe_owned::<Ping, _>(Some(owner), |_| Ok(()));
        bus.subscribe_owned::<Pong, _>(Some(owner), |_| Ok(()));
        let kept = bus.subscribe::<Ping, _>(|_| Ok(()));

        assert_eq!(bus.remove_owned(owner), 2);
        assert_eq!(bus.len(), 1);
        assert!(bus.unsubscribe(kept));
        assert!(!bus.unsubscribe(kept));
        assert!(bus.is_empty());
    }

    #[test]
    fn handlers_may_resubscribe_during_dispatch() {
        let bus = Arc::new(MessageBus::new());
        let inner = bus.clone();
        bus.subscribe::<Ping, _>(move |_| {
            inner.subscribe::<Pong, _>(|_| Ok(()));
            Ok(())
        });

        assert_eq!(bus.dispatch(&Ping(0)).delivered, 1);
        assert_eq!(bus.dispatch(&Pong).delivered, 1);
    }
}
