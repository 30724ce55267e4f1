//! Per-model fan-out of change events.

use std::sync::{Arc, Weak};

use modelsync_shared::ChangeEvent;
use parking_lot::Mutex;

/// Callback invoked with every dispatched event.
pub type Observer = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Receiver of change events coming off a socket.
pub trait ChangeSink: Send + Sync {
    fn deliver(&self, event: ChangeEvent);
}

/// Observers of one model, invoked synchronously in registration order.
pub struct SubscriptionBroker {
    model: String,
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    observers: Mutex<Vec<(u64, Observer)>>,
    next_id: Mutex<u64>,
}

impl BrokerInner {
    fn remove(&self, id: u64) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }
}

impl SubscriptionBroker {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            inner: Arc::new(BrokerInner {
                observers: Mutex::new(Vec::new()),
                next_id: Mutex::new(0),
            }),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Observe every event of the model.
    pub fn subscribe(&self, observer: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Subscription {
        self.subscribe_arc(Arc::new(observer))
    }

    /// Observe only events naming `id`.
    pub fn subscribe_entity(
        &self,
        id: impl Into<String>,
        observer: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = id.into();
        self.subscribe(move |event| {
            if event.contains(&id) {
                observer(event);
            }
        })
    }

    pub fn subscribe_arc(&self, observer: Observer) -> Subscription {
        let id = {
            let mut next = self.inner.next_id.lock();
            *next += 1;
            *next
        };
        self.inner.observers.lock().push((id, observer));

        Subscription {
            broker: Arc::downgrade(&self.inner),
            id,
            active: true,
        }
    }

    /// Hand an event to every current observer.
    pub fn dispatch(&self, event: &ChangeEvent) {
        // snapshot: observers may (un)subscribe while being called
        let observers: Vec<Observer> = self
            .inner
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();

        tracing::trace!(model = %self.model, operation = %event.operation, observers = observers.len(), "dispatching change event");

        for observer in observers {
            observer(event);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.lock().len()
    }
}

impl ChangeSink for SubscriptionBroker {
    fn deliver(&self, event: ChangeEvent) {
        self.dispatch(&event);
    }
}

impl std::fmt::Debug for SubscriptionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionBroker")
            .field("model", &self.model)
            .field("observers", &self.observer_count())
            .finish()
    }
}

/// Handle of a registered observer. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    broker: Weak<BrokerInner>,
    id: u64,
    active: bool,
}

impl Subscription {
    /// Remove the observer. Returns false when it was already gone.
    pub fn unsubscribe(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.broker.upgrade().map_or(false, |inner| inner.remove(self.id))
    }

    pub fn is_active(&self) -> bool {
        self.active && self.broker.strong_count() > 0
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
