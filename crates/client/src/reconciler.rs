//! Keeps a [`Collection`] consistent with the change events of its model.
//!
//! Each relevant event triggers an authoritative reload. Reloads of one
//! reconciler never overlap: while one runs, further events collapse into a
//! single trailing reload carrying the latest event. Observers are only told
//! about a reload when the most recently modified item changed, so bursts of
//! echoes of the same write notify once.

use std::sync::Arc;

use modelsync_shared::{ChangeEvent, Operation};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::adapter::Record;
use crate::broker::{Subscription, SubscriptionBroker};
use crate::collection::{Collection, LastUpdated};
use crate::error::Result;

type Observer = Box<dyn Fn(&ChangeEvent) + Send + Sync>;
type LoadingCallback = Box<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, Default)]
struct ReloadQueue {
    running: bool,
    trailing: Option<ChangeEvent>,
}

pub struct CollectionReconciler<R: Record> {
    collection: Arc<Collection<R>>,
    observer: Observer,
    on_loading_change: LoadingCallback,
    last_seen: Mutex<LastUpdated>,
    queue: Mutex<ReloadQueue>,
    idle: Notify,
}

/// Reports `false` on drop, whatever way the reload ended.
struct LoadingGuard<'a>(&'a (dyn Fn(bool) + Send + Sync));

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        (self.0)(false);
    }
}

impl<R: Record> CollectionReconciler<R> {
    pub fn new(
        collection: Arc<Collection<R>>,
        observer: impl Fn(&ChangeEvent) + Send + Sync + 'static,
        on_loading_change: impl Fn(bool) + Send + Sync + 'static,
    ) -> Self {
        Self {
            collection,
            observer: Box::new(observer),
            on_loading_change: Box::new(on_loading_change),
            last_seen: Mutex::new(LastUpdated::default()),
            queue: Mutex::new(ReloadQueue::default()),
            idle: Notify::new(),
        }
    }

    pub fn collection(&self) -> &Arc<Collection<R>> {
        &self.collection
    }

    /// Whether an event can affect the collection at all.
    pub fn should_update(&self, event: &ChangeEvent) -> bool {
        match event.operation {
            Operation::Create | Operation::Update => true,
            Operation::Delete => self.collection.contains_any(event.ids()),
        }
    }

    /// Entry point for broker dispatch. Never blocks: the reload is queued
    /// on the current tokio runtime.
    pub fn handle(self: &Arc<Self>, event: &ChangeEvent) {
        if !self.should_update(event) {
            return;
        }

        if event.operation == Operation::Delete {
            let removed = self.collection.remove(event.ids());
            tracing::trace!(model = %event.model, removed, "removed deleted items ahead of reload");
        }

        self.schedule(event.clone());
    }

    fn schedule(self: &Arc<Self>, event: ChangeEvent) {
        {
            let mut queue = self.queue.lock();
            if queue.running {
                queue.trailing = Some(event);
                return;
            }
            queue.running = true;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(self.clone().drain(event));
            }
            Err(_) => {
                tracing::warn!(model = %event.model, "no tokio runtime; skipping collection reload");
                self.queue.lock().running = false;
                self.idle.notify_waiters();
            }
        }
    }

    async fn drain(self: Arc<Self>, mut event: ChangeEvent) {
        loop {
            if let Err(err) = self.reconcile(&event).await {
                tracing::warn!(model = %event.model, error = %err, "collection reload failed");
            }

            let next = {
                let mut queue = self.queue.lock();
                let next = queue.trailing.take();
                if next.is_none() {
                    queue.running = false;
                }
                next
            };

            match next {
                Some(trailing) => event = trailing,
                None => break,
            }
        }

        self.idle.notify_waiters();
    }

    /// Reload once and notify the observer if the latest item moved.
    ///
    /// Runs outside the queue; returns whether the observer was called.
    pub async fn reconcile(&self, event: &ChangeEvent) -> Result<bool> {
        (self.on_loading_change)(true);
        let _loading = LoadingGuard(&*self.on_loading_change);

        self.collection.reload().await?;

        let latest = self.collection.last_updated();
        let changed = {
            let mut last_seen = self.last_seen.lock();
            if *last_seen != latest {
                *last_seen = latest;
                true
            } else {
                false
            }
        };

        if changed {
            (self.observer)(event);
        } else {
            tracing::debug!(model = %event.model, operation = %event.operation, "reload left latest item unchanged");
        }

        Ok(changed)
    }

    pub fn is_idle(&self) -> bool {
        !self.queue.lock().running
    }

    /// Wait until no reload is running or queued.
    pub async fn settled(&self) {
        loop {
            let notified = self.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Start receiving the broker's events.
    pub fn attach(self: &Arc<Self>, broker: &SubscriptionBroker) -> ReconcilerSubscription<R> {
        let reconciler = self.clone();
        let subscription = broker.subscribe(move |event| reconciler.handle(event));

        ReconcilerSubscription {
            subscription,
            reconciler: self.clone(),
        }
    }
}

/// Live collection subscription. Dropping it stops reconciliation; a reload
/// already running finishes.
pub struct ReconcilerSubscription<R: Record> {
    subscription: Subscription,
    reconciler: Arc<CollectionReconciler<R>>,
}

impl<R: Record> ReconcilerSubscription<R> {
    pub fn unsubscribe(&mut self) -> bool {
        self.subscription.unsubscribe()
    }

    pub fn reconciler(&self) -> &Arc<CollectionReconciler<R>> {
        &self.reconciler
    }
}
