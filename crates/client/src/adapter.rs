//! Model adapters: per-model broker and entity cache, and the registry that
//! routes socket events to them.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use modelsync_shared::{ChangeEvent, Operation};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::broker::{ChangeSink, Subscription, SubscriptionBroker};
use crate::collection::{Collection, CollectionLoader};
use crate::error::{Error, Result};

/// An entity the client can cache and reconcile.
pub trait Record: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Last modification time: updated-at, falling back to created-at.
    fn last_modified(&self) -> Option<DateTime<Utc>>;
}

/// Schemaless record backed by a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default, alias = "_createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "_updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: None,
            updated_at: None,
            data: serde_json::Map::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.data.get(field)
    }
}

impl Record for Document {
    fn id(&self) -> &str {
        &self.id
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.updated_at.or(self.created_at)
    }
}

/// In-memory records of one model, keyed by id. Advisory only.
#[derive(Debug)]
pub struct EntityCache<R> {
    entries: RwLock<HashMap<String, R>>,
}

impl<R: Record> EntityCache<R> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &str) -> Option<R> {
        self.entries.read().get(id).cloned()
    }

    pub fn set(&self, record: R) {
        self.entries.write().insert(record.id().to_string(), record);
    }

    pub fn remove(&self, id: &str) -> Option<R> {
        self.entries.write().remove(id)
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<R: Record> Default for EntityCache<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Client-side access point of one model.
pub struct ModelAdapter<R: Record> {
    slug: String,
    broker: Arc<SubscriptionBroker>,
    cache: Arc<EntityCache<R>>,
    _eviction: Subscription,
}

impl<R: Record> ModelAdapter<R> {
    pub fn new(slug: impl Into<String>) -> Self {
        let slug = slug.into();
        let broker = Arc::new(SubscriptionBroker::new(slug.clone()));
        let cache = Arc::new(EntityCache::new());

        let eviction = {
            let cache = cache.clone();
            broker.subscribe(move |event: &ChangeEvent| {
                if event.operation == Operation::Delete {
                    for id in event.ids() {
                        cache.remove(id);
                    }
                }
            })
        };

        Self {
            slug,
            broker,
            cache,
            _eviction: eviction,
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn broker(&self) -> &Arc<SubscriptionBroker> {
        &self.broker
    }

    pub fn cache(&self) -> &Arc<EntityCache<R>> {
        &self.cache
    }

    /// Observe every change of the model.
    pub fn subscribe(&self, observer: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Subscription {
        self.broker.subscribe(observer)
    }

    /// Observe changes of a single record.
    pub fn subscribe_entity(
        &self,
        id: impl Into<String>,
        observer: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.broker.subscribe_entity(id, observer)
    }

    pub fn get(&self, id: &str) -> Option<R> {
        self.cache.get(id)
    }

    pub fn set(&self, record: R) {
        self.cache.set(record);
    }

    pub fn remove(&self, id: &str) -> Option<R> {
        self.cache.remove(id)
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// A collection of this model whose reloads also refresh the cache.
    pub fn collection(&self, loader: impl CollectionLoader<R> + 'static) -> Arc<Collection<R>> {
        Arc::new(Collection::new(loader).with_cache(self.cache.clone()))
    }
}

impl<R: Record> std::fmt::Debug for ModelAdapter<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelAdapter")
            .field("slug", &self.slug)
            .field("cached", &self.cache.len())
            .finish()
    }
}

struct Entry {
    broker: Arc<SubscriptionBroker>,
    adapter: Arc<dyn Any + Send + Sync>,
}

/// Slug to adapter map; the sink socket events are delivered to.
#[derive(Default)]
pub struct AdapterRegistry {
    models: RwLock<HashMap<String, Entry>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The adapter of `slug`, created on first use.
    pub fn register<R: Record>(&self, slug: &str) -> Result<Arc<ModelAdapter<R>>> {
        if let Some(entry) = self.models.read().get(slug) {
            return entry
                .adapter
                .clone()
                .downcast::<ModelAdapter<R>>()
                .map_err(|_| Error::ModelTypeMismatch(slug.to_string()));
        }

        let mut models = self.models.write();
        // another caller may have won the race between the two locks
        if let Some(entry) = models.get(slug) {
            return entry
                .adapter
                .clone()
                .downcast::<ModelAdapter<R>>()
                .map_err(|_| Error::ModelTypeMismatch(slug.to_string()));
        }

        let adapter = Arc::new(ModelAdapter::<R>::new(slug));
        models.insert(
            slug.to_string(),
            Entry {
                broker: adapter.broker().clone(),
                adapter: adapter.clone(),
            },
        );
        tracing::debug!(model = slug, "registered model adapter");
        Ok(adapter)
    }

    pub fn broker(&self, slug: &str) -> Option<Arc<SubscriptionBroker>> {
        self.models.read().get(slug).map(|entry| entry.broker.clone())
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.models.read().contains_key(slug)
    }

    /// Registered slugs, sorted.
    pub fn models(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self.models.read().keys().cloned().collect();
        slugs.sort();
        slugs
    }
}

impl ChangeSink for AdapterRegistry {
    fn deliver(&self, event: ChangeEvent) {
        let Some(broker) = self.broker(&event.model) else {
            tracing::debug!(model = %event.model, "dropping event for unregistered model");
            return;
        };
        broker.dispatch(&event);
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("models", &self.models())
            .finish()
    }
}
