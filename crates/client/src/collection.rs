//! Ordered, reloadable lists of records.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use modelsync_shared::ControllerDefinition;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::adapter::{EntityCache, ModelAdapter, Record};
use crate::error::Result;
use crate::executor::{ExecuteOptions, RequestExecutor};
use crate::reconciler::{CollectionReconciler, ReconcilerSubscription};

/// Authoritative source of a collection's contents.
#[async_trait]
pub trait CollectionLoader<R>: Send + Sync {
    async fn load(&self) -> Result<Vec<R>>;
}

/// Identity and timestamp of the most recently modified item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastUpdated {
    pub id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

pub struct Collection<R: Record> {
    items: RwLock<Vec<R>>,
    loader: Box<dyn CollectionLoader<R>>,
    cache: Option<Arc<EntityCache<R>>>,
}

impl<R: Record> Collection<R> {
    pub fn new(loader: impl CollectionLoader<R> + 'static) -> Self {
        Self {
            items: RwLock::new(Vec::new()),
            loader: Box::new(loader),
            cache: None,
        }
    }

    /// Write every reloaded item through to `cache`.
    pub fn with_cache(mut self, cache: Arc<EntityCache<R>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Snapshot of the current items.
    pub fn items(&self) -> Vec<R> {
        self.items.read().clone()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    pub fn contains_any<S: AsRef<str>>(&self, ids: &[S]) -> bool {
        self.items
            .read()
            .iter()
            .any(|item| ids.iter().any(|id| id.as_ref() == item.id()))
    }

    /// Drop items by id; returns how many were removed.
    pub fn remove<S: AsRef<str>>(&self, ids: &[S]) -> usize {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|item| !ids.iter().any(|id| id.as_ref() == item.id()));
        before - items.len()
    }

    /// Replace the contents with a fresh load.
    pub async fn reload(&self) -> Result<()> {
        let fresh = self.loader.load().await?;

        if let Some(cache) = &self.cache {
            for item in &fresh {
                cache.set(item.clone());
            }
        }

        *self.items.write() = fresh;
        Ok(())
    }

    /// The item with the latest modification time. Items without one are
    /// only picked when nothing else is timestamped; ties keep list order.
    pub fn last_updated(&self) -> LastUpdated {
        let items = self.items.read();
        let mut latest: Option<&R> = None;
        for item in items.iter() {
            match latest {
                Some(current) if item.last_modified() <= current.last_modified() => {}
                _ => latest = Some(item),
            }
        }

        latest
            .map(|item| LastUpdated {
                id: Some(item.id().to_string()),
                timestamp: item.last_modified(),
            })
            .unwrap_or_default()
    }

    /// Keep this collection in sync with the model's change events.
    ///
    /// `observer` runs after a reload that changed the latest item;
    /// `on_loading_change` brackets every reload.
    pub fn subscribe(
        self: &Arc<Self>,
        adapter: &ModelAdapter<R>,
        observer: impl Fn(&modelsync_shared::ChangeEvent) + Send + Sync + 'static,
        on_loading_change: impl Fn(bool) + Send + Sync + 'static,
    ) -> ReconcilerSubscription<R> {
        let reconciler = Arc::new(CollectionReconciler::new(self.clone(), observer, on_loading_change));
        reconciler.attach(adapter.broker())
    }
}

impl<R: Record> std::fmt::Debug for Collection<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection").field("len", &self.len()).finish_non_exhaustive()
    }
}

/// List payloads come either bare or wrapped in `{ "rows": [...] }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListBody<R> {
    Rows { rows: Vec<R> },
    Plain(Vec<R>),
}

/// Loads a collection by executing a controller.
pub struct QueryLoader {
    executor: RequestExecutor,
    controller: ControllerDefinition,
    options: ExecuteOptions,
}

impl QueryLoader {
    pub fn new(executor: RequestExecutor, controller: ControllerDefinition, options: ExecuteOptions) -> Self {
        Self {
            executor,
            controller,
            options,
        }
    }
}

#[async_trait]
impl<R> CollectionLoader<R> for QueryLoader
where
    R: Record + DeserializeOwned,
{
    async fn load(&self) -> Result<Vec<R>> {
        let body: ListBody<R> = self
            .executor
            .execute_json(&self.controller, self.options.clone())
            .await?;

        Ok(match body {
            ListBody::Rows { rows } => rows,
            ListBody::Plain(rows) => rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Document;
    use crate::testing::StaticLoader;
    use chrono::TimeZone;

    fn doc(id: &str, updated: Option<i64>) -> Document {
        let mut doc = Document::new(id);
        doc.updated_at = updated.map(|secs| Utc.timestamp_opt(secs, 0).unwrap());
        doc
    }

    #[tokio::test]
    async fn reload_replaces_items_and_fills_cache() {
        let loader = StaticLoader::new(vec![doc("1", Some(10)), doc("2", Some(20))]);
        let cache = Arc::new(EntityCache::new());
        let collection = Collection::new(loader).with_cache(cache.clone());

        collection.reload().await.unwrap();
        assert_eq!(collection.len(), 2);
        assert!(cache.get("2").is_some());

        assert!(collection.contains_any(&["2", "9"]));
        assert_eq!(collection.remove(&["2", "9"]), 1);
        assert!(!collection.contains_any(&["2"]));
    }

    #[tokio::test]
    async fn last_updated_picks_latest_timestamp() {
        let loader = StaticLoader::new(vec![doc("1", Some(10)), doc("2", Some(30)), doc("3", Some(30)), doc("4", None)]);
        let collection = Collection::new(loader);

        assert_eq!(collection.last_updated(), LastUpdated::default());

        collection.reload().await.unwrap();
        let last = collection.last_updated();
        assert_eq!(last.id.as_deref(), Some("2"));
        assert_eq!(last.timestamp, Some(Utc.timestamp_opt(30, 0).unwrap()));
    }

    #[test]
    fn list_bodies_decode_both_shapes() {
        let wrapped: ListBody<Document> = serde_json::from_str(r#"{"rows":[{"id":"1"}]}"#).unwrap();
        assert!(matches!(wrapped, ListBody::Rows { rows } if rows.len() == 1));

        let plain: ListBody<Document> = serde_json::from_str(r#"[{"id":"1"},{"id":"2"}]"#).unwrap();
        assert!(matches!(plain, ListBody::Plain(rows) if rows.len() == 2));
    }
}
