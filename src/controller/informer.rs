//! Watch/cache layer.
//!
//! An [`Informer`] keeps a local mirror of one resource kind synchronised by
//! list-then-watch and fans changes out to registered [`EventHandler`]s as
//! add/update/delete callbacks. Watch disconnects are handled by the kube
//! watcher, which backs off and relists; a relist replaces the cache and the
//! differences against the previous contents are delivered as callbacks.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource, ResourceExt};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::common::ObjectKey;
use crate::controller::error::{Error, Result};

/// Callbacks invoked by an informer. They run on the watch task and must not
/// block beyond cache reads and queue pushes.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, _obj: &K) {}
    fn on_update(&self, _old: &K, _new: &K) {}
    fn on_delete(&self, _obj: &K) {}
}

/// Key-based read access to a cache of objects.
pub trait ObjectStore<K>: Send + Sync {
    fn get_by_key(&self, key: &str) -> Result<Option<Arc<K>>>;
}

/// Local mirror of one resource kind.
pub struct Cache<K> {
    items: RwLock<HashMap<ObjectKey, Arc<K>>>,
    synced: watch::Sender<bool>,
}

impl<K> Default for Cache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Cache<K> {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            synced: watch::Sender::new(false),
        }
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.items.read().get(key).cloned()
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.items.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the initial list has completed.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until the initial list has completed.
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|synced| *synced).await;
    }

    fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    fn insert(&self, key: ObjectKey, obj: Arc<K>) -> Option<Arc<K>> {
        self.items.write().insert(key, obj)
    }

    fn remove(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.items.write().remove(key)
    }

    fn replace(&self, items: HashMap<ObjectKey, Arc<K>>) -> HashMap<ObjectKey, Arc<K>> {
        std::mem::replace(&mut *self.items.write(), items)
    }
}

impl<K: Send + Sync> ObjectStore<K> for Cache<K> {
    fn get_by_key(&self, key: &str) -> Result<Option<Arc<K>>> {
        let key = ObjectKey::parse(key)?;
        Ok(self.get(&key))
    }
}

/// Change computed from a watch event, delivered after the cache is updated.
enum Change<K> {
    Added(Arc<K>),
    Updated(Arc<K>, Arc<K>),
    Deleted(Arc<K>),
}

/// List/watch driven cache for one resource kind plus its callbacks.
pub struct Informer<K> {
    kind: &'static str,
    cache: Arc<Cache<K>>,
    handlers: Vec<Arc<dyn EventHandler<K>>>,
    /// Objects collected between `Init` and `InitDone` of a (re)list.
    relist: Option<HashMap<ObjectKey, Arc<K>>>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    pub fn new() -> Self {
        Self {
            kind: std::any::type_name::<K>()
                .rsplit("::")
                .next()
                .unwrap_or("object"),
            cache: Arc::new(Cache::new()),
            handlers: Vec::new(),
            relist: None,
        }
    }

    /// Shared handle to the cache maintained by this informer.
    pub fn cache(&self) -> Arc<Cache<K>> {
        Arc::clone(&self.cache)
    }

    pub fn add_event_handler(&mut self, handler: Arc<dyn EventHandler<K>>) {
        self.handlers.push(handler);
    }

    /// Apply one watch event to the cache and run the callbacks.
    pub fn handle_event(&mut self, event: Event<K>) {
        for change in self.apply(event) {
            self.dispatch(&change);
        }
    }

    fn apply(&mut self, event: Event<K>) -> Vec<Change<K>> {
        match event {
            Event::Init => {
                debug!(kind = self.kind, "Listing");
                self.relist = Some(HashMap::new());
                Vec::new()
            }
            Event::InitApply(obj) => {
                let Some(key) = self.key_of(&obj) else {
                    return Vec::new();
                };
                self.relist
                    .get_or_insert_with(HashMap::new)
                    .insert(key, Arc::new(obj));
                Vec::new()
            }
            Event::InitDone => {
                let fresh = self.relist.take().unwrap_or_default();
                let mut changes = Vec::new();
                for (key, obj) in &fresh {
                    match self.cache.get(key) {
                        Some(old) if !same_version(old.as_ref(), obj.as_ref()) => {
                            changes.push(Change::Updated(old, Arc::clone(obj)));
                        }
                        Some(_) => {}
                        None => changes.push(Change::Added(Arc::clone(obj))),
                    }
                }
                let stale = self.cache.replace(fresh);
                for (key, old) in stale {
                    if self.cache.get(&key).is_none() {
                        changes.push(Change::Deleted(old));
                    }
                }
                if !self.cache.has_synced() {
                    info!(kind = self.kind, objects = self.cache.len(), "Cache synced");
                }
                self.cache.mark_synced();
                changes
            }
            Event::Apply(obj) => {
                let Some(key) = self.key_of(&obj) else {
                    return Vec::new();
                };
                let obj = Arc::new(obj);
                match self.cache.insert(key, Arc::clone(&obj)) {
                    Some(old) if same_version(old.as_ref(), obj.as_ref()) => Vec::new(),
                    Some(old) => vec![Change::Updated(old, obj)],
                    None => vec![Change::Added(obj)],
                }
            }
            Event::Delete(obj) => {
                let Some(key) = self.key_of(&obj) else {
                    return Vec::new();
                };
                let last_known = self.cache.remove(&key).unwrap_or_else(|| Arc::new(obj));
                vec![Change::Deleted(last_known)]
            }
        }
    }

    fn dispatch(&self, change: &Change<K>) {
        for handler in &self.handlers {
            match change {
                Change::Added(obj) => handler.on_add(obj),
                Change::Updated(old, new) => handler.on_update(old, new),
                Change::Deleted(obj) => handler.on_delete(obj),
            }
        }
    }

    fn key_of(&self, obj: &K) -> Option<ObjectKey> {
        let key = ObjectKey::from_resource(obj);
        if key.is_none() {
            warn!(kind = self.kind, "Dropping event for object without a name");
        }
        key
    }

    /// Run list/watch until the token is cancelled.
    pub async fn run(mut self, api: Api<K>, config: WatcherConfig, token: CancellationToken) {
        info!(kind = self.kind, "Starting informer");
        let mut stream = watcher::watcher(api, config).default_backoff().boxed();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(event)) => self.handle_event(event),
                    Some(Err(e)) => warn!(kind = self.kind, error = %e, "Watch error, relisting"),
                    None => {
                        warn!(kind = self.kind, "Watch stream ended");
                        break;
                    }
                },
            }
        }
        info!(kind = self.kind, "Informer stopped");
    }
}

impl<K> Default for Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    fn default() -> Self {
        Self::new()
    }
}

fn same_version<K: ResourceExt>(old: &K, new: &K) -> bool {
    match (old.resource_version(), new.resource_version()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Wait for every cache to finish its initial list.
///
/// Fails when the timeout elapses or shutdown is requested first.
pub async fn wait_for_cache_sync(
    syncs: Vec<(&'static str, futures::future::BoxFuture<'_, ()>)>,
    timeout: Duration,
    token: &CancellationToken,
) -> Result<()> {
    let kinds: Vec<&str> = syncs.iter().map(|(kind, _)| *kind).collect();
    let all = futures::future::join_all(syncs.into_iter().map(|(_, fut)| fut));
    tokio::select! {
        _ = all => {
            info!(kinds = ?kinds, "All caches synced");
            Ok(())
        }
        _ = tokio::time::sleep(timeout) => {
            Err(Error::CacheSync(format!("timed out after {}s", timeout.as_secs())))
        }
        _ = token.cancelled() => Err(Error::CacheSync("shutdown before sync".to_string())),
    }
}
