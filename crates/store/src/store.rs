//! Store trait and implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};

use crate::error::{Error, Result};
use crate::types::{DynamicObject, GroupVersionKind, LabelSelector, ObjectKey, Uid};
use crate::watch::{WatchEvent, WatchStream};

/// Capacity of the watch broadcast channel.
const WATCH_CAPACITY: usize = 1024;

/// Declarative resource store.
///
/// Writes are optimistic-concurrency checked against `metadata.resource_version`.
/// `update` never touches status and `update_status` never touches anything else.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch one object. Missing objects yield [`Error::NotFound`].
    async fn get(&self, kind: &GroupVersionKind, key: &ObjectKey) -> Result<DynamicObject>;

    /// List objects of a kind, optionally restricted to one namespace.
    async fn list(
        &self,
        kind: &GroupVersionKind,
        selector: &LabelSelector,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>>;

    /// Create a new object.
    async fn create(&self, object: DynamicObject) -> Result<DynamicObject>;

    /// Write metadata and spec. Bumps the generation when the spec changes.
    async fn update(&self, object: DynamicObject) -> Result<DynamicObject>;

    /// Write the status only. Never bumps the generation.
    async fn update_status(&self, object: DynamicObject) -> Result<DynamicObject>;

    /// Request deletion. Objects with finalizers are only marked for deletion.
    async fn delete(&self, kind: &GroupVersionKind, key: &ObjectKey) -> Result<()>;

    /// Subscribe to changes of a kind.
    fn watch(&self, kind: &GroupVersionKind) -> WatchStream;

    /// Create the object, or overwrite metadata and spec of the existing one.
    ///
    /// Finalizers already present on the stored object are kept.
    async fn apply(&self, object: DynamicObject) -> Result<DynamicObject> {
        match self.get(&object.gvk, &object.key()).await {
            Ok(existing) => {
                let mut desired = object;
                desired.metadata.resource_version = existing.metadata.resource_version;
                for finalizer in existing.metadata.finalizers {
                    if !desired.metadata.finalizers.contains(&finalizer) {
                        desired.metadata.finalizers.push(finalizer);
                    }
                }
                self.update(desired).await
            }
            Err(e) if e.is_not_found() => self.create(object).await,
            Err(e) => Err(e),
        }
    }

    /// Delete, treating a missing object as success. Returns whether it existed.
    async fn delete_if_exists(&self, kind: &GroupVersionKind, key: &ObjectKey) -> Result<bool> {
        match self.delete(kind, key).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

type ObjectId = (GroupVersionKind, ObjectKey);

#[derive(Default)]
struct Inner {
    objects: HashMap<ObjectId, DynamicObject>,
    version: u64,
}

impl Inner {
    fn next_version(&mut self) -> u64 {
        self.version = self.version.saturating_add(1);
        self.version
    }
}

/// In-memory store used by tests and local runs.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    events: broadcast::Sender<WatchEvent>,
    writes: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            events,
            writes: AtomicU64::new(0),
        }
    }
}

impl InMemoryStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new in-memory store wrapped in an Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of writes that changed stored state.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of stored objects across all kinds.
    pub async fn len(&self) -> usize {
        self.inner.read().await.objects.len()
    }

    /// Whether the store holds no objects.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.objects.is_empty()
    }

    fn publish(&self, event: WatchEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    /// Remove `id`, honouring finalizers, then cascade to owned dependents.
    fn remove_cascading(&self, inner: &mut Inner, id: ObjectId) {
        let mut worklist = vec![id];

        while let Some(id) = worklist.pop() {
            let Some(current) = inner.objects.get(&id).cloned() else {
                continue;
            };

            if !current.metadata.finalizers.is_empty() {
                if !current.metadata.is_deleting() {
                    let mut marked = current.clone();
                    marked.metadata.deletion_timestamp = Some(Utc::now());
                    marked.metadata.resource_version = inner.next_version();
                    inner.objects.insert(id, marked.clone());
                    self.record_write();
                    self.publish(WatchEvent::Modified {
                        old: Box::new(current),
                        new: Box::new(marked),
                    });
                }
                continue;
            }

            inner.objects.remove(&id);
            self.record_write();
            tracing::trace!(kind = %id.0, key = %id.1, "Object removed");

            if let Some(uid) = current.metadata.uid {
                worklist.extend(dependents_of(inner, uid));
            }
            self.publish(WatchEvent::Deleted(current));
        }
    }
}

fn dependents_of(inner: &Inner, owner: Uid) -> Vec<ObjectId> {
    inner
        .objects
        .iter()
        .filter(|(_, obj)| obj.metadata.is_owned_by(owner))
        .map(|(id, _)| id.clone())
        .collect()
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, kind: &GroupVersionKind, key: &ObjectKey) -> Result<DynamicObject> {
        let inner = self.inner.read().await;
        inner
            .objects
            .get(&(kind.clone(), key.clone()))
            .cloned()
            .ok_or_else(|| Error::not_found(kind, key))
    }

    async fn list(
        &self,
        kind: &GroupVersionKind,
        selector: &LabelSelector,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let inner = self.inner.read().await;
        let mut objects: Vec<DynamicObject> = inner
            .objects
            .iter()
            .filter(|((gvk, key), _)| {
                gvk == kind && namespace.is_none_or(|ns| key.namespace == ns)
            })
            .filter(|(_, obj)| selector.matches(&obj.metadata.labels))
            .map(|(_, obj)| obj.clone())
            .collect();
        objects.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(objects)
    }

    async fn create(&self, object: DynamicObject) -> Result<DynamicObject> {
        if object.metadata.name.is_empty() {
            return Err(Error::invalid("metadata.name is required"));
        }

        let mut inner = self.inner.write().await;
        let id = (object.gvk.clone(), object.key());
        if inner.objects.contains_key(&id) {
            return Err(Error::already_exists(&id.0, &id.1));
        }

        let mut created = object;
        created.metadata.uid = Some(Uid::new());
        created.metadata.generation = 1;
        created.metadata.resource_version = inner.next_version();
        created.metadata.creation_timestamp = Some(Utc::now());
        created.metadata.deletion_timestamp = None;

        inner.objects.insert(id, created.clone());
        self.record_write();
        self.publish(WatchEvent::Added(created.clone()));
        Ok(created)
    }

    async fn update(&self, object: DynamicObject) -> Result<DynamicObject> {
        let mut inner = self.inner.write().await;
        let id = (object.gvk.clone(), object.key());
        let existing = inner
            .objects
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(&id.0, &id.1))?;

        if object.metadata.resource_version != existing.metadata.resource_version {
            return Err(Error::conflict(
                &id.1,
                object.metadata.resource_version,
                existing.metadata.resource_version,
            ));
        }

        let mut next = existing.clone();
        next.metadata.labels = object.metadata.labels;
        next.metadata.annotations = object.metadata.annotations;
        next.metadata.finalizers = object.metadata.finalizers;
        next.metadata.owner_references = object.metadata.owner_references;
        if object.spec != existing.spec {
            next.spec = object.spec;
            next.metadata.generation = existing.metadata.generation.saturating_add(1);
        }

        if next == existing {
            return Ok(existing);
        }

        next.metadata.resource_version = inner.next_version();
        inner.objects.insert(id.clone(), next.clone());

        if next.metadata.is_deleting() && next.metadata.finalizers.is_empty() {
            self.remove_cascading(&mut inner, id);
            return Ok(next);
        }

        self.record_write();
        self.publish(WatchEvent::Modified {
            old: Box::new(existing),
            new: Box::new(next.clone()),
        });
        Ok(next)
    }

    async fn update_status(&self, object: DynamicObject) -> Result<DynamicObject> {
        let mut inner = self.inner.write().await;
        let id = (object.gvk.clone(), object.key());
        let existing = inner
            .objects
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(&id.0, &id.1))?;

        if object.metadata.resource_version != existing.metadata.resource_version {
            return Err(Error::conflict(
                &id.1,
                object.metadata.resource_version,
                existing.metadata.resource_version,
            ));
        }

        if object.status == existing.status {
            return Ok(existing);
        }

        let mut next = existing.clone();
        next.status = object.status;
        next.metadata.resource_version = inner.next_version();
        inner.objects.insert(id, next.clone());
        self.record_write();
        self.publish(WatchEvent::Modified {
            old: Box::new(existing),
            new: Box::new(next.clone()),
        });
        Ok(next)
    }

    async fn delete(&self, kind: &GroupVersionKind, key: &ObjectKey) -> Result<()> {
        let mut inner = self.inner.write().await;
        let id = (kind.clone(), key.clone());
        if !inner.objects.contains_key(&id) {
            return Err(Error::not_found(kind, key));
        }
        self.remove_cascading(&mut inner, id);
        Ok(())
    }

    fn watch(&self, kind: &GroupVersionKind) -> WatchStream {
        WatchStream::new(kind.clone(), self.events.subscribe())
    }
}

/// A wrapper that adds tracing to a store.
pub struct TracingStore<S: Store> {
    inner: S,
}

impl<S: Store> TracingStore<S> {
    /// Create a new tracing store.
    pub const fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Access the wrapped store.
    pub const fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: Store> Store for TracingStore<S> {
    async fn get(&self, kind: &GroupVersionKind, key: &ObjectKey) -> Result<DynamicObject> {
        tracing::trace!(kind = %kind, key = %key, "Getting object");
        self.inner.get(kind, key).await
    }

    async fn list(
        &self,
        kind: &GroupVersionKind,
        selector: &LabelSelector,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        tracing::trace!(kind = %kind, namespace = ?namespace, "Listing objects");
        self.inner.list(kind, selector, namespace).await
    }

    async fn create(&self, object: DynamicObject) -> Result<DynamicObject> {
        tracing::debug!(kind = %object.gvk, key = %object.key(), "Creating object");
        self.inner.create(object).await
    }

    async fn update(&self, object: DynamicObject) -> Result<DynamicObject> {
        tracing::debug!(
            kind = %object.gvk,
            key = %object.key(),
            resource_version = object.metadata.resource_version,
            "Updating object"
        );
        let result = self.inner.update(object).await;
        if let Err(ref e) = result {
            tracing::debug!(error = %e, "Update rejected");
        }
        result
    }

    async fn update_status(&self, object: DynamicObject) -> Result<DynamicObject> {
        tracing::debug!(
            kind = %object.gvk,
            key = %object.key(),
            resource_version = object.metadata.resource_version,
            "Updating status"
        );
        let result = self.inner.update_status(object).await;
        if let Err(ref e) = result {
            tracing::debug!(error = %e, "Status update rejected");
        }
        result
    }

    async fn delete(&self, kind: &GroupVersionKind, key: &ObjectKey) -> Result<()> {
        tracing::debug!(kind = %kind, key = %key, "Deleting object");
        self.inner.delete(kind, key).await
    }

    fn watch(&self, kind: &GroupVersionKind) -> WatchStream {
        self.inner.watch(kind)
    }
}
