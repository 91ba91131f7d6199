//! One reconcile pass over one resource.

use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use fleet_store::{DynamicObject, ObjectKey, Store};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::check::{Check, CheckMeta};
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::locals::Locals;
use crate::resource::Resource;
use crate::step::StepResult;

/// State carried through a single pass.
///
/// Holds the freshest copy of the resource; every persist refreshes it from
/// what the store returned so later writes carry the current version.
///
/// The typed spec is a read-only view. Metadata writes send the spec back
/// exactly as it was stored, including fields the typed view does not model.
pub struct Request<T: Resource> {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) config: Arc<ControllerConfig>,
    pub(crate) object: T,
    stored_spec: Value,
    locals: Locals,
    attempt: u32,
    started: Instant,
}

impl<T: Resource> Request<T> {
    /// Start a pass over `object` as fetched from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the object does not decode into `T`.
    pub fn new(
        store: Arc<dyn Store>,
        config: Arc<ControllerConfig>,
        object: DynamicObject,
    ) -> Result<Self> {
        let stored_spec = object.spec.clone();
        Ok(Self {
            store,
            config,
            object: T::from_dynamic(object)?,
            stored_spec,
            locals: Locals::new(),
            attempt: 0,
            started: Instant::now(),
        })
    }

    /// Number of consecutive failed passes before this one.
    #[must_use]
    pub const fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub const fn object(&self) -> &T {
        &self.object
    }

    pub fn object_mut(&mut self) -> &mut T {
        &mut self.object
    }

    pub fn key(&self) -> ObjectKey {
        self.object.key()
    }

    pub fn generation(&self) -> i64 {
        self.object.metadata().generation
    }

    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Write metadata and spec, then continue with the stored copy.
    ///
    /// # Errors
    ///
    /// Propagates store errors, including conflicts on stale versions.
    pub async fn persist(&mut self) -> Result<()> {
        let stored = self.store.update(self.outgoing()?).await?;
        self.refresh(stored)
    }

    /// Write the status, then continue with the stored copy.
    ///
    /// # Errors
    ///
    /// Propagates store errors, including conflicts on stale versions.
    pub async fn persist_status(&mut self) -> Result<()> {
        let stored = self.store.update_status(self.outgoing()?).await?;
        self.refresh(stored)
    }

    fn outgoing(&self) -> Result<DynamicObject> {
        let mut object = self.object.to_dynamic()?;
        object.spec = self.stored_spec.clone();
        Ok(object)
    }

    fn refresh(&mut self, stored: DynamicObject) -> Result<()> {
        self.stored_spec = stored.spec.clone();
        self.object = T::from_dynamic(stored)?;
        Ok(())
    }

    /// Stop the pass after a failed write.
    ///
    /// Conflicts are expected under concurrent writers and only requeue.
    pub fn write_failed(&self, error: Error) -> StepResult {
        if error.is_conflict() {
            warn!(key = %self.key(), error = %error, "Stale write, requeueing");
            return StepResult::done().requeue_after(self.config.conflict_requeue);
        }
        StepResult::error(error)
    }

    /// Log the start of the pass.
    pub fn pre_reconcile(&mut self) {
        self.started = Instant::now();
        info!(
            key = %self.key(),
            generation = self.generation(),
            attempt = self.attempt,
            "Reconcile started"
        );
    }

    /// Log the end of the pass.
    pub fn post_reconcile(&self, result: &StepResult) {
        let elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            key = %self.key(),
            ready = self.object.status().is_ready,
            proceed = result.should_proceed(),
            requeue_after = ?result.requeue_delay(),
            elapsed_ms,
            "Reconcile finished"
        );
    }

    /// Insert a pending check for every missing name.
    ///
    /// Stops the pass when anything was inserted so the next pass starts
    /// from the persisted list.
    pub async fn ensure_checks(&mut self, names: &[&str]) -> StepResult {
        let metas = names.iter().map(|name| CheckMeta::new(*name)).collect();
        self.ensure_check_list(metas).await
    }

    /// Like [`Self::ensure_checks`], also publishing display metadata.
    pub async fn ensure_check_list(&mut self, metas: Vec<CheckMeta>) -> StepResult {
        let generation = self.generation();
        let status = self.object.status_mut();

        let missing: Vec<String> = metas
            .iter()
            .filter(|meta| !status.checks.contains_key(&meta.name))
            .map(|meta| meta.name.clone())
            .collect();
        for name in &missing {
            status.checks.insert(name.clone(), Check::pending(generation));
        }

        let list_changed = status.check_list != metas;
        if list_changed {
            status.check_list = metas;
        }

        if missing.is_empty() && !list_changed {
            return StepResult::next();
        }

        if let Err(e) = self.persist_status().await {
            return self.write_failed(e);
        }

        if missing.is_empty() {
            StepResult::next()
        } else {
            debug!(key = %self.key(), checks = ?missing, "Initialised checks");
            StepResult::done().requeue_after(Duration::ZERO)
        }
    }

    /// Record `name` as failed and stop the pass.
    ///
    /// The pass is requeued by the controller's check failure policy without
    /// raising an error; chain `.err(Some(e))` to opt into error backoff.
    pub async fn check_failed(&mut self, name: &str, message: impl Into<String>) -> StepResult {
        let message = message.into();
        let generation = self.generation();
        warn!(key = %self.key(), check = name, generation, message = %message, "Check failed");

        let check = Check::failed(generation, message.clone());
        let summary = format!("{name}: {message}");
        let status = self.object.status_mut();
        let changed = status.checks.get(name) != Some(&check)
            || status.is_ready
            || status.message.as_deref() != Some(summary.as_str());

        if changed {
            status.checks.insert(name.to_string(), check);
            status.is_ready = false;
            status.message = Some(summary);
            if let Err(e) = self.persist_status().await {
                return self.write_failed(e);
            }
        }

        StepResult::done()
            .requeue_after(self.config.check_failed_requeue.delay(self.attempt))
            .failing()
    }

    /// Record `name` as passed and continue.
    pub async fn check_succeeded(&mut self, name: &str) -> StepResult {
        let check = Check::passed(self.generation());
        self.set_check(name, check).await
    }

    /// Record `name` as still converging, e.g. while waiting on a dependent.
    pub async fn check_in_progress(
        &mut self,
        name: &str,
        message: impl Into<String>,
        retry_after: Duration,
    ) -> StepResult {
        let check = Check::in_progress(self.generation(), message);
        let status = self.object.status_mut();
        if status.checks.get(name) != Some(&check) || status.is_ready {
            status.checks.insert(name.to_string(), check);
            status.is_ready = false;
            if let Err(e) = self.persist_status().await {
                return self.write_failed(e);
            }
        }
        StepResult::done().requeue_after(retry_after)
    }

    async fn set_check(&mut self, name: &str, check: Check) -> StepResult {
        let status = self.object.status_mut();
        if status.checks.get(name) == Some(&check) {
            return StepResult::next();
        }
        status.checks.insert(name.to_string(), check);
        match self.persist_status().await {
            Ok(()) => StepResult::next(),
            Err(e) => self.write_failed(e),
        }
    }

    /// Patch in the resource's required labels and annotations.
    ///
    /// Stops the pass when anything had to be written.
    pub async fn ensure_labels_and_annotations(&mut self) -> StepResult {
        let labels = self.object.ensured_labels();
        let annotations = self.object.ensured_annotations();
        let metadata = self.object.metadata_mut();

        let mut changed = false;
        for (key, value) in labels {
            if metadata.labels.get(&key) != Some(&value) {
                metadata.labels.insert(key, value);
                changed = true;
            }
        }
        for (key, value) in annotations {
            if metadata.annotations.get(&key) != Some(&value) {
                metadata.annotations.insert(key, value);
                changed = true;
            }
        }

        if !changed {
            return StepResult::next();
        }
        match self.persist().await {
            Ok(()) => {
                debug!(key = %self.key(), "Patched labels and annotations");
                StepResult::done().requeue_after(Duration::ZERO)
            }
            Err(e) => self.write_failed(e),
        }
    }

    pub fn has_annotation(&self, name: &str) -> bool {
        self.object.metadata().annotations.contains_key(name)
    }

    /// Drop an annotation and persist.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn remove_annotation(&mut self, name: &str) -> Result<()> {
        if self.object.metadata_mut().annotations.remove(name).is_some() {
            self.persist().await?;
        }
        Ok(())
    }

    /// Wipe the status (keeping the owned-resource ledger) when the
    /// clear-status annotation is present, then remove it and stop.
    pub async fn clear_status_if_annotated(&mut self) -> StepResult {
        let annotation = self.config.clear_status_annotation.clone();
        if !self.has_annotation(&annotation) {
            return StepResult::next();
        }

        info!(key = %self.key(), "Clearing status on request");
        self.object.status_mut().reset();
        if let Err(e) = self.persist_status().await {
            return self.write_failed(e);
        }
        match self.remove_annotation(&annotation).await {
            Ok(()) => StepResult::done().requeue_after(Duration::ZERO),
            Err(e) => self.write_failed(e),
        }
    }

    /// Mark the resource ready.
    ///
    /// Only writes when the ready view actually changes, so a converged
    /// resource is never touched.
    pub async fn mark_ready(&mut self) -> StepResult {
        let generation = self.generation();
        let status = self.object.status_mut();
        if status.is_ready && status.message.is_none() && status.observed_generation == generation {
            return StepResult::next();
        }

        status.is_ready = true;
        status.message = None;
        status.observed_generation = generation;
        status.last_reconcile_time = Some(Utc::now());
        match self.persist_status().await {
            Ok(()) => {
                info!(key = %self.key(), generation, "Resource ready");
                StepResult::next()
            }
            Err(e) => self.write_failed(e),
        }
    }

    /// Run a dependency call bounded by the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the call does not finish in time and
    /// [`Error::Dependency`] when it fails.
    pub async fn with_timeout<F, V, E>(&self, operation: &str, call: F) -> Result<V>
    where
        F: Future<Output = std::result::Result<V, E>>,
        E: Display,
    {
        let timeout = self.config.dependency_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::dependency(operation, e.to_string())),
            Err(_) => Err(Error::Timeout {
                operation: operation.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    pub fn set_local<V: Any + Send + Sync>(&mut self, key: impl Into<String>, value: V) {
        self.locals.set(key, value);
    }

    /// # Errors
    ///
    /// Returns an error when `key` is missing or holds another type.
    pub fn get_local<V: Any>(&self, key: &str) -> Result<&V> {
        self.locals.get(key)
    }

    pub const fn locals(&self) -> &Locals {
        &self.locals
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::check::CheckState;
    use crate::status::Status;
    use fleet_store::{DynamicObject, GroupVersionKind, InMemoryStore, ObjectMeta};
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Cache {
        metadata: ObjectMeta,
        #[serde(default)]
        spec: serde_json::Value,
        #[serde(default)]
        status: Status,
    }

    impl Resource for Cache {
        fn gvk() -> GroupVersionKind {
            GroupVersionKind::new("redis.fleet.dev", "v1", "Cache")
        }
        fn metadata(&self) -> &ObjectMeta {
            &self.metadata
        }
        fn metadata_mut(&mut self) -> &mut ObjectMeta {
            &mut self.metadata
        }
        fn status(&self) -> &Status {
            &self.status
        }
        fn status_mut(&mut self) -> &mut Status {
            &mut self.status
        }
        fn ensured_labels(&self) -> BTreeMap<String, String> {
            BTreeMap::from([("app".to_string(), "redis".to_string())])
        }
    }

    async fn request(store: &Arc<InMemoryStore>) -> Request<Cache> {
        let created = store
            .create(DynamicObject::new(Cache::gvk(), ObjectMeta::new("apps", "cache1")))
            .await
            .unwrap();
        let store: Arc<dyn Store> = store.clone();
        Request::new(store, Arc::new(ControllerConfig::new("redis")), created).unwrap()
    }

    #[tokio::test]
    async fn test_ensure_checks_inserts_then_stops() {
        let store = InMemoryStore::new_arc();
        let mut req = request(&store).await;

        let first = req.ensure_checks(&["a", "b"]).await;
        assert!(!first.should_proceed());
        assert_eq!(req.object().status().checks.len(), 2);

        let writes = store.writes();
        let second = req.ensure_checks(&["a", "b"]).await;
        assert!(second.should_proceed());
        assert_eq!(store.writes(), writes);
    }

    #[tokio::test]
    async fn test_check_failed_is_not_an_error() {
        let store = InMemoryStore::new_arc();
        let mut req = request(&store).await;

        let result = req.check_failed("userReady", "dial timeout").await;
        assert!(!result.should_proceed());
        assert!(result.error_ref().is_none());
        assert!(result.is_failing());

        let check = req.object().status().check("userReady").cloned().unwrap();
        assert_eq!(check.state, CheckState::Errored);
        assert_eq!(check.message, "dial timeout");
        assert!(!req.object().status().is_ready);
    }

    #[tokio::test]
    async fn test_repeated_failure_is_written_once() {
        let store = InMemoryStore::new_arc();
        let mut req = request(&store).await;

        let _ = req.check_failed("userReady", "dial timeout").await;
        let writes = store.writes();
        let _ = req.check_failed("userReady", "dial timeout").await;
        assert_eq!(store.writes(), writes);
    }

    #[tokio::test]
    async fn test_check_in_progress_clears_readiness() {
        let store = InMemoryStore::new_arc();
        let mut req = request(&store).await;
        assert!(req.mark_ready().await.should_proceed());

        let result = req
            .check_in_progress("replicasReady", "1/3 replicas", Duration::from_secs(2))
            .await;
        assert!(!result.should_proceed());
        assert_eq!(result.requeue_delay(), Some(Duration::from_secs(2)));
        assert!(!req.object().status().is_ready);

        let stored = Cache::from_dynamic(store.get(&Cache::gvk(), &req.key()).await.unwrap()).unwrap();
        assert!(!stored.status.is_ready);
        assert_eq!(
            stored.status.check("replicasReady").map(|c| c.state),
            Some(CheckState::UnderReconciliation)
        );

        // Already recorded and not ready: no further writes.
        let writes = store.writes();
        let _ = req
            .check_in_progress("replicasReady", "1/3 replicas", Duration::from_secs(2))
            .await;
        assert_eq!(store.writes(), writes);
    }

    #[tokio::test]
    async fn test_check_failed_can_propagate() {
        let store = InMemoryStore::new_arc();
        let mut req = request(&store).await;

        let result = req
            .check_failed("userReady", "bad password")
            .await
            .err(Some(Error::check_failed("userReady", "bad password")));
        assert!(result.into_response().is_err());
    }

    #[tokio::test]
    async fn test_labels_are_patched_once() {
        let store = InMemoryStore::new_arc();
        let mut req = request(&store).await;

        let first = req.ensure_labels_and_annotations().await;
        assert!(!first.should_proceed());
        let stored = store.get(&Cache::gvk(), &req.key()).await.unwrap();
        assert_eq!(stored.metadata.labels.get("app").map(String::as_str), Some("redis"));

        assert!(req.ensure_labels_and_annotations().await.should_proceed());
    }

    #[tokio::test]
    async fn test_metadata_write_keeps_stored_spec() {
        let store = InMemoryStore::new_arc();
        let created = store
            .create(
                DynamicObject::new(Cache::gvk(), ObjectMeta::new("apps", "cache1"))
                    .with_spec(serde_json::json!({"maxMemory": "1gb"})),
            )
            .await
            .unwrap();
        let dyn_store: Arc<dyn Store> = store.clone();
        let mut req: Request<Cache> =
            Request::new(dyn_store, Arc::new(ControllerConfig::new("redis")), created).unwrap();

        // A local edit of the typed spec is never written back.
        req.object_mut().spec = serde_json::json!({"maxMemory": "2gb"});
        assert!(!req.ensure_labels_and_annotations().await.should_proceed());

        let stored = store.get(&Cache::gvk(), &req.key()).await.unwrap();
        assert_eq!(stored.spec, serde_json::json!({"maxMemory": "1gb"}));
        assert_eq!(stored.metadata.generation, 1);
    }

    #[tokio::test]
    async fn test_mark_ready_is_equality_guarded() {
        let store = InMemoryStore::new_arc();
        let mut req = request(&store).await;

        assert!(req.mark_ready().await.should_proceed());
        assert!(req.object().status().is_ready);
        let writes = store.writes();

        assert!(req.mark_ready().await.should_proceed());
        assert_eq!(store.writes(), writes);
    }

    #[tokio::test]
    async fn test_stale_request_requeues_on_conflict() {
        let store = InMemoryStore::new_arc();
        let mut req = request(&store).await;

        // Someone else writes first.
        let mut other = store.get(&Cache::gvk(), &req.key()).await.unwrap();
        other.status = serde_json::json!({"isReady": false, "message": "elsewhere"});
        store.update_status(other).await.unwrap();

        let result = req.check_succeeded("a").await;
        assert!(!result.should_proceed());
        assert!(result.error_ref().is_none());
        assert_eq!(result.requeue_delay(), Some(req.config().conflict_requeue));
    }

    #[tokio::test]
    async fn test_with_timeout() {
        let store = InMemoryStore::new_arc();
        let mut req = request(&store).await;
        req.config = Arc::new(
            ControllerConfig::new("redis").dependency_timeout(Duration::from_millis(10)),
        );

        let slow = req
            .with_timeout("ping", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(slow, Err(Error::Timeout { .. })));

        let failed = req
            .with_timeout("ping", async { Err::<(), _>("connection refused") })
            .await;
        assert!(matches!(failed, Err(Error::Dependency { .. })));
    }

    #[tokio::test]
    async fn test_locals_are_scoped_to_request() {
        let store = InMemoryStore::new_arc();
        let mut req = request(&store).await;
        req.set_local("creds", "s3cret".to_string());
        assert!(req.get_local::<String>("creds").is_ok());

        let fresh = request_for_existing(&store, &req.key()).await;
        assert!(fresh.get_local::<String>("creds").is_err());
    }

    async fn request_for_existing(store: &Arc<InMemoryStore>, key: &ObjectKey) -> Request<Cache> {
        let object = store.get(&Cache::gvk(), key).await.unwrap();
        let store: Arc<dyn Store> = store.clone();
        Request::new(store, Arc::new(ControllerConfig::new("redis")), object).unwrap()
    }
}
