//! Controller runtime: watch, filter, queue, worker pool.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_store::{DynamicObject, GroupVersionKind, LabelSelector, ObjectKey, Store, WatchStream};
use futures::FutureExt;
use futures::future::{BoxFuture, try_join_all};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::filter::{ChangeFilter, EventFilter, Mapper, map_owned};
use crate::queue::WorkQueue;
use crate::shutdown::wait_for;
use crate::step::Action;

/// Pause between re-list attempts after a lagged watch.
const RELIST_RETRY: Duration = Duration::from_secs(1);

/// Something that can reconcile one key of one kind.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    /// Primary kind.
    fn kind(&self) -> GroupVersionKind;

    /// Run one pass. `attempt` counts consecutive failed passes.
    async fn reconcile(&self, key: &ObjectKey, attempt: u32) -> Result<Action>;
}

struct SecondaryWatch {
    kind: GroupVersionKind,
    mapper: Mapper,
}

/// Drives a [`Reconcile`] implementation from store watch events.
pub struct Controller<R: Reconcile> {
    store: Arc<dyn Store>,
    reconciler: Arc<R>,
    config: Arc<ControllerConfig>,
    filter: Arc<dyn EventFilter>,
    watches: Vec<SecondaryWatch>,
    queue: Arc<WorkQueue>,
}

impl<R: Reconcile> Controller<R> {
    pub fn new(store: Arc<dyn Store>, reconciler: R, config: ControllerConfig) -> Self {
        Self {
            store,
            reconciler: Arc::new(reconciler),
            config: Arc::new(config),
            filter: Arc::new(ChangeFilter::new()),
            watches: Vec::new(),
            queue: WorkQueue::new(),
        }
    }

    /// Replace the primary event filter.
    #[must_use]
    pub fn with_filter(mut self, filter: impl EventFilter + 'static) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    /// Reconcile the owner whenever a dependent of `kind` changes.
    #[must_use]
    pub fn owns(self, kind: GroupVersionKind) -> Self {
        let mapper = map_owned(&self.reconciler.kind());
        self.watches(kind, mapper)
    }

    /// Reconcile whatever `mapper` returns whenever an object of `kind` changes.
    #[must_use]
    pub fn watches(mut self, kind: GroupVersionKind, mapper: Mapper) -> Self {
        self.watches.push(SecondaryWatch { kind, mapper });
        self
    }

    /// Handle to the work queue, e.g. to enqueue keys by hand.
    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Run until `shutdown` flips to `true`, then wait for in-flight passes.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the initial list
    /// fails.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.config.validate()?;
        let kind = self.reconciler.kind();
        let name = self.config.name.clone();
        info!(controller = %name, kind = %kind, workers = self.config.max_concurrent_reconciles, "Starting controller");

        let mut watchers = JoinSet::new();
        watchers.spawn(forward_primary(
            Arc::clone(&self.store),
            self.store.watch(&kind),
            Arc::clone(&self.filter),
            Arc::clone(&self.queue),
            shutdown.clone(),
        ));
        for secondary in &self.watches {
            watchers.spawn(forward_secondary(
                Arc::clone(&self.store),
                self.store.watch(&secondary.kind),
                Arc::clone(&secondary.mapper),
                Arc::clone(&self.queue),
                shutdown.clone(),
            ));
        }

        for object in self.store.list(&kind, &LabelSelector::everything(), None).await? {
            self.queue.add(object.key()).await;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_reconciles));
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                () = wait_for(&mut shutdown) => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(controller = %name, error = %e, "Reconcile task failed");
                    }
                }
                key = self.queue.next() => {
                    let Some(key) = key else { break };
                    let permit = Arc::clone(&semaphore)
                        .acquire_owned()
                        .await
                        .map_err(|e| Error::reconcile_failed(e.to_string()))?;
                    let worker = Worker {
                        reconciler: Arc::clone(&self.reconciler),
                        queue: Arc::clone(&self.queue),
                        config: Arc::clone(&self.config),
                    };
                    let span = tracing::info_span!("reconcile", controller = %name, key = %key);
                    in_flight.spawn(
                        async move {
                            worker.process(key).await;
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
            }
        }

        info!(controller = %name, in_flight = in_flight.len(), "Draining controller");
        self.queue.shutdown().await;
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(controller = %name, error = %e, "Reconcile task failed");
            }
        }
        watchers.shutdown().await;
        info!(controller = %name, "Controller stopped");
        Ok(())
    }
}

struct Worker<R: Reconcile> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue>,
    config: Arc<ControllerConfig>,
}

impl<R: Reconcile> Worker<R> {
    async fn process(&self, key: ObjectKey) {
        let attempt = self.queue.failures(&key).await;
        // A panicking pass must still release the key.
        let result = AssertUnwindSafe(self.reconciler.reconcile(&key, attempt))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(Error::reconcile_failed(panic_message(panic.as_ref()))));
        self.queue.done(&key).await;

        match result {
            Ok(Action::AwaitChange) => self.queue.forget(&key).await,
            Ok(Action::Requeue(delay)) => {
                self.queue.forget(&key).await;
                self.queue.add_after(key, delay);
            }
            Ok(Action::Retry(delay)) => {
                self.queue.record_failure(&key).await;
                debug!(key = %key, delay = ?delay, "Retrying after failed check");
                self.queue.add_after(key, delay);
            }
            Err(e) => {
                let failures = self.queue.record_failure(&key).await;
                let delay = self.config.error_backoff.delay(failures);
                error!(key = %key, error = %e, failures, delay = ?delay, "Reconcile failed");
                self.queue.add_after(key, delay);
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_default();
    format!("reconcile panicked: {detail}")
}

/// List every object of `kind` and enqueue what `map` returns for it.
///
/// Retries until the list succeeds or shutdown is requested.
async fn resync(
    store: &dyn Store,
    kind: &GroupVersionKind,
    queue: &WorkQueue,
    shutdown: &mut watch::Receiver<bool>,
    map: impl Fn(&DynamicObject) -> Option<ObjectKey>,
) {
    loop {
        match store.list(kind, &LabelSelector::everything(), None).await {
            Ok(objects) => {
                for key in objects.iter().filter_map(&map) {
                    queue.add(key).await;
                }
                info!(kind = %kind, count = objects.len(), "Re-listed after watch lag");
                return;
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "Re-list after watch lag failed");
                tokio::select! {
                    () = wait_for(shutdown) => return,
                    () = tokio::time::sleep(RELIST_RETRY) => {}
                }
            }
        }
    }
}

async fn forward_primary(
    store: Arc<dyn Store>,
    mut stream: WatchStream,
    filter: Arc<dyn EventFilter>,
    queue: Arc<WorkQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            () = wait_for(&mut shutdown) => return,
            event = stream.recv() => match event {
                Ok(event) if filter.accept(&event) => queue.add(event.object().key()).await,
                Ok(event) => debug!(key = %event.object().key(), event = event.event_type(), "Event filtered"),
                Err(e) if e.is_lagged() => {
                    warn!(error = %e, "Primary watch lagged");
                    resync(store.as_ref(), stream.kind(), &queue, &mut shutdown, |object| Some(object.key())).await;
                }
                Err(e) => {
                    warn!(error = %e, "Primary watch ended");
                    return;
                }
            },
        }
    }
}

async fn forward_secondary(
    store: Arc<dyn Store>,
    mut stream: WatchStream,
    mapper: Mapper,
    queue: Arc<WorkQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            () = wait_for(&mut shutdown) => return,
            event = stream.recv() => match event {
                Ok(event) => {
                    if let Some(key) = mapper(event.object()) {
                        queue.add(key).await;
                    }
                }
                Err(e) if e.is_lagged() => {
                    warn!(error = %e, "Secondary watch lagged");
                    resync(store.as_ref(), stream.kind(), &queue, &mut shutdown, mapper.as_ref()).await;
                }
                Err(e) => {
                    warn!(error = %e, "Secondary watch ended");
                    return;
                }
            },
        }
    }
}

type ControllerRun = Box<dyn FnOnce(watch::Receiver<bool>) -> BoxFuture<'static, Result<()>> + Send>;

/// Runs several controllers against one shutdown signal.
#[derive(Default)]
pub struct Manager {
    controllers: Vec<ControllerRun>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn add<R: Reconcile>(mut self, controller: Controller<R>) -> Self {
        let start: ControllerRun = Box::new(
            move |shutdown: watch::Receiver<bool>| -> BoxFuture<'static, Result<()>> {
                Box::pin(controller.run(shutdown))
            },
        );
        self.controllers.push(start);
        self
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Run every controller until shutdown.
    ///
    /// # Errors
    ///
    /// Returns the first controller error.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        try_join_all(
            self.controllers
                .into_iter()
                .map(|start| start(shutdown.clone())),
        )
        .await?;
        Ok(())
    }
}
