//! Per-resource orchestrator.
//!
//! A [`Pipeline`] fetches the resource, routes it to the finalize path when it
//! is being deleted, and otherwise runs the engine's ensure steps followed by
//! the controller's ordered steps. The first step that does not proceed ends
//! the pass and its [`StepResult`] becomes the scheduler response.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_store::{GroupVersionKind, ObjectKey, Store};
use futures::future::BoxFuture;
use itertools::Itertools;
use tracing::{debug, Instrument};

use crate::check::CheckMeta;
use crate::config::ControllerConfig;
use crate::controller::Reconcile;
use crate::error::Result;
use crate::request::Request;
use crate::resource::Resource;
use crate::step::{Action, StepResult};

/// When a step that owns a check runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPolicy {
    /// Every pass.
    #[default]
    Always,
    /// Skipped while its check is verified at the current generation.
    UntilVerified,
}

/// One unit of work in a pipeline.
#[async_trait]
pub trait Step<T: Resource>: Send + Sync {
    fn name(&self) -> &str;

    /// Check this step reports on, if any.
    fn check(&self) -> Option<&str> {
        None
    }

    fn run_policy(&self) -> RunPolicy {
        RunPolicy::Always
    }

    async fn run(&self, req: &mut Request<T>) -> StepResult;
}

type StepFn<T> = dyn for<'a> Fn(&'a mut Request<T>) -> BoxFuture<'a, StepResult> + Send + Sync;

/// Adapts a closure into a [`Step`].
///
/// ```ignore
/// FnStep::new("creds", |req| Box::pin(async move {
///     req.check_succeeded("credsReady").await
/// }))
/// .check("credsReady")
/// .until_verified()
/// ```
pub struct FnStep<T: Resource> {
    name: String,
    check: Option<String>,
    policy: RunPolicy,
    f: Box<StepFn<T>>,
}

impl<T: Resource> FnStep<T> {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut Request<T>) -> BoxFuture<'a, StepResult> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: None,
            policy: RunPolicy::Always,
            f: Box::new(f),
        }
    }

    /// Name the check this step reports on.
    #[must_use]
    pub fn check(mut self, check: impl Into<String>) -> Self {
        self.check = Some(check.into());
        self
    }

    #[must_use]
    pub const fn run_policy(mut self, policy: RunPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Shorthand for [`RunPolicy::UntilVerified`].
    #[must_use]
    pub const fn until_verified(self) -> Self {
        self.run_policy(RunPolicy::UntilVerified)
    }
}

#[async_trait]
impl<T: Resource> Step<T> for FnStep<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self) -> Option<&str> {
        self.check.as_deref()
    }

    fn run_policy(&self) -> RunPolicy {
        self.policy
    }

    async fn run(&self, req: &mut Request<T>) -> StepResult {
        (self.f)(req).await
    }
}

/// Ordered steps plus the finalize path for one kind.
pub struct Pipeline<T: Resource> {
    store: Arc<dyn Store>,
    config: Arc<ControllerConfig>,
    steps: Vec<Box<dyn Step<T>>>,
    finalize_steps: Vec<Box<dyn Step<T>>>,
    restart: Option<Box<dyn Step<T>>>,
    check_list: Vec<CheckMeta>,
    finalizers: Vec<String>,
}

impl<T: Resource> Pipeline<T> {
    pub fn new(store: Arc<dyn Store>, config: ControllerConfig) -> Self {
        let finalizers = vec![config.finalizer.clone()];
        Self {
            store,
            config: Arc::new(config),
            steps: Vec::new(),
            finalize_steps: Vec::new(),
            restart: None,
            check_list: Vec::new(),
            finalizers,
        }
    }

    /// Append a step to the normal path.
    #[must_use]
    pub fn step(mut self, step: impl Step<T> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Append a step to the finalize path, run before owned resources are
    /// cleaned up.
    #[must_use]
    pub fn finalize_step(mut self, step: impl Step<T> + 'static) -> Self {
        self.finalize_steps.push(Box::new(step));
        self
    }

    /// Hook run when the restart annotation is present.
    #[must_use]
    pub fn on_restart(mut self, step: impl Step<T> + 'static) -> Self {
        self.restart = Some(Box::new(step));
        self
    }

    /// Display metadata for a check. Checks named by steps but not described
    /// here get a default entry.
    #[must_use]
    pub fn check_meta(mut self, meta: CheckMeta) -> Self {
        self.check_list.push(meta);
        self
    }

    /// Extra finalizer token to manage besides the configured one.
    #[must_use]
    pub fn finalizer(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.finalizers.contains(&name) {
            self.finalizers.push(name);
        }
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Declared metas, then one for every remaining step check, in step order.
    pub fn check_metas(&self) -> Vec<CheckMeta> {
        let declared = self.check_list.iter().map(|m| m.name.as_str()).collect_vec();
        let implied = self
            .steps
            .iter()
            .filter_map(|step| step.check())
            .filter(|check| !declared.contains(check))
            .unique()
            .map(CheckMeta::new)
            .collect_vec();
        self.check_list.iter().cloned().chain(implied).collect()
    }

    async fn reconcile_normal(&self, req: &mut Request<T>) -> StepResult {
        let result = req.clear_status_if_annotated().await;
        if !result.should_proceed() {
            return result;
        }

        let result = self.restart_if_annotated(req).await;
        if !result.should_proceed() {
            return result;
        }

        let result = req.ensure_check_list(self.check_metas()).await;
        if !result.should_proceed() {
            return result;
        }

        let result = req.ensure_labels_and_annotations().await;
        if !result.should_proceed() {
            return result;
        }

        let result = req.ensure_finalizers(&self.finalizers).await;
        if !result.should_proceed() {
            return result;
        }

        let result = run_steps(&self.steps, req).await;
        if !result.should_proceed() {
            return result;
        }

        let result = req.mark_ready().await;
        if !result.should_proceed() {
            return result;
        }

        match self.config.drift_interval {
            Some(interval) => StepResult::done().requeue_after(interval),
            None => StepResult::done(),
        }
    }

    async fn restart_if_annotated(&self, req: &mut Request<T>) -> StepResult {
        let annotation = self.config.restart_annotation.clone();
        if !req.has_annotation(&annotation) {
            return StepResult::next();
        }

        if let Some(hook) = &self.restart {
            let result = hook
                .run(req)
                .instrument(tracing::info_span!("restart", step = hook.name()))
                .await;
            if !result.should_proceed() {
                return result;
            }
        }

        match req.remove_annotation(&annotation).await {
            Ok(()) => StepResult::done().requeue_after(std::time::Duration::ZERO),
            Err(e) => req.write_failed(e),
        }
    }

    async fn reconcile_deleting(&self, req: &mut Request<T>) -> StepResult {
        if !req.has_finalizers(&self.finalizers) {
            debug!(key = %req.key(), "Deleting without our finalizers, nothing to do");
            return StepResult::done();
        }

        let result = run_steps(&self.finalize_steps, req).await;
        if !result.should_proceed() {
            return result;
        }

        let result = req.cleanup_owned_resources().await;
        if !result.should_proceed() {
            return result;
        }

        req.finalize(&self.finalizers).await
    }
}

async fn run_steps<T: Resource>(steps: &[Box<dyn Step<T>>], req: &mut Request<T>) -> StepResult {
    for step in steps {
        if step.run_policy() == RunPolicy::UntilVerified {
            if let Some(check) = step.check() {
                if req.object().status().is_verified(check, req.generation()) {
                    debug!(step = step.name(), check, "Check verified, skipping");
                    continue;
                }
            }
        }

        let result = step
            .run(req)
            .instrument(tracing::debug_span!("step", step = step.name()))
            .await;
        if !result.should_proceed() {
            return result;
        }
    }
    StepResult::next()
}

#[async_trait]
impl<T: Resource> Reconcile for Pipeline<T> {
    fn kind(&self) -> GroupVersionKind {
        T::gvk()
    }

    async fn reconcile(&self, key: &ObjectKey, attempt: u32) -> Result<Action> {
        let object = match self.store.get(&T::gvk(), key).await {
            Ok(object) => object,
            Err(e) if e.is_not_found() => {
                debug!(key = %key, "Resource gone, nothing to do");
                return Ok(Action::AwaitChange);
            }
            Err(e) => return Err(e.into()),
        };

        let mut req: Request<T> =
            Request::new(self.store.clone(), self.config.clone(), object)?.with_attempt(attempt);
        req.pre_reconcile();

        let result = if req.object().metadata().is_deleting() {
            self.reconcile_deleting(&mut req).await
        } else {
            self.reconcile_normal(&mut req).await
        };

        req.post_reconcile(&result);
        result.into_response()
    }
}
