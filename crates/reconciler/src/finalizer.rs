//! Deletion ordering: finalizers and the owned-resource ledger.
//!
//! A resource keeps its finalizers until every dependent recorded in
//! `status.resources` is gone. Same-namespace dependents additionally carry a
//! native owner reference so the store cascades them on its own.

use either::Either;
use fleet_store::{DynamicObject, ObjectRef, OwnerReference};
use futures::future::join_all;
use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::labels;
use crate::request::Request;
use crate::resource::Resource;
use crate::step::StepResult;

impl<T: Resource> Request<T> {
    /// Add any missing finalizer tokens and continue with the stored copy.
    pub async fn ensure_finalizers(&mut self, names: &[String]) -> StepResult {
        let metadata = self.object.metadata_mut();
        let missing = names
            .iter()
            .filter(|name| !metadata.finalizers.contains(name))
            .cloned()
            .collect_vec();
        if missing.is_empty() {
            return StepResult::next();
        }

        metadata.finalizers.extend(missing.iter().cloned());
        match self.persist().await {
            Ok(()) => {
                debug!(key = %self.key(), finalizers = ?missing, "Added finalizers");
                StepResult::next()
            }
            Err(e) => self.write_failed(e),
        }
    }

    /// Whether any of `names` is still present.
    pub fn has_finalizers(&self, names: &[String]) -> bool {
        self.object
            .metadata()
            .finalizers
            .iter()
            .any(|f| names.contains(f))
    }

    /// Remove this controller's finalizer tokens.
    ///
    /// Once the list is empty the store erases the object.
    pub async fn finalize(&mut self, names: &[String]) -> StepResult {
        let metadata = self.object.metadata_mut();
        let before = metadata.finalizers.len();
        metadata.finalizers.retain(|f| !names.contains(f));
        if metadata.finalizers.len() == before {
            return StepResult::done();
        }

        match self.persist().await {
            Ok(()) => {
                info!(key = %self.key(), "Finalizers removed");
                StepResult::done()
            }
            Err(e) if e.is_not_found() => StepResult::done(),
            Err(e) => self.write_failed(e),
        }
    }

    /// Controller owner reference pointing at this resource.
    ///
    /// `None` until the resource has been created in the store.
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        let metadata = self.object.metadata();
        let gvk = T::gvk();
        metadata.uid.map(|uid| OwnerReference {
            api_version: gvk.api_version(),
            kind: gvk.kind,
            name: metadata.name.clone(),
            uid,
            controller: true,
            block_owner_deletion: true,
        })
    }

    /// Record dependents in the ledger, persisting only on change.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn add_to_owned_resources(
        &mut self,
        refs: impl IntoIterator<Item = ObjectRef>,
    ) -> Result<()> {
        let status = self.object.status_mut();
        let before = status.resources.len();
        for reference in refs {
            if !status.resources.contains(&reference) {
                status.resources.push(reference);
            }
        }
        if status.resources.len() == before {
            return Ok(());
        }
        self.persist_status().await
    }

    /// Alias of [`Self::add_to_owned_resources`] for dependents the store
    /// cannot cascade, such as ones living in another namespace.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn own(&mut self, refs: impl IntoIterator<Item = ObjectRef>) -> Result<()> {
        self.add_to_owned_resources(refs).await
    }

    /// Create or update a dependent owned by this resource.
    ///
    /// The dependent is stamped with owner labels and recorded in the ledger
    /// before it is written. Same-namespace dependents also get a native owner
    /// reference.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn apply_owned(&mut self, mut dependent: DynamicObject) -> Result<DynamicObject> {
        let owner = self.object.metadata();
        dependent
            .metadata
            .labels
            .insert(labels::OWNER_NAME.to_string(), owner.name.clone());
        dependent
            .metadata
            .labels
            .insert(labels::OWNER_NAMESPACE.to_string(), owner.namespace.clone());
        dependent
            .metadata
            .labels
            .insert(labels::OWNER_KIND.to_string(), T::gvk().kind);
        dependent
            .metadata
            .labels
            .insert(labels::MANAGED_BY.to_string(), self.config.name.clone());

        if dependent.metadata.namespace == owner.namespace {
            if let Some(reference) = self.owner_reference() {
                if !dependent.metadata.is_owned_by(reference.uid) {
                    dependent.metadata.owner_references.push(reference);
                }
            }
        }

        self.add_to_owned_resources([dependent.object_ref()]).await?;
        let applied = self.store.apply(dependent).await?;
        debug!(owner = %self.key(), dependent = %applied.object_ref(), "Applied owned resource");
        Ok(applied)
    }

    /// Delete every ledger entry and wait until they are all gone.
    ///
    /// Requeues after the cleanup poll interval while any entry still existed;
    /// clears the ledger and continues once all of them resolve to not-found.
    pub async fn cleanup_owned_resources(&mut self) -> StepResult {
        let refs = self.object.status().resources.clone();
        if refs.is_empty() {
            return StepResult::next();
        }

        let store = self.store.clone();
        let outcomes = join_all(refs.iter().map(|reference| {
            let store = store.clone();
            async move {
                store
                    .delete_if_exists(&reference.gvk(), &reference.key())
                    .await
                    .map(|existed| (reference, existed))
            }
        }))
        .await;

        let (resolved, failures): (Vec<_>, Vec<_>) =
            outcomes.into_iter().partition_map(|outcome| match outcome {
                Ok(done) => Either::Left(done),
                Err(e) => Either::Right(e),
            });

        if let Some(error) = failures.into_iter().next() {
            return self.write_failed(Error::from(error));
        }

        let remaining = resolved
            .iter()
            .filter(|(_, existed)| *existed)
            .map(|(reference, _)| reference.to_string())
            .collect_vec();
        if !remaining.is_empty() {
            info!(key = %self.key(), remaining = ?remaining, "Waiting for owned resources to go away");
            return StepResult::done().requeue_after(self.config.cleanup_poll_interval);
        }

        self.object.status_mut().resources.clear();
        match self.persist_status().await {
            Ok(()) => StepResult::next(),
            Err(e) => self.write_failed(e),
        }
    }

    /// Delete every ledger entry without waiting and pass `check`.
    ///
    /// Finalizers on the dependents are stripped so they cannot block.
    pub async fn force_cleanup_owned_resources(&mut self, check: &str) -> StepResult {
        let refs = std::mem::take(&mut self.object.status_mut().resources);

        for reference in &refs {
            if let Err(e) = self.force_delete(reference).await {
                // Put the ledger back so a later pass can retry.
                self.object.status_mut().resources = refs.clone();
                return self.write_failed(e);
            }
        }

        if !refs.is_empty() {
            if let Err(e) = self.persist_status().await {
                return self.write_failed(e);
            }
            warn!(key = %self.key(), count = refs.len(), "Force-deleted owned resources");
        }
        self.check_succeeded(check).await
    }

    async fn force_delete(&self, reference: &ObjectRef) -> Result<()> {
        let gvk = reference.gvk();
        let key = reference.key();
        match self.store.get(&gvk, &key).await {
            Ok(mut dependent) if !dependent.metadata.finalizers.is_empty() => {
                dependent.metadata.finalizers.clear();
                match self.store.update(dependent).await {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        self.store.delete_if_exists(&gvk, &key).await?;
        Ok(())
    }
}
