//! Watch event predicates and secondary-to-primary mappers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use fleet_store::{DynamicObject, GroupVersionKind, ObjectKey, WatchEvent};

use crate::config::ControllerConfig;
use crate::labels;

/// Decides whether a watch event should enqueue a reconcile.
pub trait EventFilter: Send + Sync {
    fn accept(&self, event: &WatchEvent) -> bool;
}

impl<F> EventFilter for F
where
    F: Fn(&WatchEvent) -> bool + Send + Sync,
{
    fn accept(&self, event: &WatchEvent) -> bool {
        self(event)
    }
}

/// Accepts every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl EventFilter for AcceptAll {
    fn accept(&self, _event: &WatchEvent) -> bool {
        true
    }
}

/// Which annotation changes count as meaningful.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AnnotationScope {
    #[default]
    Any,
    Only(BTreeSet<String>),
}

/// Drops status-only and bookkeeping updates, including the engine's own
/// status writes.
#[derive(Debug, Clone, Default)]
pub struct ChangeFilter {
    annotations: AnnotationScope,
}

impl ChangeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only react to the clear-status and restart annotations.
    pub fn recognised_annotations(config: &ControllerConfig) -> Self {
        Self::new().annotation_scope(AnnotationScope::Only(BTreeSet::from([
            config.clear_status_annotation.clone(),
            config.restart_annotation.clone(),
        ])))
    }

    #[must_use]
    pub fn annotation_scope(mut self, scope: AnnotationScope) -> Self {
        self.annotations = scope;
        self
    }

    fn annotations_changed(
        &self,
        old: &BTreeMap<String, String>,
        new: &BTreeMap<String, String>,
    ) -> bool {
        match &self.annotations {
            AnnotationScope::Any => old != new,
            AnnotationScope::Only(keys) => keys.iter().any(|k| old.get(k) != new.get(k)),
        }
    }
}

impl EventFilter for ChangeFilter {
    fn accept(&self, event: &WatchEvent) -> bool {
        let WatchEvent::Modified { old, new } = event else {
            return true;
        };
        let (before, after) = (&old.metadata, &new.metadata);

        before.generation != after.generation
            || old.spec != new.spec
            || before.finalizers != after.finalizers
            || before.deletion_timestamp != after.deletion_timestamp
            || before.labels != after.labels
            || self.annotations_changed(&before.annotations, &after.annotations)
    }
}

/// Maps a secondary object to the primary it belongs to.
pub type Mapper = Arc<dyn Fn(&DynamicObject) -> Option<ObjectKey> + Send + Sync>;

/// Follow the native owner reference of kind `owner`.
pub fn map_owner_reference(owner: &GroupVersionKind) -> Mapper {
    let api_version = owner.api_version();
    let kind = owner.kind.clone();
    Arc::new(move |object: &DynamicObject| {
        object
            .metadata
            .owner_references
            .iter()
            .find(|r| r.kind == kind && r.api_version == api_version)
            .map(|r| ObjectKey::new(&object.metadata.namespace, &r.name))
    })
}

/// Follow the owner labels stamped on dependents of kind `owner`.
pub fn map_owner_labels(owner: &GroupVersionKind) -> Mapper {
    let kind = owner.kind.clone();
    Arc::new(move |object: &DynamicObject| {
        let owner_labels = &object.metadata.labels;
        if owner_labels.get(labels::OWNER_KIND) != Some(&kind) {
            return None;
        }
        let name = owner_labels.get(labels::OWNER_NAME)?;
        let namespace = owner_labels
            .get(labels::OWNER_NAMESPACE)
            .map_or(object.metadata.namespace.as_str(), String::as_str);
        Some(ObjectKey::new(namespace, name))
    })
}

/// Owner reference first, owner labels otherwise.
pub fn map_owned(owner: &GroupVersionKind) -> Mapper {
    let by_reference = map_owner_reference(owner);
    let by_labels = map_owner_labels(owner);
    Arc::new(move |object: &DynamicObject| by_reference(object).or_else(|| by_labels(object)))
}
