//! Engine-owned status block.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleet_store::ObjectRef;
use serde::{Deserialize, Serialize};

use crate::check::{Check, CheckMeta};

/// Status written by the engine on every managed resource.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Status {
    pub is_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub checks: BTreeMap<String, Check>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub check_list: Vec<CheckMeta>,
    /// Ledger of dependents that must be gone before the finalizer is removed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ObjectRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<DateTime<Utc>>,
    pub observed_generation: i64,
}

impl Status {
    /// Look up a check by name.
    pub fn check(&self, name: &str) -> Option<&Check> {
        self.checks.get(name)
    }

    /// Whether `name` passed against `generation`.
    pub fn is_verified(&self, name: &str, generation: i64) -> bool {
        self.checks
            .get(name)
            .is_some_and(|c| c.is_verified(generation))
    }

    /// Whether every recorded check passed against `generation`.
    pub fn all_verified(&self, generation: i64) -> bool {
        self.checks.values().all(|c| c.is_verified(generation))
    }

    /// Wipe everything except the owned-resource ledger.
    pub fn reset(&mut self) {
        let resources = std::mem::take(&mut self.resources);
        *self = Self {
            resources,
            ..Self::default()
        };
    }
}
