//! Named sub-goal records kept in `status.checks`.

use serde::{Deserialize, Serialize};

/// Progress of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckState {
    /// Inserted but never evaluated.
    #[default]
    YetToBeReconciled,
    /// Evaluated and still converging.
    UnderReconciliation,
    /// Last evaluation failed.
    Errored,
    /// Last evaluation passed.
    Finished,
}

impl std::fmt::Display for CheckState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::YetToBeReconciled => "yet-to-be-reconciled",
            Self::UnderReconciliation => "under-reconciliation",
            Self::Errored => "errored",
            Self::Finished => "finished",
        };
        write!(f, "{s}")
    }
}

/// Pass/fail record of one named check, tagged with the generation it saw.
///
/// A check is only trusted for the generation it was evaluated against; see
/// [`Check::is_verified`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Check {
    pub generation: i64,
    pub status: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default)]
    pub state: CheckState,
}

impl Check {
    /// Fresh, unevaluated check for `generation`.
    pub const fn pending(generation: i64) -> Self {
        Self {
            generation,
            status: false,
            message: String::new(),
            state: CheckState::YetToBeReconciled,
        }
    }

    /// Passed check for `generation`.
    pub const fn passed(generation: i64) -> Self {
        Self {
            generation,
            status: true,
            message: String::new(),
            state: CheckState::Finished,
        }
    }

    /// Failed check for `generation`.
    pub fn failed(generation: i64, message: impl Into<String>) -> Self {
        Self {
            generation,
            status: false,
            message: message.into(),
            state: CheckState::Errored,
        }
    }

    /// Check that is still converging, e.g. waiting on a dependent.
    pub fn in_progress(generation: i64, message: impl Into<String>) -> Self {
        Self {
            generation,
            status: false,
            message: message.into(),
            state: CheckState::UnderReconciliation,
        }
    }

    /// Passed and evaluated against `generation`.
    pub const fn is_verified(&self, generation: i64) -> bool {
        self.status && self.generation == generation
    }
}

/// Display metadata for a check, listed in `status.check_list`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckMeta {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Only shown in debug views.
    #[serde(default)]
    pub debug: bool,
    /// Never shown.
    #[serde(default)]
    pub hide: bool,
}

impl CheckMeta {
    /// Metadata whose title is the check name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            title: name.clone(),
            name,
            ..Self::default()
        }
    }

    /// Set the title.
    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark as debug-only.
    #[must_use]
    pub const fn debug(mut self) -> Self {
        self.debug = true;
        self
    }

    /// Hide from every view.
    #[must_use]
    pub const fn hidden(mut self) -> Self {
        self.hide = true;
        self
    }
}
