//! Controller configuration.

use std::path::Path;
use std::time::Duration;

use fleet_core::config::{duration_secs, env_override, option_duration_secs};
use serde::{Deserialize, Serialize};

use crate::backoff::RequeuePolicy;
use crate::error::{Error, Result};
use crate::labels;

/// Settings shared by every controller built on the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Controller name, used in logs and as the owner label value.
    pub name: String,

    /// Size of the worker pool.
    pub max_concurrent_reconciles: usize,

    /// Requeue policy after a recorded check failure.
    pub check_failed_requeue: RequeuePolicy,

    /// Backoff policy for errors propagated to the scheduler.
    pub error_backoff: RequeuePolicy,

    /// How often to poll while owned resources are being deleted.
    #[serde(with = "duration_secs")]
    pub cleanup_poll_interval: Duration,

    /// Delay before retrying after a stale write.
    #[serde(with = "duration_secs")]
    pub conflict_requeue: Duration,

    /// Resync period for ready resources, if any.
    #[serde(with = "option_duration_secs")]
    pub drift_interval: Option<Duration>,

    /// Timeout applied to dependency calls made through the request.
    #[serde(with = "duration_secs")]
    pub dependency_timeout: Duration,

    /// Finalizer token this controller owns.
    pub finalizer: String,

    /// Annotation that wipes all checks.
    pub clear_status_annotation: String,

    /// Annotation that triggers the restart hook.
    pub restart_annotation: String,

    /// Default log filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "controller".to_string(),
            max_concurrent_reconciles: 5,
            check_failed_requeue: RequeuePolicy::fixed(Duration::from_secs(5)),
            error_backoff: RequeuePolicy::exponential(
                Duration::from_secs(1),
                Duration::from_secs(300),
            ),
            cleanup_poll_interval: Duration::from_secs(5),
            conflict_requeue: Duration::from_secs(1),
            drift_interval: None,
            dependency_timeout: Duration::from_secs(3),
            finalizer: labels::DEFAULT_FINALIZER.to_string(),
            clear_status_annotation: labels::CLEAR_STATUS_ANNOTATION.to_string(),
            restart_annotation: labels::RESTART_ANNOTATION.to_string(),
            log_filter: "info".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Create a config with the given controller name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load from a TOML file, apply `FLEET_*` overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, an override is
    /// malformed, or the result fails [`Self::validate`].
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = fleet_core::load_toml(path)?;
        config.with_env_overrides()?.validated()
    }

    /// Defaults with `FLEET_*` overrides applied.
    ///
    /// # Errors
    ///
    /// Returns an error if an override is malformed.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()?.validated()
    }

    fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(name) = env_override::<String>("CONTROLLER_NAME")? {
            self.name = name;
        }
        if let Some(max) = env_override::<usize>("MAX_CONCURRENT_RECONCILES")? {
            self.max_concurrent_reconciles = max;
        }
        if let Some(secs) = env_override::<u64>("DRIFT_INTERVAL_SECS")? {
            self.drift_interval = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = env_override::<u64>("DEPENDENCY_TIMEOUT_SECS")? {
            self.dependency_timeout = Duration::from_secs(secs);
        }
        if let Some(filter) = env_override::<String>("LOG_FILTER")? {
            self.log_filter = filter;
        }
        Ok(self)
    }

    /// Check invariants the runtime relies on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_config("name must not be empty"));
        }
        if self.max_concurrent_reconciles == 0 {
            return Err(Error::invalid_config(
                "max_concurrent_reconciles must be at least 1",
            ));
        }
        if self.finalizer.trim().is_empty() {
            return Err(Error::invalid_config("finalizer must not be empty"));
        }
        if self.clear_status_annotation == self.restart_annotation {
            return Err(Error::invalid_config(
                "clear-status and restart annotations must differ",
            ));
        }
        Ok(())
    }

    fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }

    /// Set the worker pool size.
    #[must_use]
    pub const fn max_concurrent_reconciles(mut self, max: usize) -> Self {
        self.max_concurrent_reconciles = max;
        self
    }

    /// Set the check failure requeue policy.
    #[must_use]
    pub fn check_failed_requeue(mut self, policy: RequeuePolicy) -> Self {
        self.check_failed_requeue = policy;
        self
    }

    /// Set the error backoff policy.
    #[must_use]
    pub fn error_backoff(mut self, policy: RequeuePolicy) -> Self {
        self.error_backoff = policy;
        self
    }

    /// Set the cleanup poll interval.
    #[must_use]
    pub const fn cleanup_poll_interval(mut self, interval: Duration) -> Self {
        self.cleanup_poll_interval = interval;
        self
    }

    /// Set the drift detection period.
    #[must_use]
    pub const fn drift_interval(mut self, interval: Duration) -> Self {
        self.drift_interval = Some(interval);
        self
    }

    /// Set the dependency call timeout.
    #[must_use]
    pub const fn dependency_timeout(mut self, timeout: Duration) -> Self {
        self.dependency_timeout = timeout;
        self
    }

    /// Set the finalizer token.
    #[must_use]
    pub fn finalizer(mut self, finalizer: impl Into<String>) -> Self {
        self.finalizer = finalizer.into();
        self
    }
}
