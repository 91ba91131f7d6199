//! Control-flow value returned by every step.

use std::time::Duration;

use crate::error::{Error, Result};

/// What the scheduler should do with a key after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do until the next accepted event.
    AwaitChange,
    /// Run again after the delay.
    Requeue(Duration),
    /// Run again after the delay, counting the pass as a failed attempt.
    Retry(Duration),
}

impl Action {
    /// Delay before the next pass, if one is scheduled.
    pub const fn delay(&self) -> Option<Duration> {
        match self {
            Self::AwaitChange => None,
            Self::Requeue(d) | Self::Retry(d) => Some(*d),
        }
    }
}

/// Outcome of a single step.
///
/// The pipeline tests [`StepResult::should_proceed`] after every step and
/// stops at the first result that says no.
#[derive(Debug, Default)]
#[must_use]
pub struct StepResult {
    proceed: bool,
    requeue_after: Option<Duration>,
    error: Option<Error>,
    failing: bool,
}

impl StepResult {
    /// Go on with the next step.
    pub fn next() -> Self {
        Self::continue_with(true)
    }

    /// Stop the pass here.
    pub fn done() -> Self {
        Self::continue_with(false)
    }

    pub fn continue_with(proceed: bool) -> Self {
        Self {
            proceed,
            ..Self::default()
        }
    }

    /// Stop the pass and hand `error` to the scheduler's backoff.
    pub fn error(error: Error) -> Self {
        Self::done().err(Some(error))
    }

    /// Schedule the next pass after `delay`.
    pub fn requeue_after(mut self, delay: Duration) -> Self {
        self.requeue_after = Some(delay);
        self
    }

    /// Attach an error. `Some` always stops the pass.
    pub fn err(mut self, error: Option<Error>) -> Self {
        if error.is_some() {
            self.proceed = false;
        }
        self.error = error;
        self
    }

    /// Mark the pass as a failed attempt so requeue policies can back off.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub const fn should_proceed(&self) -> bool {
        self.proceed && self.error.is_none()
    }

    pub const fn requeue_delay(&self) -> Option<Duration> {
        self.requeue_after
    }

    pub const fn error_ref(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub const fn is_failing(&self) -> bool {
        self.failing
    }

    /// Translate into the scheduler's response.
    ///
    /// # Errors
    ///
    /// Returns the attached error, if any.
    pub fn into_response(self) -> Result<Action> {
        if let Some(error) = self.error {
            return Err(error);
        }
        Ok(match (self.requeue_after, self.failing) {
            (None, _) => Action::AwaitChange,
            (Some(delay), false) => Action::Requeue(delay),
            (Some(delay), true) => Action::Retry(delay),
        })
    }
}
