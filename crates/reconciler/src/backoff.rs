//! Requeue policies.
//!
//! Controllers pick one policy for recorded check failures and one for
//! errors propagated to the scheduler. Both are plain data so they can be
//! set from configuration.

use std::time::Duration;

use fleet_core::config::duration_secs;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// How long to wait before the next attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequeuePolicy {
    /// Always wait the same delay.
    Fixed {
        #[serde(with = "duration_secs")]
        delay: Duration,
    },
    /// Double the delay on every consecutive failure, capped at `max`.
    Exponential {
        #[serde(with = "duration_secs")]
        base: Duration,
        #[serde(with = "duration_secs")]
        max: Duration,
        /// Add up to 10% random jitter.
        #[serde(default)]
        jitter: bool,
    },
}

impl RequeuePolicy {
    /// Fixed delay policy.
    pub const fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    /// Exponential policy without jitter.
    pub const fn exponential(base: Duration, max: Duration) -> Self {
        Self::Exponential {
            base,
            max,
            jitter: false,
        }
    }

    /// Delay for the attempt following `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential { base, max, jitter } => {
                let backoff = calculate_backoff(failures, base, max);
                if *jitter {
                    with_jitter(backoff, *max)
                } else {
                    backoff
                }
            }
        }
    }
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

fn calculate_backoff(attempt: u32, base: &Duration, max: &Duration) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    let backoff = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(backoff.min(max_ms))
}

fn with_jitter(delay: Duration, max: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    let spread = delay_ms / 10;
    if spread == 0 {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0..=spread);
    Duration::from_millis(delay_ms.saturating_add(extra)).min(max.max(delay))
}
