//! Deduplicating work queue keyed by object.
//!
//! A key is never handed out twice at once: adds while it is queued are
//! merged, adds while it is processing mark it dirty and it is queued again
//! once the worker calls [`WorkQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use fleet_store::ObjectKey;
use tokio::sync::{Mutex, Notify};
use tracing::trace;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
    shutting_down: bool,
}

impl QueueState {
    fn push(&mut self, key: ObjectKey) -> bool {
        if self.shutting_down || self.queued.contains(&key) {
            return false;
        }
        if self.processing.contains(&key) {
            self.dirty.insert(key);
            return false;
        }
        self.queued.insert(key.clone());
        self.pending.push_back(key);
        true
    }
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue `key` unless it is already waiting.
    pub async fn add(&self, key: ObjectKey) {
        let pushed = self.state.lock().await.push(key);
        if pushed {
            self.notify.notify_one();
        }
    }

    /// Queue `key` after `delay`.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            queue.add(key).await;
        });
    }

    /// Wait for the next key and mark it as processing.
    ///
    /// Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    trace!(key = %key, "Dequeued");
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release `key`, queueing it again if it changed while processing.
    pub async fn done(&self, key: &ObjectKey) {
        let requeued = {
            let mut state = self.state.lock().await;
            state.processing.remove(key);
            state.dirty.remove(key) && state.push(key.clone())
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Consecutive failed passes recorded for `key`.
    pub async fn failures(&self, key: &ObjectKey) -> u32 {
        self.state.lock().await.failures.get(key).copied().unwrap_or(0)
    }

    /// Record a failed pass and return the count before it.
    pub async fn record_failure(&self, key: &ObjectKey) -> u32 {
        let mut state = self.state.lock().await;
        let count = state.failures.entry(key.clone()).or_insert(0);
        let before = *count;
        *count = count.saturating_add(1);
        before
    }

    /// Reset the failure count after a clean pass.
    pub async fn forget(&self, key: &ObjectKey) {
        self.state.lock().await.failures.remove(key);
    }

    /// Number of keys waiting to be handed out.
    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }

    /// Stop handing out keys and wake every waiter.
    pub async fn shutdown(&self) {
        self.state.lock().await.shutting_down = true;
        self.notify.notify_waiters();
    }
}
