//! Watch events and per-kind subscriptions.

use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::types::{DynamicObject, GroupVersionKind};

/// A change notification delivered by [`crate::Store::watch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// Object was created.
    Added(DynamicObject),
    /// Object was written; carries the previous and the new state.
    Modified {
        old: Box<DynamicObject>,
        new: Box<DynamicObject>,
    },
    /// Object was removed from the store.
    Deleted(DynamicObject),
}

impl WatchEvent {
    /// Latest known state of the object.
    pub fn object(&self) -> &DynamicObject {
        match self {
            Self::Added(obj) | Self::Deleted(obj) => obj,
            Self::Modified { new, .. } => new,
        }
    }

    /// Kind of the object the event is about.
    pub fn gvk(&self) -> &GroupVersionKind {
        &self.object().gvk
    }

    /// Short name of the event type for logging.
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Modified { .. } => "modified",
            Self::Deleted(_) => "deleted",
        }
    }
}

/// Subscription to the events of a single kind.
pub struct WatchStream {
    kind: GroupVersionKind,
    receiver: broadcast::Receiver<WatchEvent>,
}

impl WatchStream {
    /// Wrap a broadcast receiver, keeping only events of `kind`.
    pub fn new(kind: GroupVersionKind, receiver: broadcast::Receiver<WatchEvent>) -> Self {
        Self { kind, receiver }
    }

    /// The kind this stream delivers.
    pub const fn kind(&self) -> &GroupVersionKind {
        &self.kind
    }

    /// Receive the next event for this kind.
    ///
    /// Falling behind the sender yields [`Error::Lagged`] once; the stream
    /// stays usable and resumes with the oldest retained event. The missed
    /// events are gone, so callers must re-list the kind.
    pub async fn recv(&mut self) -> Result<WatchEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.gvk() == &self.kind => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Err(Error::Lagged {
                        kind: self.kind.to_string(),
                        skipped,
                    });
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::ChannelClosed),
            }
        }
    }
}
