//! Declarative resource store used by the fleet controllers.
//!
//! Every controller watches and writes objects through the [`Store`] trait:
//!
//! - **Objects**: kind-agnostic [`DynamicObject`]s with metadata, spec and status
//! - **Generations**: bumped by the store only when the spec changes
//! - **Optimistic concurrency**: stale writes are rejected with a conflict
//! - **Two-phase deletion**: objects with finalizers are only marked for deletion
//! - **Cascade**: dependents holding an owner reference are removed with their owner
//! - **Watch**: per-kind streams of added / modified / deleted events
//!
//! # Example
//!
//! ```ignore
//! use fleet_store::{DynamicObject, GroupVersionKind, InMemoryStore, ObjectMeta, Store};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = InMemoryStore::new();
//!     let kind = GroupVersionKind::new("mysql.fleet.dev", "v1", "Database");
//!     let mut watch = store.watch(&kind);
//!
//!     store
//!         .create(DynamicObject::new(kind, ObjectMeta::new("apps", "db1")))
//!         .await
//!         .ok();
//!
//!     let event = watch.recv().await;
//!     println!("Received: {:?}", event.map(|e| e.event_type()));
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod store;
pub mod types;
pub mod watch;

pub use error::{Error, Result};
pub use store::{InMemoryStore, Store, TracingStore};
pub use types::{
    DynamicObject, GroupVersionKind, LabelSelector, ObjectKey, ObjectMeta, ObjectRef,
    OwnerReference, Uid,
};
pub use watch::{WatchEvent, WatchStream};
