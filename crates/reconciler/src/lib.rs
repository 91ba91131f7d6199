//! Check-based declarative reconciliation engine for the fleet controllers.
//!
//! Every controller describes its work as an ordered list of steps. Each pass
//! re-derives what still needs doing from the persisted checks instead of
//! remembering it, so passes can be repeated, interrupted or duplicated and
//! still converge:
//!
//! - **Checks**: named sub-goals in `status.checks`, trusted only for the
//!   generation they were evaluated against
//! - **Steps**: return a [`StepResult`]; the first one that does not proceed
//!   ends the pass
//! - **Locals**: per-pass scratch values shared between steps, never persisted
//! - **Finalizers**: hold deletion until every owned dependent is gone
//! - **Event filter**: drops the engine's own status writes so a converged
//!   resource stays quiet
//!
//! # Pass order
//!
//! ```text
//! fetch -> deleting? -> finalize steps -> cleanup owned -> remove finalizers
//!       -> clear-status -> restart -> ensure checks -> labels/annotations
//!       -> finalizers -> steps -> mark ready
//! ```
//!
//! # Example
//!
//! ```ignore
//! use fleet_reconciler::{Controller, ControllerConfig, FnStep, Pipeline, Shutdown};
//! use fleet_store::{GroupVersionKind, InMemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> fleet_reconciler::Result<()> {
//!     let store = InMemoryStore::new_arc();
//!     let config = ControllerConfig::new("mysql-service");
//!
//!     let pipeline = Pipeline::<Database>::new(store.clone(), config.clone())
//!         .step(FnStep::new("creds", |req| Box::pin(async move {
//!             req.check_succeeded("credsReady").await
//!         })).check("credsReady").until_verified());
//!
//!     let shutdown = Shutdown::new();
//!     shutdown.install_signal_handlers();
//!
//!     Controller::new(store, pipeline, config)
//!         .owns(GroupVersionKind::new("", "v1", "Secret"))
//!         .run(shutdown.subscribe())
//!         .await
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod backoff;
pub mod check;
pub mod config;
pub mod controller;
pub mod error;
pub mod filter;
mod finalizer;
pub mod labels;
pub mod locals;
pub mod pipeline;
pub mod queue;
pub mod request;
pub mod resource;
pub mod shutdown;
pub mod status;
pub mod step;
pub mod telemetry;

pub use backoff::RequeuePolicy;
pub use check::{Check, CheckMeta, CheckState};
pub use config::ControllerConfig;
pub use controller::{Controller, Manager, Reconcile};
pub use error::{Error, Result};
pub use filter::{
    AcceptAll, AnnotationScope, ChangeFilter, EventFilter, Mapper, map_owned, map_owner_labels,
    map_owner_reference,
};
pub use locals::Locals;
pub use pipeline::{FnStep, Pipeline, RunPolicy, Step};
pub use queue::WorkQueue;
pub use request::Request;
pub use resource::Resource;
pub use shutdown::Shutdown;
pub use status::Status;
pub use step::{Action, StepResult};
