//! Well-known label, annotation and finalizer names.

/// Default finalizer token added by the engine.
pub const DEFAULT_FINALIZER: &str = "fleet.dev/finalizer";

/// Annotation that wipes the status checks on the next pass.
pub const CLEAR_STATUS_ANNOTATION: &str = "fleet.dev/clear-status";

/// Annotation that triggers the controller's restart hook on the next pass.
pub const RESTART_ANNOTATION: &str = "fleet.dev/restart";

/// Name of the primary object, stamped on dependents.
pub const OWNER_NAME: &str = "fleet.dev/owner.name";

/// Namespace of the primary object, stamped on dependents.
pub const OWNER_NAMESPACE: &str = "fleet.dev/owner.namespace";

/// Kind of the primary object, stamped on dependents.
pub const OWNER_KIND: &str = "fleet.dev/owner.kind";

/// Controller that manages an object.
pub const MANAGED_BY: &str = "fleet.dev/managed-by";
