//! Transport controller - generic propagation of Binding workloads to cluster mailboxes
//!
//! The controller watches `Binding` objects in a workload description space (WDS),
//! resolves the workload objects each Binding names, folds them into a
//! transport-specific wrapped object per destination, and places those wrapped
//! objects in per-destination mailbox namespaces of an inventory-and-transport
//! space (ITS). The wrapped object's kind is decided by a pluggable [`transport::Transport`]
//! and is discovered at startup; everything downstream handles it generically.
//!
//! # Modules
//!
//! - [`crd`] - The `Binding` custom resource and its supporting types
//! - [`queue`] - Deduplicating, rate-limited work queue feeding the workers
//! - [`properties`] - Per-destination property collection and the sensitivity index
//! - [`customize`] - Per-destination template expansion of workload objects
//! - [`cleaner`] - Scrubbing of non-portable fields before wrapping
//! - [`transport`] - Transport plugin contract, identity stamping, kind discovery
//! - [`stores`] - Read-side caches over watched resources
//! - [`clients`] - Write-side clients for WDS and ITS
//! - [`controller`] - Reconciliation loops and worker management
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod cleaner;
pub mod clients;
pub mod controller;
pub mod crd;
pub mod customize;
pub mod error;
pub mod properties;
pub mod queue;
pub mod stores;
pub mod transport;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Reserved names
// =============================================================================
// Every label, annotation, finalizer and namespace the controller stamps or
// recognizes is declared here. These are wire-visible contracts shared with
// transport plugins and status consumers; changing one is a breaking change.

/// Field manager identifier used for every write this controller performs
pub const CONTROLLER_NAME: &str = "transport-controller";

/// Finalizer placed on a Binding while wrapped objects may exist on its behalf
pub const TRANSPORT_FINALIZER: &str = "transport.kubestellar.io/object-cleanup";

/// Label on a wrapped object naming the Binding it was built from
pub const ORIGIN_BINDING_LABEL: &str = "transport.kubestellar.io/originOwnerReferenceBindingKey";

/// Label on a wrapped object naming the WDS the Binding lives in
pub const ORIGIN_WDS_LABEL: &str = "transport.kubestellar.io/originWdsName";

/// Annotation on a wrapped object carrying the Binding generation it reflects
pub const ORIGIN_GENERATION_ANNOTATION: &str =
    "transport.kubestellar.io/originOwnerReferenceBindingGeneration";

/// Annotation a workload object sets to `"true"` to opt into template expansion
pub const TEMPLATE_EXPANSION_ANNOTATION: &str = "edge.kubestellar.io/expand-templates";

/// ITS namespace holding the per-destination customization property ConfigMaps
pub const PROPERTY_CONFIGMAP_NAMESPACE: &str = "customization-properties";
