//! Custom resource definitions observed by the transport controller
//!
//! Only `Binding` is defined here. It is owned by an upstream controller; this
//! controller observes it, manages one finalizer on it, and writes its status.

mod binding;

pub use binding::{
    Binding, BindingSpec, BindingStatus, BindingWorkload, ClusterScopeRef, Destination,
    NamespaceScopeRef,
};
