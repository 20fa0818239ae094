//! Scrubbing of workload objects before wrapping
//!
//! Objects read from the WDS carry server-populated fields that must not
//! travel to a WEC: identity fields tied to the WDS instance, bookkeeping the
//! destination's server will regenerate, and the whole status subtree. The
//! cleaner removes the generic fields and then applies a kind-specific filter
//! when one is registered for the object's kind.
//!
//! Filters are plain functions over the object copy; they must not consult
//! anything besides the object itself.

use std::collections::HashMap;

use kube::core::{DynamicObject, GroupVersionKind};
use serde_json::Value;

use crate::transport::gvk_of;

const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// A pure mutation removing kind-local noise from an object copy
pub type KindFilter = fn(&mut DynamicObject);

/// Removes non-portable fields from workload objects before wrapping
pub struct ObjectCleaner {
    filters: HashMap<GroupVersionKind, KindFilter>,
}

impl Default for ObjectCleaner {
    fn default() -> Self {
        Self::with_builtin_filters()
    }
}

impl ObjectCleaner {
    /// A cleaner with the built-in filters for Service, ServiceAccount and Job
    pub fn with_builtin_filters() -> Self {
        let mut cleaner = Self {
            filters: HashMap::new(),
        };
        cleaner.register(
            GroupVersionKind::gvk("", "v1", "Service"),
            clean_service as KindFilter,
        );
        cleaner.register(
            GroupVersionKind::gvk("", "v1", "ServiceAccount"),
            clean_service_account as KindFilter,
        );
        cleaner.register(
            GroupVersionKind::gvk("batch", "v1", "Job"),
            clean_job as KindFilter,
        );
        cleaner
    }

    /// Register a filter for one kind, replacing any previous registration
    pub fn register(&mut self, gvk: GroupVersionKind, filter: KindFilter) {
        self.filters.insert(gvk, filter);
    }

    /// Return a scrubbed copy of the given object; the input is not touched
    pub fn clean(&self, object: &DynamicObject) -> DynamicObject {
        let mut object = object.clone();
        object.metadata.managed_fields = None;
        object.metadata.finalizers = None;
        object.metadata.generation = None;
        object.metadata.owner_references = None;
        object.metadata.self_link = None;
        object.metadata.resource_version = None;
        object.metadata.uid = None;
        object.metadata.generate_name = None;

        if let Some(annotations) = &mut object.metadata.annotations {
            annotations.remove(LAST_APPLIED_ANNOTATION);
        }

        if let Some(content) = object.data.as_object_mut() {
            content.remove("status");
        }

        if let Some(gvk) = object.types.as_ref().and_then(gvk_of) {
            if let Some(filter) = self.filters.get(&gvk) {
                filter(&mut object);
            }
        }

        object
    }
}

/// Drops the cluster-allocated networking identity of a Service
fn clean_service(object: &mut DynamicObject) {
    if let Some(spec) = object.data.get_mut("spec").and_then(Value::as_object_mut) {
        for field in [
            "clusterIP",
            "clusterIPs",
            "ipFamilies",
            "ipFamilyPolicy",
            "internalTrafficPolicy",
        ] {
            spec.remove(field);
        }
        if let Some(ports) = spec.get_mut("ports").and_then(Value::as_array_mut) {
            for port in ports.iter_mut().filter_map(Value::as_object_mut) {
                port.remove("nodePort");
            }
        }
    }
}

/// Drops the token secret references the source cluster attached
fn clean_service_account(object: &mut DynamicObject) {
    if let Some(content) = object.data.as_object_mut() {
        content.remove("secrets");
    }
}

/// Drops the controller-uid wiring the source job controller added
fn clean_job(object: &mut DynamicObject) {
    const UID_LABELS: [&str; 2] = ["controller-uid", "batch.kubernetes.io/controller-uid"];
    if let Some(labels) = &mut object.metadata.labels {
        for label in UID_LABELS {
            labels.remove(label);
        }
    }
    if let Some(match_labels) = object
        .data
        .pointer_mut("/spec/selector/matchLabels")
        .and_then(Value::as_object_mut)
    {
        for label in UID_LABELS {
            match_labels.remove(label);
        }
    }
    if let Some(labels) = object
        .data
        .pointer_mut("/spec/template/metadata/labels")
        .and_then(Value::as_object_mut)
    {
        for label in UID_LABELS {
            labels.remove(label);
        }
    }
}
