//! Binding Custom Resource Definition
//!
//! A Binding links a set of workload objects in the WDS to a set of
//! destination clusters. The transport controller reconciles each Binding
//! into one wrapped object per destination, placed in that destination's
//! mailbox namespace in the ITS.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a Binding
///
/// The workload section names objects to propagate; the destinations section
/// names the clusters to propagate them to. Destinations form a set under
/// `clusterId` equality.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "control.kubestellar.io",
    version = "v1alpha1",
    kind = "Binding",
    plural = "bindings",
    status = "BindingStatus",
    printcolumn = r#"{"name":"ObservedGeneration","type":"integer","jsonPath":".status.observedGeneration"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BindingSpec {
    /// Workload objects to propagate
    pub workload: BindingWorkload,

    /// Destination clusters to propagate the workload to
    #[serde(default)]
    pub destinations: Vec<Destination>,
}

/// References to the workload objects of a Binding, split by scope
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BindingWorkload {
    /// Cluster-scoped workload objects, in propagation order
    #[serde(default)]
    pub cluster_scope: Vec<ClusterScopeRef>,

    /// Namespace-scoped workload objects, in propagation order
    #[serde(default)]
    pub namespace_scope: Vec<NamespaceScopeRef>,
}

/// Reference to one cluster-scoped workload object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterScopeRef {
    /// API group of the object; empty for the core group
    #[serde(default)]
    pub group: String,

    /// API version of the object
    pub version: String,

    /// Lowercase plural resource name of the object's kind
    pub resource: String,

    /// Name of the object
    pub name: String,
}

/// Reference to one namespace-scoped workload object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceScopeRef {
    /// API group of the object; empty for the core group
    #[serde(default)]
    pub group: String,

    /// API version of the object
    pub version: String,

    /// Lowercase plural resource name of the object's kind
    pub resource: String,

    /// Namespace of the object in the WDS
    pub namespace: String,

    /// Name of the object
    pub name: String,
}

/// One destination cluster
///
/// Identity is the `clusterId` alone, which doubles as the name of the
/// destination's mailbox namespace in the ITS and the name of its inventory
/// record and property ConfigMap.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    /// Identifier of the destination cluster
    pub cluster_id: String,
}

impl Destination {
    /// Convenience constructor used throughout the controller and tests
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
        }
    }
}

/// Observed status of a Binding, written by the transport controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BindingStatus {
    /// The Binding generation most recently reconciled
    #[serde(default)]
    pub observed_generation: i64,

    /// Human-readable descriptions of user errors found in the Binding
    #[serde(default)]
    pub errors: Vec<String>,
}

impl Binding {
    /// Returns true if the Binding has been marked for deletion
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// The name of the wrapped object this Binding produces in every
    /// destination's mailbox namespace.
    ///
    /// The WDS name is appended because Bindings from different WDS instances
    /// may share a name; the pair is unique.
    pub fn wrapped_object_name(&self, wds_name: &str) -> String {
        format!("{}-{}", self.metadata.name.as_deref().unwrap_or_default(), wds_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding_named(name: &str) -> Binding {
        let mut b = Binding::new(name, BindingSpec::default());
        b.metadata.generation = Some(1);
        b
    }

    #[test]
    fn wrapped_object_name_appends_wds() {
        let b = binding_named("app");
        assert_eq!(b.wrapped_object_name("wds1"), "app-wds1");
    }

    #[test]
    fn destinations_are_a_set_under_cluster_id() {
        use std::collections::HashSet;
        let set: HashSet<Destination> = [
            Destination::new("a"),
            Destination::new("b"),
            Destination::new("a"),
        ]
        .into_iter()
        .collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn spec_round_trips_with_camel_case_keys() {
        let json = serde_json::json!({
            "workload": {
                "clusterScope": [
                    {"group": "", "version": "v1", "resource": "namespaces", "name": "ns1"}
                ],
                "namespaceScope": [
                    {"group": "apps", "version": "v1", "resource": "deployments",
                     "namespace": "ns1", "name": "web"}
                ]
            },
            "destinations": [{"clusterId": "cluster-a"}]
        });
        let spec: BindingSpec = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(spec.workload.cluster_scope[0].resource, "namespaces");
        assert_eq!(spec.workload.namespace_scope[0].namespace, "ns1");
        assert_eq!(spec.destinations[0].cluster_id, "cluster-a");
        assert_eq!(serde_json::to_value(&spec).unwrap(), json);
    }

    #[test]
    fn deletion_is_signalled_by_timestamp() {
        let mut b = binding_named("doomed");
        assert!(!b.is_being_deleted());
        b.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                k8s_openapi::chrono::Utc::now(),
            ));
        assert!(b.is_being_deleted());
    }
}
