//! Transport plugin contract and wrapped object identity
//!
//! A transport plugin folds a list of cleaned (and possibly customized)
//! workload objects into a single wrapped object of a plugin-defined kind.
//! The controller never learns that kind at compile time: at startup it wraps
//! an empty list, reads the result's type information, and resolves the
//! served resource via API discovery. From then on all ITS traffic goes
//! through a dynamic client for that resource.
//!
//! After wrapping, the controller stamps the identity triple onto the object:
//! origin Binding label, origin WDS label, origin generation annotation.

use kube::core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta};
use kube::discovery::ApiCapabilities;
use kube::Client;
use serde_json::json;

use crate::{
    Error, Result, ORIGIN_BINDING_LABEL, ORIGIN_GENERATION_ANNOTATION, ORIGIN_WDS_LABEL,
};

/// A transport plugin
///
/// `wrap_objects` must be deterministic over its input, up to metadata the
/// controller overwrites afterwards.
pub trait Transport: Send + Sync {
    /// Fold the given objects into one wrapped object of the plugin's kind
    ///
    /// The result must carry its type information so the wrapped object kind
    /// can be discovered from an empty wrap.
    fn wrap_objects(&self, objects: Vec<DynamicObject>) -> Result<DynamicObject>;
}

/// Extract the group/version/kind a wrapped object declares
pub(crate) fn gvk_of(types: &TypeMeta) -> Option<GroupVersionKind> {
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    if version.is_empty() || types.kind.is_empty() {
        return None;
    }
    Some(GroupVersionKind::gvk(group, version, &types.kind))
}

/// Stamp the identity of the originating Binding onto a wrapped object
///
/// The object name is `<binding>-<wds>`: Bindings in different WDS instances
/// may share a name, so the WDS name is folded in to keep mailbox entries
/// unique. The triple of two labels and one annotation lets event handlers
/// and list operations find the envelopes of one Binding.
pub fn stamp_wrapped_object(
    object: &mut DynamicObject,
    binding_name: &str,
    binding_generation: i64,
    wds_name: &str,
) {
    object.metadata.name = Some(format!("{binding_name}-{wds_name}"));
    let labels = object.metadata.labels.get_or_insert_with(Default::default);
    labels.insert(ORIGIN_BINDING_LABEL.to_string(), binding_name.to_string());
    labels.insert(ORIGIN_WDS_LABEL.to_string(), wds_name.to_string());
    object
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(
            ORIGIN_GENERATION_ANNOTATION.to_string(),
            binding_generation.to_string(),
        );
}

/// The label selector matching every wrapped object of one Binding
pub fn wrapped_object_selector(binding_name: &str, wds_name: &str) -> String {
    format!("{ORIGIN_BINDING_LABEL}={binding_name},{ORIGIN_WDS_LABEL}={wds_name}")
}

/// Resolve the resource serving the plugin's wrapped object kind
///
/// Wraps an empty object list, reads its type information and asks the ITS
/// discovery endpoint for the matching resource. Failure here is fatal: the
/// controller cannot do anything useful without the wrapped object resource.
pub async fn discover_wrapped_object_resource(
    client: &Client,
    transport: &dyn Transport,
) -> Result<(ApiResource, ApiCapabilities)> {
    let empty = transport.wrap_objects(Vec::new())?;
    let types = empty
        .types
        .ok_or_else(|| Error::discovery("transport plugin produced a wrapped object without type information"))?;
    let gvk = gvk_of(&types).ok_or_else(|| {
        Error::discovery(format!(
            "transport plugin produced an unusable apiVersion/kind pair {:?}/{:?}",
            types.api_version, types.kind
        ))
    })?;
    kube::discovery::pinned_kind(client, &gvk)
        .await
        .map_err(|err| {
            Error::discovery(format!(
                "failed to resolve a served resource for wrapped object kind {gvk:?}: {err}"
            ))
        })
}

/// Transport plugin wrapping workloads into an Open Cluster Management
/// `ManifestWork`
///
/// This is the envelope understood by OCM agents: the object list lands in
/// `spec.workload.manifests`, in order.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManifestWorkTransport;

impl ManifestWorkTransport {
    /// The resource the plugin's envelopes belong to
    pub fn api_resource() -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk("work.open-cluster-management.io", "v1", "ManifestWork"),
            "manifestworks",
        )
    }
}

impl Transport for ManifestWorkTransport {
    fn wrap_objects(&self, objects: Vec<DynamicObject>) -> Result<DynamicObject> {
        let manifests = objects
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut work = DynamicObject::new("", &Self::api_resource());
        work.metadata.name = None; // identity is stamped by the controller
        work.data = json!({"spec": {"workload": {"manifests": manifests}}});
        Ok(work)
    }
}
