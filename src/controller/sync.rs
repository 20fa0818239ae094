//! Binding reconciliation
//!
//! `sync_binding` drives one Binding to its desired state: finalizer
//! management, per-destination wrapped object creation and update, deletion
//! of wrapped objects whose destination left the spec, and the status write.
//! Errors returned from here are transient and cause a rate-limited retry;
//! user mistakes in the Binding flow into `status.errors` instead and never
//! abort the pass.

use std::collections::{HashMap, HashSet};

use kube::core::DynamicObject;
use serde_json::Value;
use tracing::{debug, info};

use super::TransportController;
use crate::crd::{Binding, BindingStatus, ClusterScopeRef, Destination, NamespaceScopeRef};
use crate::properties::collect_destination_properties;
use crate::transport::{stamp_wrapped_object, wrapped_object_selector};
use crate::{Result, TEMPLATE_EXPANSION_ANNOTATION, TRANSPORT_FINALIZER};

/// The wrapped objects one Binding should have, when its workload is non-empty
///
/// When no workload object needs customization a single wrapped object serves
/// every destination; otherwise each destination has its own variant.
pub(super) enum DesiredState {
    Shared(DynamicObject),
    PerDestination(HashMap<Destination, DynamicObject>),
}

impl DesiredState {
    fn for_destination(&self, dest: &Destination) -> Option<&DynamicObject> {
        match self {
            Self::Shared(object) => Some(object),
            Self::PerDestination(map) => map.get(dest),
        }
    }
}

impl TransportController {
    /// Converge one Binding, identified by name, towards its desired state
    pub(super) async fn sync_binding(&self, name: &str) -> Result<()> {
        let binding = match self.binding_cache.get(name) {
            // Deleted with no finalizer left: mailbox cleanup already ran in
            // the pass that removed the finalizer.
            None => {
                self.properties.set_binding_sensitivities(name, None);
                return Ok(());
            }
            Some(binding) => binding,
        };

        if binding.is_being_deleted() {
            self.properties.set_binding_sensitivities(name, None);
            return self.delete_wrapped_objects_and_finalizer(&binding).await;
        }

        self.update_wrapped_objects_and_finalizer(&binding).await
    }

    // -------------------------------------------------------------------------
    // Deletion path
    // -------------------------------------------------------------------------

    /// Remove this Binding's wrapped object from every destination, then
    /// release the Binding by dropping the transport finalizer
    async fn delete_wrapped_objects_and_finalizer(&self, binding: &Binding) -> Result<()> {
        let object_name = binding.wrapped_object_name(&self.wds_name);
        for dest in &binding.spec.destinations {
            self.wrapped_object_client
                .delete(&dest.cluster_id, &object_name)
                .await?;
            debug!(
                binding = ?binding.metadata.name,
                destination = %dest.cluster_id,
                "deleted wrapped object for Binding being deleted"
            );
        }
        if let Some(updated) = with_finalizer_removed(binding) {
            let updated = self.binding_client.update(&updated).await?;
            info!(
                binding = ?binding.metadata.name,
                resource_version = ?updated.metadata.resource_version,
                "removed transport finalizer"
            );
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Normal path
    // -------------------------------------------------------------------------

    async fn update_wrapped_objects_and_finalizer(&self, binding: &Binding) -> Result<()> {
        if let Some(updated) = with_finalizer_added(binding) {
            let updated = self.binding_client.update(&updated).await?;
            info!(
                binding = ?binding.metadata.name,
                resource_version = ?updated.metadata.resource_version,
                "added transport finalizer"
            );
        }

        let binding_name = binding.metadata.name.as_deref().unwrap_or_default();
        let selector = wrapped_object_selector(binding_name, &self.wds_name);
        let mut current = self.wrapped_object_client.list(&selector).await?;

        let (desired, binding_errors) = self.compute_desired_wrapped_objects(binding).await?;

        self.write_status_if_changed(binding, &binding_errors).await?;

        self.propagate_to_destinations(
            binding,
            desired.as_ref(),
            &mut current,
            !binding_errors.is_empty(),
        )
        .await?;

        // whatever is left in the current list has no destination in the spec
        for leftover in current {
            let namespace = leftover.metadata.namespace.unwrap_or_default();
            let object_name = leftover.metadata.name.unwrap_or_default();
            self.wrapped_object_client
                .delete(&namespace, &object_name)
                .await?;
            info!(
                binding = ?binding.metadata.name,
                namespace = %namespace,
                "deleted wrapped object for removed destination"
            );
        }
        Ok(())
    }

    /// Write `observedGeneration` and `errors` when either is out of date
    async fn write_status_if_changed(
        &self,
        binding: &Binding,
        binding_errors: &[String],
    ) -> Result<()> {
        let generation = binding.metadata.generation.unwrap_or_default();
        let current = binding.status.clone().unwrap_or_default();
        if current.observed_generation == generation && current.errors == binding_errors {
            return Ok(());
        }
        let mut updated = binding.clone();
        updated.status = Some(BindingStatus {
            observed_generation: generation,
            errors: binding_errors.to_vec(),
        });
        let written = self.binding_client.update_status(&updated).await?;
        info!(
            binding = ?binding.metadata.name,
            observed_generation = generation,
            errors = binding_errors.len(),
            resource_version = ?written.metadata.resource_version,
            "updated Binding status"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Desired state
    // -------------------------------------------------------------------------

    /// Resolve, clean, customize and wrap the Binding's workload
    ///
    /// Returns the desired wrapped objects (`None` when the workload resolves
    /// to nothing) and the user errors found along the way. Also rewrites the
    /// Binding's sensitivity entry to match this computation.
    async fn compute_desired_wrapped_objects(
        &self,
        binding: &Binding,
    ) -> Result<(Option<DesiredState>, Vec<String>)> {
        let (objects, mut binding_errors) = self.workload_objects(binding).await?;

        let (dest_to_customized, customization_errors) =
            self.customize_per_destination(binding, &objects);
        binding_errors.extend(customization_errors);

        if objects.is_empty() {
            // nothing to distribute; an empty wrapped object would be noise
            return Ok((None, binding_errors));
        }

        let desired = match dest_to_customized {
            Some(map) => {
                let mut per_dest = HashMap::with_capacity(map.len());
                for (dest, customized) in map {
                    per_dest.insert(dest, self.wrap(binding, customized)?);
                }
                DesiredState::PerDestination(per_dest)
            }
            None => DesiredState::Shared(self.wrap(binding, objects)?),
        };
        Ok((Some(desired), binding_errors))
    }

    /// Fetch and clean the Binding's workload objects in deterministic order:
    /// cluster-scoped first, then namespace-scoped, each in spec order
    ///
    /// A reference that resolves to nothing is a user error; the object is
    /// skipped and reported.
    async fn workload_objects(
        &self,
        binding: &Binding,
    ) -> Result<(Vec<DynamicObject>, Vec<String>)> {
        let workload = &binding.spec.workload;
        let mut objects = Vec::new();
        let mut errors = Vec::new();
        for obj_ref in &workload.cluster_scope {
            match self.workload_client.get_cluster_scoped(obj_ref).await? {
                Some(object) => objects.push(self.cleaner.clean(&object)),
                None => errors.push(missing_cluster_scoped(obj_ref)),
            }
        }
        for obj_ref in &workload.namespace_scope {
            match self.workload_client.get_namespaced(obj_ref).await? {
                Some(object) => objects.push(self.cleaner.clean(&object)),
                None => errors.push(missing_namespace_scoped(obj_ref)),
            }
        }
        Ok((objects, errors))
    }

    /// Expand templates per destination where requested
    ///
    /// Returns a map from destination to customized object list, or `None`
    /// when no object called for customization, plus user errors. Updates the
    /// sensitivity index: exactly the spec destinations when customization
    /// happened, the empty set otherwise.
    fn customize_per_destination(
        &self,
        binding: &Binding,
        objects: &[DynamicObject],
    ) -> (Option<HashMap<Destination, Vec<DynamicObject>>>, Vec<String>) {
        let binding_name = binding.metadata.name.as_deref().unwrap_or_default();
        let destinations = &binding.spec.destinations;

        let mut dest_to_objects: Option<HashMap<Destination, Vec<DynamicObject>>> = None;
        let mut binding_errors = Vec::new();

        for (obj_idx, object) in objects.iter().enumerate() {
            let requests_expansion = object
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(TEMPLATE_EXPANSION_ANNOTATION))
                .map(String::as_str)
                == Some("true");
            // constant across destinations for a given object; decided at the
            // first destination
            let mut customize_this_object = false;
            let mut reported_some_errors = false;
            let obj_ref = object_ref(object);

            for (dest_idx, dest) in destinations.iter().enumerate() {
                let mut customized: Option<DynamicObject> = None;
                if requests_expansion && (dest_idx == 0 || customize_this_object) {
                    let props = self.properties.properties_for_destination(
                        binding_name,
                        dest,
                        || {
                            collect_destination_properties(
                                &dest.cluster_id,
                                self.inventory_cache.as_ref(),
                                self.property_config_maps.as_ref(),
                            )
                        },
                    );
                    let dest_key = format!("{}/{}", dest.cluster_id, obj_ref);
                    let (expanded, errors) =
                        self.customize_for_destination(object, &dest_key, |data| {
                            let expansion = self.customizer.expand(&dest_key, data, &props);
                            customize_this_object = expansion.wanted_change;
                            expansion
                        });
                    if !errors.is_empty() && !reported_some_errors {
                        // one destination's worth of errors per object is enough
                        reported_some_errors = true;
                        binding_errors.extend(errors);
                    }
                    customized = expanded;
                }
                if customize_this_object && dest_to_objects.is_none() {
                    // first object that needs customization: give every
                    // destination the shared prefix so the lists stay aligned
                    let prefix = objects[..obj_idx].to_vec();
                    dest_to_objects = Some(
                        destinations
                            .iter()
                            .map(|d| (d.clone(), prefix.clone()))
                            .collect(),
                    );
                }
                if let Some(map) = &mut dest_to_objects {
                    map.entry(dest.clone())
                        .or_default()
                        .push(customized.unwrap_or_else(|| object.clone()));
                }
            }
        }

        let cares: HashSet<Destination> = if dest_to_objects.is_some() {
            destinations.iter().cloned().collect()
        } else {
            HashSet::new()
        };
        self.properties
            .set_binding_sensitivities(binding_name, Some(cares));

        (dest_to_objects, binding_errors)
    }

    /// Run the expansion engine over one object for one destination
    ///
    /// Returns the customized object when the engine wanted a change, plus
    /// the user errors it reported.
    fn customize_for_destination(
        &self,
        object: &DynamicObject,
        dest_key: &str,
        expand: impl FnOnce(&Value) -> crate::customize::Expansion,
    ) -> (Option<DynamicObject>, Vec<String>) {
        let data = match serde_json::to_value(object) {
            Ok(data) => data,
            Err(err) => {
                return (
                    None,
                    vec![format!("cannot expand templates of {dest_key}: {err}")],
                )
            }
        };
        let expansion = expand(&data);
        if !expansion.wanted_change {
            return (None, expansion.errors);
        }
        match serde_json::from_value::<DynamicObject>(expansion.data) {
            Ok(expanded) => (Some(expanded), expansion.errors),
            Err(err) => {
                let mut errors = expansion.errors;
                errors.push(format!(
                    "template expansion of {dest_key} produced a malformed object: {err}"
                ));
                (None, errors)
            }
        }
    }

    /// Wrap a list of objects and stamp the Binding's identity on the result
    fn wrap(&self, binding: &Binding, objects: Vec<DynamicObject>) -> Result<DynamicObject> {
        let mut wrapped = self.transport.wrap_objects(objects)?;
        stamp_wrapped_object(
            &mut wrapped,
            binding.metadata.name.as_deref().unwrap_or_default(),
            binding.metadata.generation.unwrap_or_default(),
            &self.wds_name,
        );
        Ok(wrapped)
    }

    // -------------------------------------------------------------------------
    // Convergence
    // -------------------------------------------------------------------------

    /// Create or update the wrapped object of every destination in the spec
    ///
    /// Pops each destination's entry from `current`, so the caller can treat
    /// what remains as garbage. When `broken` (the Binding has user errors)
    /// nothing is written, but popping still happens: existing wrapped
    /// objects at still-valid destinations must survive the error.
    async fn propagate_to_destinations(
        &self,
        binding: &Binding,
        desired: Option<&DesiredState>,
        current: &mut Vec<DynamicObject>,
        broken: bool,
    ) -> Result<()> {
        if desired.is_none() && !broken {
            // empty workload: nothing to propagate; the caller removes every
            // current wrapped object
            return Ok(());
        }
        for dest in &binding.spec.destinations {
            let current_object = pop_by_namespace(current, &dest.cluster_id);
            if broken {
                continue;
            }
            let Some(desired_object) = desired.and_then(|d| d.for_destination(dest)) else {
                continue;
            };
            if let Some(current_object) = &current_object {
                if semantically_equal(current_object, desired_object) {
                    continue; // already converged; avoid write amplification
                }
            }
            self.create_or_update_wrapped_object(&dest.cluster_id, desired_object)
                .await?;
        }
        Ok(())
    }

    async fn create_or_update_wrapped_object(
        &self,
        namespace: &str,
        desired: &DynamicObject,
    ) -> Result<()> {
        let name = desired.metadata.name.as_deref().unwrap_or_default();
        match self.wrapped_object_client.get(namespace, name).await? {
            None => {
                let mut object = desired.clone();
                object.metadata.namespace = Some(namespace.to_string());
                object.metadata.resource_version = None; // must be unset for a create
                let created = self.wrapped_object_client.create(namespace, &object).await?;
                info!(
                    namespace,
                    object_name = name,
                    resource_version = ?created.metadata.resource_version,
                    "created wrapped object in ITS"
                );
            }
            Some(existing) => {
                let mut object = desired.clone();
                object.metadata.namespace = Some(namespace.to_string());
                object.metadata.resource_version = existing.metadata.resource_version.clone();
                let updated = self.wrapped_object_client.update(namespace, &object).await?;
                info!(
                    namespace,
                    object_name = name,
                    resource_version = ?updated.metadata.resource_version,
                    "updated wrapped object in ITS"
                );
            }
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------------

fn missing_cluster_scoped(obj_ref: &ClusterScopeRef) -> String {
    format!(
        "cluster-scoped workload object not found in WDS: {}/{} {}",
        group_version(&obj_ref.group, &obj_ref.version),
        obj_ref.resource,
        obj_ref.name
    )
}

fn missing_namespace_scoped(obj_ref: &NamespaceScopeRef) -> String {
    format!(
        "namespace-scoped workload object not found in WDS: {}/{} {}/{}",
        group_version(&obj_ref.group, &obj_ref.version),
        obj_ref.resource,
        obj_ref.namespace,
        obj_ref.name
    )
}

fn group_version(group: &str, version: &str) -> String {
    if group.is_empty() {
        version.to_string()
    } else {
        format!("{group}/{version}")
    }
}

/// Human-readable reference to a workload object, used in error messages
fn object_ref(object: &DynamicObject) -> String {
    let api_version = object
        .types
        .as_ref()
        .map(|t| t.api_version.as_str())
        .unwrap_or_default();
    let kind = object
        .types
        .as_ref()
        .map(|t| t.kind.as_str())
        .unwrap_or_default();
    let name = object.metadata.name.as_deref().unwrap_or_default();
    match object.metadata.namespace.as_deref() {
        Some(namespace) => format!("{api_version}/{kind}/{namespace}/{name}"),
        None => format!("{api_version}/{kind}/{name}"),
    }
}

/// Remove and return the list entry living in `namespace`
///
/// Swaps with the last element instead of shifting, so scanning a Binding
/// with many destinations stays linear overall.
fn pop_by_namespace(list: &mut Vec<DynamicObject>, namespace: &str) -> Option<DynamicObject> {
    let index = list
        .iter()
        .position(|object| object.metadata.namespace.as_deref() == Some(namespace))?;
    Some(list.swap_remove(index))
}

/// Compare two wrapped objects ignoring fields the server owns
///
/// `resourceVersion`, `uid`, `creationTimestamp`, `generation`,
/// `managedFields`, `selfLink`, `namespace` and the whole `status` subtree
/// are excluded; everything else must match exactly.
fn semantically_equal(current: &DynamicObject, desired: &DynamicObject) -> bool {
    comparable_content(current) == comparable_content(desired)
}

fn comparable_content(object: &DynamicObject) -> Value {
    let mut value = serde_json::to_value(object).unwrap_or(Value::Null);
    if let Some(root) = value.as_object_mut() {
        root.remove("status");
        if let Some(metadata) = root.get_mut("metadata").and_then(Value::as_object_mut) {
            for field in [
                "resourceVersion",
                "uid",
                "creationTimestamp",
                "generation",
                "managedFields",
                "selfLink",
                "namespace",
            ] {
                metadata.remove(field);
            }
        }
    }
    value
}

/// Copy of the Binding with the transport finalizer appended, or `None` if
/// it is already present
///
/// Cache objects are read-only; the copy is what gets written back.
fn with_finalizer_added(binding: &Binding) -> Option<Binding> {
    let finalizers = binding.metadata.finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == TRANSPORT_FINALIZER) {
        return None;
    }
    let mut updated = binding.clone();
    let mut finalizers = finalizers;
    finalizers.push(TRANSPORT_FINALIZER.to_string());
    updated.metadata.finalizers = Some(finalizers);
    Some(updated)
}

/// Copy of the Binding with the transport finalizer removed, or `None` if
/// it was not present
fn with_finalizer_removed(binding: &Binding) -> Option<Binding> {
    let finalizers = binding.metadata.finalizers.as_ref()?;
    if !finalizers.iter().any(|f| f == TRANSPORT_FINALIZER) {
        return None;
    }
    let mut updated = binding.clone();
    updated.metadata.finalizers = Some(
        finalizers
            .iter()
            .filter(|f| *f != TRANSPORT_FINALIZER)
            .cloned()
            .collect(),
    );
    Some(updated)
}
