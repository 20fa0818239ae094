//! Per-destination customization properties and the sensitivity index
//!
//! Each destination has a property map fed from two sources: the labels and
//! annotations of its inventory record, and the `data`/`binaryData` of its
//! property ConfigMap. Template expansion consumes these maps.
//!
//! [`PropertyTracker`] holds the property snapshots together with the index of
//! which Bindings are sensitive to which destinations. Both maps live behind
//! one mutex so the "who cares about whom" question is always answered
//! consistently with the snapshot it refers to. Property maps are immutable
//! once installed: a change replaces the whole `Arc`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::crd::Destination;
use crate::stores::{InventoryCache, PropertyConfigMapCache};

/// Immutable property map of one destination
///
/// Always contains `clusterName`. Shared by handle; never mutated in place.
pub type ClusterProperties = Arc<BTreeMap<String, String>>;

/// Returns true if `key` may name a property
///
/// Letters, digits and underscore, not starting with a digit. Keys that fail
/// the predicate are silently skipped by the collector.
pub fn is_property_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        None => false,
        Some(first) if first.is_ascii_digit() => false,
        Some(first) if !(first.is_ascii_alphanumeric() || first == '_') => false,
        Some(_) => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
    }
}

/// Build the property map for the destination whose inventory record is `inv_name`
///
/// Sources, in increasing precedence on key collision: inventory labels,
/// inventory annotations, ConfigMap `data`, ConfigMap `binaryData` (decoded
/// as UTF-8, lossily). A missing inventory record or ConfigMap contributes
/// nothing; caches never fail.
pub fn collect_destination_properties(
    inv_name: &str,
    inventory: &dyn InventoryCache,
    config_maps: &dyn PropertyConfigMapCache,
) -> ClusterProperties {
    let mut props = BTreeMap::new();
    props.insert("clusterName".to_string(), inv_name.to_string());

    if let Some(record) = inventory.get(inv_name) {
        for source in [&record.metadata.labels, &record.metadata.annotations] {
            if let Some(map) = source {
                for (key, val) in map {
                    if is_property_identifier(key) {
                        props.insert(key.clone(), val.clone());
                    }
                }
            }
        }
    }

    if let Some(cm) = config_maps.get(inv_name) {
        if let Some(data) = &cm.data {
            for (key, val) in data {
                if is_property_identifier(key) {
                    props.insert(key.clone(), val.clone());
                }
            }
        }
        if let Some(binary) = &cm.binary_data {
            for (key, val) in binary {
                if is_property_identifier(key) {
                    props.insert(key.clone(), String::from_utf8_lossy(&val.0).into_owned());
                }
            }
        }
    }

    Arc::new(props)
}

#[derive(Default)]
struct TrackerState {
    /// Binding name -> destinations whose properties that Binding was built from
    binding_sensitive_destinations: HashMap<String, HashSet<Destination>>,
    /// Destination -> its current property snapshot
    destination_properties: HashMap<Destination, ClusterProperties>,
}

impl TrackerState {
    /// Drop property snapshots no Binding is sensitive to
    fn drop_unreferenced_properties(&mut self) {
        let index = &self.binding_sensitive_destinations;
        self.destination_properties
            .retain(|dest, _| index.values().any(|dests| dests.contains(dest)));
    }
}

/// Shared index of Binding→destination sensitivity plus per-destination
/// property snapshots
///
/// Every read or write of either map goes through one mutex. The
/// `ClusterProperties` handles returned here may be used after the lock is
/// released, but never mutated.
#[derive(Default)]
pub struct PropertyTracker {
    state: Mutex<TrackerState>,
}

impl PropertyTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the exact set of destinations a Binding is sensitive to,
    /// or forget the Binding entirely (`None`)
    ///
    /// Destinations no longer referenced by any Binding lose their property
    /// snapshot; it will be re-collected if interest returns.
    pub fn set_binding_sensitivities(&self, binding: &str, dests: Option<HashSet<Destination>>) {
        let mut state = self.state.lock().expect("property tracker mutex poisoned");
        match dests {
            None => {
                state.binding_sensitive_destinations.remove(binding);
            }
            Some(dests) => {
                state
                    .binding_sensitive_destinations
                    .insert(binding.to_string(), dests);
            }
        }
        state.drop_unreferenced_properties();
    }

    /// Fetch the properties of `dest` on behalf of `binding`, noting that the
    /// Binding is sensitive to them
    ///
    /// The first fetch for a destination runs `collect` and installs the
    /// result; later fetches reuse the installed snapshot until
    /// [`Self::refresh_destination`] replaces it.
    pub fn properties_for_destination(
        &self,
        binding: &str,
        dest: &Destination,
        collect: impl FnOnce() -> ClusterProperties,
    ) -> ClusterProperties {
        let mut state = self.state.lock().expect("property tracker mutex poisoned");
        state
            .binding_sensitive_destinations
            .entry(binding.to_string())
            .or_default()
            .insert(dest.clone());
        if let Some(props) = state.destination_properties.get(dest) {
            return Arc::clone(props);
        }
        let props = collect();
        state
            .destination_properties
            .insert(dest.clone(), Arc::clone(&props));
        debug!(binding, dest = %dest.cluster_id, ?props, "collected destination properties");
        props
    }

    /// Install a freshly collected property map for `dest`
    ///
    /// Returns the names of the Bindings that must be reconciled because of
    /// the change. Empty when no Binding cares about the destination or when
    /// the new map equals the installed one.
    pub fn refresh_destination(
        &self,
        dest: &Destination,
        new_props: ClusterProperties,
    ) -> Vec<String> {
        let mut state = self.state.lock().expect("property tracker mutex poisoned");
        match state.destination_properties.get(dest) {
            None => return Vec::new(), // nobody cares yet
            Some(old) if **old == *new_props => return Vec::new(),
            Some(_) => {}
        }
        state.destination_properties.insert(dest.clone(), new_props);
        state
            .binding_sensitive_destinations
            .iter()
            .filter(|(_, dests)| dests.contains(dest))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The destinations a Binding is currently sensitive to, if any
    pub fn binding_sensitivities(&self, binding: &str) -> Option<HashSet<Destination>> {
        let state = self.state.lock().expect("property tracker mutex poisoned");
        state.binding_sensitive_destinations.get(binding).cloned()
    }

    /// Whether a property snapshot is installed for `dest`
    pub fn has_properties_for(&self, dest: &Destination) -> bool {
        let state = self.state.lock().expect("property tracker mutex poisoned");
        state.destination_properties.contains_key(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::fake::{MapInventoryCache, MapPropertyConfigMapCache};
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use kube::core::{ApiResource, DynamicObject, GroupVersionKind};

    fn inventory_record(name: &str, labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> DynamicObject {
        let gvk = GroupVersionKind::gvk("cluster.open-cluster-management.io", "v1", "ManagedCluster");
        let ar = ApiResource::from_gvk(&gvk);
        let mut obj = DynamicObject::new(name, &ar);
        obj.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        obj.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        obj
    }

    fn property_config_map(name: &str, data: &[(&str, &str)], binary: &[(&str, &[u8])]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            binary_data: Some(
                binary
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
                    .collect(),
            ),
            ..ConfigMap::default()
        }
    }

    #[test]
    fn identifier_predicate() {
        assert!(is_property_identifier("region"));
        assert!(is_property_identifier("zone_2"));
        assert!(is_property_identifier("_private"));
        assert!(is_property_identifier("r2d2"));
        assert!(!is_property_identifier(""));
        assert!(!is_property_identifier("2fast"));
        assert!(!is_property_identifier("kubernetes.io/arch"));
        assert!(!is_property_identifier("has space"));
        assert!(!is_property_identifier("dash-ed"));
    }

    #[test]
    fn collector_always_includes_cluster_name() {
        let inventory = MapInventoryCache::default();
        let config_maps = MapPropertyConfigMapCache::default();
        let props = collect_destination_properties("wec-a", &inventory, &config_maps);
        assert_eq!(props.get("clusterName").map(String::as_str), Some("wec-a"));
        assert_eq!(props.len(), 1);
    }

    #[test]
    fn collector_precedence_labels_annotations_data_binary() {
        let inventory = MapInventoryCache::default();
        inventory.insert(inventory_record(
            "wec-a",
            &[("region", "from_label"), ("tier", "from_label")],
            &[("region", "from_annotation"), ("zone", "from_annotation")],
        ));
        let config_maps = MapPropertyConfigMapCache::default();
        config_maps.insert(property_config_map(
            "wec-a",
            &[("region", "from_data"), ("speed", "from_data")],
            &[("region", b"from_binary")],
        ));

        let props = collect_destination_properties("wec-a", &inventory, &config_maps);
        assert_eq!(props.get("region").map(String::as_str), Some("from_binary"));
        assert_eq!(props.get("tier").map(String::as_str), Some("from_label"));
        assert_eq!(props.get("zone").map(String::as_str), Some("from_annotation"));
        assert_eq!(props.get("speed").map(String::as_str), Some("from_data"));
    }

    #[test]
    fn collector_skips_non_identifier_keys() {
        let inventory = MapInventoryCache::default();
        inventory.insert(inventory_record(
            "wec-a",
            &[("kubernetes.io/arch", "amd64"), ("arch", "amd64")],
            &[],
        ));
        let config_maps = MapPropertyConfigMapCache::default();
        let props = collect_destination_properties("wec-a", &inventory, &config_maps);
        assert!(!props.contains_key("kubernetes.io/arch"));
        assert_eq!(props.get("arch").map(String::as_str), Some("amd64"));
    }

    fn props_of(pairs: &[(&str, &str)]) -> ClusterProperties {
        Arc::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn refresh_is_a_noop_while_nobody_cares() {
        let tracker = PropertyTracker::new();
        let dest = Destination::new("wec-a");
        let touched = tracker.refresh_destination(&dest, props_of(&[("region", "us")]));
        assert!(touched.is_empty());
        assert!(!tracker.has_properties_for(&dest));
    }

    #[test]
    fn refresh_with_equal_map_requeues_nothing() {
        let tracker = PropertyTracker::new();
        let dest = Destination::new("wec-a");
        tracker.properties_for_destination("b1", &dest, || props_of(&[("region", "us")]));
        let touched = tracker.refresh_destination(&dest, props_of(&[("region", "us")]));
        assert!(touched.is_empty());
    }

    #[test]
    fn refresh_with_changed_map_names_sensitive_bindings() {
        let tracker = PropertyTracker::new();
        let dest_a = Destination::new("wec-a");
        let dest_b = Destination::new("wec-b");
        tracker.properties_for_destination("b1", &dest_a, || props_of(&[("region", "us")]));
        tracker.properties_for_destination("b2", &dest_b, || props_of(&[("region", "eu")]));

        let mut touched = tracker.refresh_destination(&dest_a, props_of(&[("region", "apac")]));
        touched.sort();
        assert_eq!(touched, vec!["b1".to_string()]);
    }

    #[test]
    fn snapshots_are_shared_not_copied() {
        let tracker = PropertyTracker::new();
        let dest = Destination::new("wec-a");
        let first = tracker.properties_for_destination("b1", &dest, || props_of(&[("k", "v")]));
        let second =
            tracker.properties_for_destination("b2", &dest, || unreachable!("already installed"));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn forgetting_a_binding_drops_orphaned_snapshots() {
        let tracker = PropertyTracker::new();
        let dest = Destination::new("wec-a");
        tracker.properties_for_destination("b1", &dest, || props_of(&[]));
        assert!(tracker.has_properties_for(&dest));

        tracker.set_binding_sensitivities("b1", None);
        assert!(tracker.binding_sensitivities("b1").is_none());
        assert!(!tracker.has_properties_for(&dest));
    }

    #[test]
    fn shrinking_sensitivities_drops_only_unreferenced_snapshots() {
        let tracker = PropertyTracker::new();
        let dest_a = Destination::new("wec-a");
        let dest_b = Destination::new("wec-b");
        tracker.properties_for_destination("b1", &dest_a, || props_of(&[]));
        tracker.properties_for_destination("b1", &dest_b, || props_of(&[]));
        tracker.properties_for_destination("b2", &dest_b, || unreachable!("already installed"));

        tracker.set_binding_sensitivities("b1", Some(HashSet::new()));
        assert!(!tracker.has_properties_for(&dest_a));
        assert!(tracker.has_properties_for(&dest_b)); // b2 still cares
    }
}
