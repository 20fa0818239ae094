//! Read-side caches over watched resources
//!
//! The reconcile paths read Bindings, inventory records and property
//! ConfigMaps from local caches fed by watches, never from the API server.
//! The traits here abstract those caches so the controller can be exercised
//! against plain maps in tests; production wires them to reflector stores.
//!
//! Cache contents are read-only: any object that needs mutation is deep-copied
//! by the caller first.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::{ApiResource, DynamicObject};
use kube::runtime::reflector::{ObjectRef, Store};

use crate::crd::Binding;

/// Cache of Binding objects in the WDS
pub trait BindingCache: Send + Sync {
    /// Look up a Binding by name
    fn get(&self, name: &str) -> Option<Arc<Binding>>;
}

/// Cache of inventory records, one per destination, named by `clusterId`
pub trait InventoryCache: Send + Sync {
    /// Look up an inventory record by destination `clusterId`
    fn get(&self, name: &str) -> Option<Arc<DynamicObject>>;
}

/// Cache of the per-destination property ConfigMaps, named by `clusterId`
pub trait PropertyConfigMapCache: Send + Sync {
    /// Look up a property ConfigMap by destination `clusterId`
    fn get(&self, name: &str) -> Option<Arc<ConfigMap>>;
}

/// [`BindingCache`] backed by a reflector store
pub struct ReflectorBindingCache {
    store: Store<Binding>,
}

impl ReflectorBindingCache {
    /// Wrap a reflector store of Bindings
    pub fn new(store: Store<Binding>) -> Self {
        Self { store }
    }
}

impl BindingCache for ReflectorBindingCache {
    fn get(&self, name: &str) -> Option<Arc<Binding>> {
        self.store.get(&ObjectRef::new(name))
    }
}

/// [`InventoryCache`] backed by a reflector store of dynamic objects
pub struct ReflectorInventoryCache {
    store: Store<DynamicObject>,
    resource: ApiResource,
}

impl ReflectorInventoryCache {
    /// Wrap a reflector store of inventory records of the given resource
    pub fn new(store: Store<DynamicObject>, resource: ApiResource) -> Self {
        Self { store, resource }
    }
}

impl InventoryCache for ReflectorInventoryCache {
    fn get(&self, name: &str) -> Option<Arc<DynamicObject>> {
        self.store
            .get(&ObjectRef::new_with(name, self.resource.clone()))
    }
}

/// [`PropertyConfigMapCache`] backed by a reflector store scoped to the
/// property namespace
pub struct ReflectorPropertyConfigMapCache {
    store: Store<ConfigMap>,
    namespace: String,
}

impl ReflectorPropertyConfigMapCache {
    /// Wrap a reflector store of ConfigMaps watched in `namespace`
    pub fn new(store: Store<ConfigMap>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }
}

impl PropertyConfigMapCache for ReflectorPropertyConfigMapCache {
    fn get(&self, name: &str) -> Option<Arc<ConfigMap>> {
        self.store
            .get(&ObjectRef::new(name).within(&self.namespace))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Map-backed cache implementations for tests

    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::core::DynamicObject;

    use super::{InventoryCache, PropertyConfigMapCache};

    #[derive(Default)]
    pub struct MapInventoryCache {
        items: Mutex<HashMap<String, Arc<DynamicObject>>>,
    }

    impl MapInventoryCache {
        pub fn insert(&self, obj: DynamicObject) {
            let name = obj.metadata.name.clone().unwrap_or_default();
            self.items.lock().unwrap().insert(name, Arc::new(obj));
        }
    }

    impl InventoryCache for MapInventoryCache {
        fn get(&self, name: &str) -> Option<Arc<DynamicObject>> {
            self.items.lock().unwrap().get(name).cloned()
        }
    }

    #[derive(Default)]
    pub struct MapPropertyConfigMapCache {
        items: Mutex<HashMap<String, Arc<ConfigMap>>>,
    }

    impl MapPropertyConfigMapCache {
        pub fn insert(&self, cm: ConfigMap) {
            let name = cm.metadata.name.clone().unwrap_or_default();
            self.items.lock().unwrap().insert(name, Arc::new(cm));
        }
    }

    impl PropertyConfigMapCache for MapPropertyConfigMapCache {
        fn get(&self, name: &str) -> Option<Arc<ConfigMap>> {
            self.items.lock().unwrap().get(name).cloned()
        }
    }
}
