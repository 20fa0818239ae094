//! Write-side store clients
//!
//! Every mutation the controller performs goes through one of these traits:
//! Binding finalizer/status writes in the WDS, wrapped object writes in the
//! ITS, and creation of the property namespace. The traits allow the
//! reconcile logic to run against mocks and in-memory fakes in tests while
//! production uses the kube-backed implementations below.
//!
//! All writes carry the `transport-controller` field manager. Reads return
//! `Option` instead of a NotFound error; deleting an absent wrapped object is
//! success, because the desired state was reached.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::{Api, Client};

#[cfg(test)]
use mockall::automock;

use crate::crd::{Binding, ClusterScopeRef, NamespaceScopeRef};
use crate::{Error, Result, CONTROLLER_NAME};

/// Client for the Binding objects in the WDS
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BindingClient: Send + Sync {
    /// Replace a Binding (used for finalizer changes)
    async fn update(&self, binding: &Binding) -> Result<Binding>;

    /// Replace a Binding's status subresource
    async fn update_status(&self, binding: &Binding) -> Result<Binding>;
}

/// Client resolving workload object references against the WDS
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Fetch a cluster-scoped workload object; `None` if it does not exist
    async fn get_cluster_scoped(&self, obj_ref: &ClusterScopeRef) -> Result<Option<DynamicObject>>;

    /// Fetch a namespace-scoped workload object; `None` if it does not exist
    async fn get_namespaced(&self, obj_ref: &NamespaceScopeRef) -> Result<Option<DynamicObject>>;
}

/// Client for wrapped objects of the discovered kind in the ITS
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WrappedObjectClient: Send + Sync {
    /// List wrapped objects across all mailbox namespaces by label selector
    async fn list(&self, label_selector: &str) -> Result<Vec<DynamicObject>>;

    /// Fetch one wrapped object; `None` if it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DynamicObject>>;

    /// Create a wrapped object in the given mailbox namespace
    async fn create(&self, namespace: &str, object: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an existing wrapped object
    async fn update(&self, namespace: &str, object: &DynamicObject) -> Result<DynamicObject>;

    /// Delete a wrapped object; deleting an absent object is success
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Client for namespaces in the ITS
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NamespaceClient: Send + Sync {
    /// Fetch a namespace; `None` if it does not exist
    async fn get(&self, name: &str) -> Result<Option<Namespace>>;

    /// Create a namespace with the given name
    async fn create(&self, name: &str) -> Result<Namespace>;
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(CONTROLLER_NAME.to_string()),
        ..PostParams::default()
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// Builds the `ApiResource` for a workload reference
///
/// Workload references carry a group/version/resource triple but no kind.
/// Only the URL path matters for a GET, and that is derived from the plural
/// resource name, so the kind field is filled with a placeholder.
fn workload_api_resource(group: &str, version: &str, resource: &str) -> ApiResource {
    let api_version = if group.is_empty() {
        version.to_string()
    } else {
        format!("{group}/{version}")
    };
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version,
        kind: String::new(),
        plural: resource.to_string(),
    }
}

/// [`BindingClient`] over a kube API handle
pub struct KubeBindingClient {
    api: Api<Binding>,
}

impl KubeBindingClient {
    /// Create a client against the WDS
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl BindingClient for KubeBindingClient {
    async fn update(&self, binding: &Binding) -> Result<Binding> {
        let name = binding.metadata.name.as_deref().unwrap_or_default();
        Ok(self.api.replace(name, &post_params(), binding).await?)
    }

    async fn update_status(&self, binding: &Binding) -> Result<Binding> {
        let name = binding.metadata.name.as_deref().unwrap_or_default();
        let data = serde_json::to_vec(binding)?;
        Ok(self.api.replace_status(name, &post_params(), data).await?)
    }
}

/// [`WorkloadClient`] over a dynamic kube client for the WDS
pub struct KubeWorkloadClient {
    client: Client,
}

impl KubeWorkloadClient {
    /// Create a client against the WDS
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn get_cluster_scoped(&self, obj_ref: &ClusterScopeRef) -> Result<Option<DynamicObject>> {
        let ar = workload_api_resource(&obj_ref.group, &obj_ref.version, &obj_ref.resource);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        Ok(api.get_opt(&obj_ref.name).await?)
    }

    async fn get_namespaced(&self, obj_ref: &NamespaceScopeRef) -> Result<Option<DynamicObject>> {
        let ar = workload_api_resource(&obj_ref.group, &obj_ref.version, &obj_ref.resource);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &obj_ref.namespace, &ar);
        Ok(api.get_opt(&obj_ref.name).await?)
    }
}

/// [`WrappedObjectClient`] over a dynamic kube client for the ITS
///
/// The resource is the one discovered from the transport plugin at startup.
pub struct KubeWrappedObjectClient {
    client: Client,
    resource: ApiResource,
}

impl KubeWrappedObjectClient {
    /// Create a client for wrapped objects of the given resource in the ITS
    pub fn new(client: Client, resource: ApiResource) -> Self {
        Self { client, resource }
    }

    fn namespaced(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }
}

#[async_trait]
impl WrappedObjectClient for KubeWrappedObjectClient {
    async fn list(&self, label_selector: &str) -> Result<Vec<DynamicObject>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.resource);
        let params = ListParams::default().labels(label_selector);
        Ok(api.list(&params).await?.items)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DynamicObject>> {
        Ok(self.namespaced(namespace).get_opt(name).await?)
    }

    async fn create(&self, namespace: &str, object: &DynamicObject) -> Result<DynamicObject> {
        Ok(self.namespaced(namespace).create(&post_params(), object).await?)
    }

    async fn update(&self, namespace: &str, object: &DynamicObject) -> Result<DynamicObject> {
        let name = object.metadata.name.as_deref().unwrap_or_default();
        Ok(self
            .namespaced(namespace)
            .replace(name, &post_params(), object)
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .namespaced(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(Error::Kube(err)),
        }
    }
}

/// [`NamespaceClient`] over a kube API handle for the ITS
pub struct KubeNamespaceClient {
    api: Api<Namespace>,
}

impl KubeNamespaceClient {
    /// Create a client against the ITS
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NamespaceClient for KubeNamespaceClient {
    async fn get(&self, name: &str) -> Result<Option<Namespace>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create(&self, name: &str) -> Result<Namespace> {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };
        Ok(self.api.create(&post_params(), &ns).await?)
    }
}
