//! The generic transport controller
//!
//! One controller instance serves one WDS. Informer-style watch events arrive
//! through the cheap `handle_*` methods, which only compute a queue key; all
//! actual work happens in the worker loops draining the shared
//! [`WorkQueue`]. The queue guarantees a Binding is never reconciled by two
//! workers at once, so the reconcile paths are written single-object
//! sequential.
//!
//! Reconciliation itself lives in `sync.rs`; this module owns construction,
//! dispatch, the property re-collection path and the background loop that
//! makes sure the property namespace exists.

mod sync;


use std::sync::Arc;
use std::time::Duration;

use kube::core::DynamicObject;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cleaner::ObjectCleaner;
use crate::clients::{BindingClient, NamespaceClient, WorkloadClient, WrappedObjectClient};
use crate::crd::Destination;
use crate::customize::CustomizationEngine;
use crate::properties::{collect_destination_properties, PropertyTracker};
use crate::queue::{WorkItem, WorkQueue};
use crate::stores::{BindingCache, InventoryCache, PropertyConfigMapCache};
use crate::transport::Transport;
use crate::{Result, ORIGIN_BINDING_LABEL, PROPERTY_CONFIGMAP_NAMESPACE};

const ENSURE_NAMESPACE_PERIOD: Duration = Duration::from_secs(10);

/// Everything a [`TransportController`] needs wired in
///
/// The caches are fed by watches the bootstrap owns; the clients talk to the
/// WDS and the ITS; transport and customizer are the two pluggable seams.
pub struct ControllerParams {
    /// Name of the WDS this controller serves; part of wrapped object identity
    pub wds_name: String,
    /// Cache of Bindings in the WDS
    pub binding_cache: Arc<dyn BindingCache>,
    /// Cache of inventory records in the ITS
    pub inventory_cache: Arc<dyn InventoryCache>,
    /// Cache of property ConfigMaps in the ITS property namespace
    pub property_config_maps: Arc<dyn PropertyConfigMapCache>,
    /// Write client for Bindings (finalizers, status)
    pub binding_client: Arc<dyn BindingClient>,
    /// Read client resolving workload references against the WDS
    pub workload_client: Arc<dyn WorkloadClient>,
    /// Client for wrapped objects in the ITS mailbox namespaces
    pub wrapped_object_client: Arc<dyn WrappedObjectClient>,
    /// Client for namespaces in the ITS
    pub namespace_client: Arc<dyn NamespaceClient>,
    /// The transport plugin deciding the wrapped object kind
    pub transport: Arc<dyn Transport>,
    /// The template expansion engine
    pub customizer: Arc<dyn CustomizationEngine>,
    /// Scrubber applied to workload objects before wrapping
    pub cleaner: ObjectCleaner,
}

/// Reconciles Bindings into wrapped objects in per-destination mailboxes
pub struct TransportController {
    wds_name: String,
    binding_cache: Arc<dyn BindingCache>,
    inventory_cache: Arc<dyn InventoryCache>,
    property_config_maps: Arc<dyn PropertyConfigMapCache>,
    binding_client: Arc<dyn BindingClient>,
    workload_client: Arc<dyn WorkloadClient>,
    wrapped_object_client: Arc<dyn WrappedObjectClient>,
    namespace_client: Arc<dyn NamespaceClient>,
    transport: Arc<dyn Transport>,
    customizer: Arc<dyn CustomizationEngine>,
    cleaner: ObjectCleaner,
    queue: Arc<WorkQueue<WorkItem>>,
    properties: PropertyTracker,
}

impl TransportController {
    /// Build a controller from its wired dependencies
    pub fn new(params: ControllerParams) -> Self {
        Self {
            wds_name: params.wds_name,
            binding_cache: params.binding_cache,
            inventory_cache: params.inventory_cache,
            property_config_maps: params.property_config_maps,
            binding_client: params.binding_client,
            workload_client: params.workload_client,
            wrapped_object_client: params.wrapped_object_client,
            namespace_client: params.namespace_client,
            transport: params.transport,
            customizer: params.customizer,
            cleaner: params.cleaner,
            queue: Arc::new(WorkQueue::new()),
            properties: PropertyTracker::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Event handlers
    // -------------------------------------------------------------------------
    // All handlers are cheap and synchronous: compute a key, enqueue it.

    /// A Binding was added, updated or deleted
    pub fn handle_binding_event(&self, name: &str) {
        debug!(binding = name, "enqueueing Binding from Binding event");
        self.queue.add(WorkItem::Binding(name.to_string()));
    }

    /// A wrapped object was added, updated or deleted
    ///
    /// The origin Binding label points back at the owner; objects without the
    /// label were not created by this controller and are ignored.
    pub fn handle_wrapped_object_event(&self, object: &DynamicObject) {
        let origin = object
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(ORIGIN_BINDING_LABEL));
        match origin {
            Some(binding) => {
                debug!(
                    binding,
                    wrapped_object = ?object.metadata.name,
                    namespace = ?object.metadata.namespace,
                    "enqueueing Binding from wrapped object event"
                );
                self.queue.add(WorkItem::Binding(binding.clone()));
            }
            None => debug!(
                wrapped_object = ?object.metadata.name,
                namespace = ?object.metadata.namespace,
                "ignoring wrapped object without origin Binding label"
            ),
        }
    }

    /// An inventory record or property ConfigMap was added, updated or deleted
    ///
    /// Both are named after the destination's `clusterId`.
    pub fn handle_properties_event(&self, inv_name: &str) {
        debug!(
            inventory = inv_name,
            "enqueueing property re-collection from inventory event"
        );
        self.queue
            .add(WorkItem::RecollectProperties(inv_name.to_string()));
    }

    // -------------------------------------------------------------------------
    // Workers
    // -------------------------------------------------------------------------

    /// Run the controller until `cancel` fires
    ///
    /// Starts the property-namespace ensurer and `workers_count` parallel
    /// worker loops. On cancellation the queue shuts down, each worker exits
    /// after its current item, and `run` returns once all have stopped.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken, workers_count: usize) {
        info!(workers = workers_count, wds = %self.wds_name, "starting transport controller");

        let ensurer = {
            let controller = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.ensure_property_namespace(cancel).await })
        };

        let mut workers = JoinSet::new();
        for worker_id in 1..=workers_count {
            let controller = Arc::clone(self);
            workers.spawn(async move { controller.run_worker(worker_id).await });
        }

        cancel.cancelled().await;
        info!("shutting down workers");
        self.queue.shut_down();
        while workers.join_next().await.is_some() {}
        let _ = ensurer.await;
        info!("transport controller stopped");
    }

    async fn run_worker(&self, worker_id: usize) {
        debug!(worker_id, "worker started");
        while let Some(item) = self.queue.get().await {
            match self.process(&item).await {
                Ok(()) => {
                    self.queue.forget(&item);
                    debug!(worker_id, ?item, "processed work item");
                }
                Err(err) => {
                    // transient by construction: permanent conditions are
                    // handled inside process() and do not surface as errors
                    debug!(worker_id, ?item, error = %err, "work item failed; retrying with back-off");
                    self.queue.add_rate_limited(item.clone());
                }
            }
            self.queue.done(&item);
        }
        debug!(worker_id, "worker stopped");
    }

    async fn process(&self, item: &WorkItem) -> Result<()> {
        match item {
            WorkItem::Binding(name) if name.is_empty() => {
                error!("dropping work item with empty Binding name");
                Ok(())
            }
            WorkItem::Binding(name) => self.sync_binding(name).await,
            WorkItem::RecollectProperties(inv_name) => {
                self.sync_properties(inv_name);
                Ok(())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Property re-collection
    // -------------------------------------------------------------------------

    /// Re-collect one destination's properties and, if they changed, requeue
    /// every Binding that was built from them
    fn sync_properties(&self, inv_name: &str) {
        let new_props = collect_destination_properties(
            inv_name,
            self.inventory_cache.as_ref(),
            self.property_config_maps.as_ref(),
        );
        let dest = Destination::new(inv_name);
        for binding in self.properties.refresh_destination(&dest, new_props) {
            debug!(
                binding = %binding,
                destination = inv_name,
                "destination properties changed; re-reconciling dependent Binding"
            );
            self.queue.add(WorkItem::Binding(binding));
        }
    }

    // -------------------------------------------------------------------------
    // Property namespace ensurer
    // -------------------------------------------------------------------------

    /// Make sure the namespace holding property ConfigMaps exists in the ITS
    ///
    /// Retries every 10 s until it succeeds or the controller is cancelled.
    async fn ensure_property_namespace(&self, cancel: CancellationToken) {
        loop {
            match self.namespace_client.get(PROPERTY_CONFIGMAP_NAMESPACE).await {
                Ok(Some(_)) => {
                    info!(namespace = PROPERTY_CONFIGMAP_NAMESPACE, "property namespace exists");
                    return;
                }
                Ok(None) => match self.namespace_client.create(PROPERTY_CONFIGMAP_NAMESPACE).await {
                    Ok(_) => {
                        info!(namespace = PROPERTY_CONFIGMAP_NAMESPACE, "created property namespace");
                        return;
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to create property namespace")
                    }
                },
                Err(err) => warn!(error = %err, "failed to look up property namespace"),
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("giving up on creating property namespace");
                    return;
                }
                _ = tokio::time::sleep(ENSURE_NAMESPACE_PERIOD) => {}
            }
        }
    }
}
