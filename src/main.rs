//! Transport controller - propagates Binding workloads into ITS mailbox namespaces

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures::{Stream, StreamExt};
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::discovery::Scope;
use kube::runtime::watcher;
use kube::runtime::{reflector, WatchStreamExt};
use kube::{Client, Config};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use transport_controller::clients::{
    KubeBindingClient, KubeNamespaceClient, KubeWorkloadClient, KubeWrappedObjectClient,
};
use transport_controller::cleaner::ObjectCleaner;
use transport_controller::controller::{ControllerParams, TransportController};
use transport_controller::crd::Binding;
use transport_controller::customize::TemplateExpander;
use transport_controller::stores::{
    ReflectorBindingCache, ReflectorInventoryCache, ReflectorPropertyConfigMapCache,
};
use transport_controller::transport::{
    discover_wrapped_object_resource, ManifestWorkTransport, Transport,
};
use transport_controller::{Error, PROPERTY_CONFIGMAP_NAMESPACE};

/// Transport controller for one WDS/ITS pair
#[derive(Parser, Debug)]
#[command(name = "transport-controller", version, about, long_about = None)]
struct Cli {
    /// Name of the WDS this controller serves; folded into wrapped object names
    #[arg(long, env = "WDS_NAME")]
    wds_name: String,

    /// Number of parallel reconcile workers
    #[arg(long, default_value_t = 1)]
    workers_count: usize,

    /// Kubeconfig for the WDS; in-cluster/default config when omitted
    #[arg(long, env = "WDS_KUBECONFIG")]
    wds_kubeconfig: Option<PathBuf>,

    /// Context to use within the WDS kubeconfig
    #[arg(long)]
    wds_context: Option<String>,

    /// Kubeconfig for the ITS; in-cluster/default config when omitted
    #[arg(long, env = "ITS_KUBECONFIG")]
    its_kubeconfig: Option<PathBuf>,

    /// Context to use within the ITS kubeconfig
    #[arg(long)]
    its_context: Option<String>,
}

async fn client_for(
    kubeconfig: Option<&PathBuf>,
    context: Option<String>,
    space: &str,
) -> anyhow::Result<Client> {
    match kubeconfig {
        None => Client::try_default()
            .await
            .map_err(|e| anyhow::anyhow!("failed to create default client for {space}: {e}")),
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| anyhow::anyhow!("failed to read kubeconfig {path:?} for {space}: {e}"))?;
            let options = KubeConfigOptions {
                context,
                ..KubeConfigOptions::default()
            };
            let config = Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| anyhow::anyhow!("failed to load kubeconfig for {space}: {e}"))?;
            Client::try_from(config)
                .map_err(|e| anyhow::anyhow!("failed to create client for {space}: {e}"))
        }
    }
}

fn inventory_api_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("cluster.open-cluster-management.io", "v1", "ManagedCluster"),
        "managedclusters",
    )
}

/// Forward watch events to a cheap handler; init markers are skipped, watch
/// errors are logged and retried by the stream's own back-off
async fn pump<K>(
    stream: impl Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
    what: &'static str,
    handle: impl Fn(K),
) {
    let mut stream = std::pin::pin!(stream);
    while let Some(event) = stream.next().await {
        match event {
            Ok(
                watcher::Event::Apply(object)
                | watcher::Event::InitApply(object)
                | watcher::Event::Delete(object),
            ) => handle(object),
            Ok(_) => {}
            Err(err) => warn!(watch = what, error = %err, "watch stream error"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    info!(wds = %cli.wds_name, workers = cli.workers_count, "transport controller starting");

    let wds_client = client_for(cli.wds_kubeconfig.as_ref(), cli.wds_context.clone(), "WDS").await?;
    let its_client = client_for(cli.its_kubeconfig.as_ref(), cli.its_context.clone(), "ITS").await?;

    // The transport plugin decides the wrapped object kind; resolve the
    // served resource once, before anything else is wired.
    let transport: Arc<dyn Transport> = Arc::new(ManifestWorkTransport);
    let (wrapped_resource, wrapped_caps) =
        discover_wrapped_object_resource(&its_client, transport.as_ref()).await?;
    if !matches!(wrapped_caps.scope, Scope::Namespaced) {
        return Err(Error::discovery(format!(
            "wrapped object resource {} must be namespaced to live in mailbox namespaces",
            wrapped_resource.plural
        ))
        .into());
    }
    info!(
        resource = %wrapped_resource.plural,
        api_version = %wrapped_resource.api_version,
        "discovered wrapped object resource"
    );

    // Reflector stores backing the controller's caches.
    let bindings_api: Api<Binding> = Api::all(wds_client.clone());
    let (binding_reader, binding_writer) = reflector::store::<Binding>();
    let binding_stream = reflector(
        binding_writer,
        watcher::watcher(bindings_api, watcher::Config::default()).default_backoff(),
    );

    let inventory_resource = inventory_api_resource();
    let inventory_api: Api<DynamicObject> = Api::all_with(its_client.clone(), &inventory_resource);
    let inventory_writer = reflector::store::Writer::<DynamicObject>::new(inventory_resource.clone());
    let inventory_reader = inventory_writer.as_reader();
    let inventory_stream = reflector(
        inventory_writer,
        watcher::watcher(inventory_api, watcher::Config::default()).default_backoff(),
    );

    let config_map_api = Api::namespaced(its_client.clone(), PROPERTY_CONFIGMAP_NAMESPACE);
    let (config_map_reader, config_map_writer) = reflector::store();
    let config_map_stream = reflector(
        config_map_writer,
        watcher::watcher(config_map_api, watcher::Config::default()).default_backoff(),
    );

    let wrapped_api: Api<DynamicObject> = Api::all_with(its_client.clone(), &wrapped_resource);
    let wrapped_stream =
        watcher::watcher(wrapped_api, watcher::Config::default()).default_backoff();

    let controller = Arc::new(TransportController::new(ControllerParams {
        wds_name: cli.wds_name.clone(),
        binding_cache: Arc::new(ReflectorBindingCache::new(binding_reader.clone())),
        inventory_cache: Arc::new(ReflectorInventoryCache::new(
            inventory_reader.clone(),
            inventory_resource,
        )),
        property_config_maps: Arc::new(ReflectorPropertyConfigMapCache::new(
            config_map_reader.clone(),
            PROPERTY_CONFIGMAP_NAMESPACE,
        )),
        binding_client: Arc::new(KubeBindingClient::new(wds_client.clone())),
        workload_client: Arc::new(KubeWorkloadClient::new(wds_client)),
        wrapped_object_client: Arc::new(KubeWrappedObjectClient::new(
            its_client.clone(),
            wrapped_resource,
        )),
        namespace_client: Arc::new(KubeNamespaceClient::new(its_client)),
        transport,
        customizer: Arc::new(TemplateExpander::new()),
        cleaner: ObjectCleaner::with_builtin_filters(),
    }));

    // Event pumps: translate watch events into queue entries.
    let pumps = vec![
        tokio::spawn({
            let controller = controller.clone();
            pump(binding_stream, "bindings", move |binding: Binding| {
                if let Some(name) = &binding.metadata.name {
                    controller.handle_binding_event(name);
                }
            })
        }),
        tokio::spawn({
            let controller = controller.clone();
            pump(wrapped_stream, "wrapped-objects", move |object: DynamicObject| {
                controller.handle_wrapped_object_event(&object);
            })
        }),
        tokio::spawn({
            let controller = controller.clone();
            pump(inventory_stream, "inventory", move |record: DynamicObject| {
                if let Some(name) = &record.metadata.name {
                    controller.handle_properties_event(name);
                }
            })
        }),
        tokio::spawn({
            let controller = controller.clone();
            pump(
                config_map_stream,
                "property-configmaps",
                move |cm: k8s_openapi::api::core::v1::ConfigMap| {
                    if let Some(name) = &cm.metadata.name {
                        controller.handle_properties_event(name);
                    }
                },
            )
        }),
    ];

    info!("waiting for caches to sync");
    binding_reader
        .wait_until_ready()
        .await
        .map_err(|e| anyhow::anyhow!("binding cache failed to sync: {e}"))?;
    inventory_reader
        .wait_until_ready()
        .await
        .map_err(|e| anyhow::anyhow!("inventory cache failed to sync: {e}"))?;
    config_map_reader
        .wait_until_ready()
        .await
        .map_err(|e| anyhow::anyhow!("property ConfigMap cache failed to sync: {e}"))?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
            cancel.cancel();
        });
    }

    controller.run(cancel, cli.workers_count.max(1)).await;

    for task in pumps {
        task.abort();
    }
    info!("transport controller shut down");
    Ok(())
}
