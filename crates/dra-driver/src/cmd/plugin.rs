use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Result;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::PluginArgs;
use crate::kube_client;
use crate::ledger::KubeLedgerStore;
use crate::logging;
use crate::metrics;
use crate::plugin::bootstrap_ledger;
use crate::plugin::discovery::discover_devices;
use crate::plugin::server::SocketPaths;
use crate::plugin::CdiWriter;
use crate::plugin::NodePlugin;
use crate::plugin::NodeService;

pub async fn run_plugin(args: PluginArgs) -> Result<()> {
    logging::init();
    metrics::register_metrics();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        node_name = %args.node_name,
        namespace = %args.namespace,
        cdi_root = %args.cdi_root.display(),
        "starting DRA driver kubelet plugin"
    );

    let client = kube_client::init_kube_client(args.kubeconfig.clone())
        .await
        .map_err(|e| anyhow!("{e:?}"))?;

    let cancellation_token = CancellationToken::new();
    super::spawn_signal_handler(cancellation_token.clone());

    let cdi = Arc::new(CdiWriter::new(args.cdi_root.clone()));
    let devices = discover_devices(&cdi, args.max_available_gpu).map_err(|e| anyhow!("{e:?}"))?;

    let ledgers = Arc::new(KubeLedgerStore::new(client, &args.namespace));
    bootstrap_ledger(ledgers.as_ref(), &args.namespace, &args.node_name, devices.clone())
        .await
        .map_err(|e| anyhow!("{e:?}"))?;

    // The sender stays alive for the lifetime of the plugin; inventory
    // changes after startup would be published through it.
    let (inventory_tx, inventory_rx) = watch::channel(devices);

    let node_service = NodeService::new(
        ledgers,
        cdi,
        args.node_name.clone(),
        inventory_rx,
        cancellation_token.clone(),
    );

    let metrics_task = tokio::spawn(metrics::run_metrics_server(
        args.metrics_port,
        args.metrics_path.clone(),
        cancellation_token.clone(),
    ));

    let paths = SocketPaths::new(&args.kubelet_plugins_registry, &args.kubelet_plugins_dir);
    let plugin = NodePlugin::new(node_service, paths);
    let result = plugin
        .run(cancellation_token.clone())
        .await
        .map_err(|e| anyhow!("{e:?}"));

    cancellation_token.cancel();
    let _ = tokio::join!(metrics_task);
    drop(inventory_tx);

    info!("plugin stopped");
    result
}
