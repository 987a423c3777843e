use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::config::ControllerArgs;
use crate::controller::Driver;
use crate::controller::DraControllerService;
use crate::controller::KubeParamsStore;
use crate::controller::ReservationStore;
use crate::kube_client;
use crate::ledger::KubeLedgerStore;
use crate::ledger::LedgerWatcher;
use crate::logging;
use crate::metrics;

use super::spawn_signal_handler;

pub async fn run_controller(args: ControllerArgs) -> Result<()> {
    logging::init();
    metrics::register_metrics();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = args.workers,
        qps = args.api_qps,
        burst = args.api_burst,
        namespace = %args.namespace,
        "starting DRA driver controller"
    );

    let client = kube_client::init_kube_client(args.kubeconfig.clone())
        .await
        .map_err(|e| anyhow!("{e:?}"))?;

    let cancellation_token = CancellationToken::new();
    spawn_signal_handler(cancellation_token.clone());

    let ledgers = Arc::new(KubeLedgerStore::new(client.clone(), &args.namespace));
    let params = Arc::new(KubeParamsStore::new(client.clone()));
    let reservations = Arc::new(ReservationStore::default());

    let watcher = LedgerWatcher::new(&args.namespace);
    let cache = watcher.cache();

    let driver = Arc::new(Driver::new(ledgers, params, reservations).with_cache(cache));
    info!(driver = driver.name(), listen_addr = %args.listen_addr, "driver ready");

    let watcher_task = tokio::spawn({
        let client = client.clone();
        let cancellation_token = cancellation_token.clone();
        async move {
            if let Err(e) = watcher.run(client, cancellation_token).await {
                warn!("ledger watcher stopped: {e:?}");
            }
        }
    });

    let metrics_task = tokio::spawn(metrics::run_metrics_server(
        args.metrics_port,
        args.metrics_path.clone(),
        cancellation_token.clone(),
    ));
    let debug_task = tokio::spawn(metrics::run_debug_server(
        args.pprof_port,
        cancellation_token.clone(),
    ));

    let service = DraControllerService::new(driver, args.workers, cancellation_token.clone());
    let result = service.run(&args.listen_addr).await;

    cancellation_token.cancel();
    let _ = tokio::join!(watcher_task, metrics_task, debug_task);

    info!("controller stopped");
    result
}
