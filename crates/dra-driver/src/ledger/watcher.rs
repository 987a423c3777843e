use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use dra_api::DeviceLedger;
use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use kube::Api;
use kube::Client;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::LedgerError;

/// Shared read-through cache of ledger snapshots, keyed by node name.
///
/// The cache serves only the suitability read path; every mutation goes
/// through a fresh read in the store layer.
pub type LedgerCache = Arc<RwLock<HashMap<String, DeviceLedger>>>;

/// Maintains a [`LedgerCache`] from a watch stream on the ledger
/// namespace. Reconnects with a delay when the stream fails.
pub struct LedgerWatcher {
    namespace: String,
    cache: LedgerCache,
}

impl LedgerWatcher {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn cache(&self) -> LedgerCache {
        self.cache.clone()
    }

    #[tracing::instrument(skip(self, client, cancellation_token), fields(namespace = %self.namespace))]
    pub async fn run(
        &self,
        client: Client,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<LedgerError>> {
        info!("starting ledger watcher");
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("ledger watcher shutdown requested");
                    break;
                }
                result = self.watch_ledgers(&client) => {
                    match result {
                        Ok(()) => {
                            warn!("ledger watch stream ended unexpectedly, restarting...");
                        }
                        Err(e) => {
                            error!("ledger watch failed: {e:?}");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn watch_ledgers(&self, client: &Client) -> Result<(), Report<LedgerError>> {
        let api: Api<DeviceLedger> = Api::namespaced(client.clone(), &self.namespace);
        let mut stream = watcher(api, watcher::Config::default()).boxed();

        while let Some(event) = stream.next().await {
            let event = event.change_context(LedgerError::Api {
                message: "ledger watch stream error".to_string(),
            })?;
            self.apply(event);
        }

        Ok(())
    }

    fn apply(&self, event: Event<DeviceLedger>) {
        let mut cache = self.cache.write().expect("ledger cache lock poisoned");
        match event {
            Event::Init => cache.clear(),
            Event::InitApply(ledger) | Event::Apply(ledger) => {
                cache.insert(ledger.node_name().to_string(), ledger);
            }
            Event::Delete(ledger) => {
                cache.remove(ledger.node_name());
            }
            Event::InitDone => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use dra_api::GpuDevice;
    use similar_asserts::assert_eq;

    use super::*;

    fn ledger(node: &str) -> DeviceLedger {
        DeviceLedger::new(
            "k8s-dra",
            node,
            vec![GpuDevice {
                uuid: "u1".to_string(),
                product_name: "NVIDIA Tesla V100".to_string(),
                vendor: "nvidia.com".to_string(),
            }],
        )
    }

    #[test]
    fn apply_and_delete_keep_the_cache_in_step() {
        let watcher = LedgerWatcher::new("k8s-dra");

        watcher.apply(Event::Apply(ledger("node-0")));
        watcher.apply(Event::Apply(ledger("node-1")));
        assert_eq!(watcher.cache().read().unwrap().len(), 2);

        watcher.apply(Event::Delete(ledger("node-0")));
        let cache = watcher.cache();
        let cache = cache.read().unwrap();
        assert!(!cache.contains_key("node-0"));
        assert!(cache.contains_key("node-1"));
    }

    #[test]
    fn init_restart_drops_stale_entries() {
        let watcher = LedgerWatcher::new("k8s-dra");
        watcher.apply(Event::Apply(ledger("stale")));

        watcher.apply(Event::Init);
        watcher.apply(Event::InitApply(ledger("fresh")));
        watcher.apply(Event::InitDone);

        let cache = watcher.cache();
        let cache = cache.read().unwrap();
        assert!(!cache.contains_key("stale"));
        assert!(cache.contains_key("fresh"));
    }
}
