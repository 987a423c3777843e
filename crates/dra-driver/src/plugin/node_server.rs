//! Kubelet-facing DRA node service.

pub mod proto {
    tonic::include_proto!("v1alpha3");
}

use std::collections::HashMap;
use std::sync::Arc;

use dra_api::AllocationState;
use dra_api::DeviceLedger;
use dra_api::GpuDevice;
use error_stack::Report;
use error_stack::ResultExt;
use proto::node_server::Node;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tracing::debug;
use tracing::info;

use crate::ledger::update_with_retry;
use crate::ledger::LedgerStore;
use crate::ledger::MutateOutcome;
use crate::ledger::RetrySettings;
use crate::metrics::PREPARED_CLAIMS;

use super::cdi::CdiError;
use super::cdi::CdiWriter;
use super::PluginError;

/// Serves `NodePrepareResources`, `NodeUnprepareResources`, and
/// `NodeListAndWatchResources` for one node.
pub struct NodeService<L> {
    ledgers: Arc<L>,
    cdi: Arc<CdiWriter>,
    node_name: String,
    inventory: watch::Receiver<Vec<GpuDevice>>,
    retry: RetrySettings,
    cancellation_token: CancellationToken,
}

impl<L> NodeService<L>
where
    L: LedgerStore + 'static,
{
    pub fn new(
        ledgers: Arc<L>,
        cdi: Arc<CdiWriter>,
        node_name: String,
        inventory: watch::Receiver<Vec<GpuDevice>>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            ledgers,
            cdi,
            node_name,
            inventory,
            retry: RetrySettings::default(),
            cancellation_token,
        }
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// Walks a claim's devices `allocated → prepared` and (re)emits the
    /// claim's CDI spec. Replays are idempotent; a claim the controller
    /// has not committed yet yields an empty response.
    pub async fn prepare_claim(
        &self,
        claim_uid: &str,
    ) -> Result<Vec<String>, Report<PluginError>> {
        let mut qualified_names: Vec<String> = Vec::new();
        let mut cdi_failure: Option<Report<CdiError>> = None;

        let ledger = update_with_retry(
            self.ledgers.as_ref(),
            &self.node_name,
            &self.cancellation_token,
            &self.retry,
            |ledger| {
                // Fresh decision per attempt.
                qualified_names.clear();
                cdi_failure = None;

                let Some(allocations) = ledger.status.allocations.get_mut(claim_uid) else {
                    return Ok(MutateOutcome::Unchanged);
                };

                let mut prepared_devices = Vec::new();
                let mut transitioned = false;
                for allocation in allocations.iter_mut() {
                    match allocation.state {
                        AllocationState::Prepared => {
                            qualified_names.push(CdiWriter::qualified_name(&allocation.device.uuid));
                            prepared_devices.push(allocation.device.clone());
                        }
                        AllocationState::Allocated => {
                            allocation.state = AllocationState::Prepared;
                            transitioned = true;
                            qualified_names.push(CdiWriter::qualified_name(&allocation.device.uuid));
                            prepared_devices.push(allocation.device.clone());
                        }
                        // Not committed by the controller; nothing to
                        // prepare for this device.
                        AllocationState::Hold => {}
                    }
                }

                if prepared_devices.is_empty() {
                    qualified_names.clear();
                    return Ok(MutateOutcome::Unchanged);
                }

                if !transitioned {
                    // Pure replay: ledger and spec file already in place.
                    return Ok(MutateOutcome::Unchanged);
                }

                // The spec file lands before the conditional write so a
                // persisted prepared state always has a file behind it.
                if let Err(e) = self.cdi.write(claim_uid, &prepared_devices) {
                    qualified_names.clear();
                    cdi_failure = Some(e);
                    return Ok(MutateOutcome::Unchanged);
                }
                Ok(MutateOutcome::Changed)
            },
        )
        .await
        .change_context(PluginError::Ledger)?;

        if let Some(e) = cdi_failure {
            return Err(e.change_context(PluginError::Cdi));
        }

        set_prepared_claims_gauge(&ledger);
        if !qualified_names.is_empty() {
            info!(claim_uid, devices = qualified_names.len(), "claim prepared");
        }
        Ok(qualified_names)
    }

    /// Deletes the claim's CDI spec and drops its ledger entry. A claim
    /// with no ledger entry is a successful no-op.
    pub async fn unprepare_claim(&self, claim_uid: &str) -> Result<(), Report<PluginError>> {
        let mut cdi_failure: Option<Report<CdiError>> = None;

        let ledger = update_with_retry(
            self.ledgers.as_ref(),
            &self.node_name,
            &self.cancellation_token,
            &self.retry,
            |ledger| {
                cdi_failure = None;

                if !ledger.status.allocations.contains_key(claim_uid) {
                    return Ok(MutateOutcome::Unchanged);
                }

                if let Err(e) = self.cdi.remove(claim_uid) {
                    cdi_failure = Some(e);
                    return Ok(MutateOutcome::Unchanged);
                }

                ledger.status.allocations.remove(claim_uid);
                ledger.status.suitability.remove(claim_uid);
                Ok(MutateOutcome::Changed)
            },
        )
        .await
        .change_context(PluginError::Ledger)?;

        if let Some(e) = cdi_failure {
            return Err(e.change_context(PluginError::Cdi));
        }

        set_prepared_claims_gauge(&ledger);
        debug!(claim_uid, "claim unprepared");
        Ok(())
    }
}

fn set_prepared_claims_gauge(ledger: &DeviceLedger) {
    let prepared = ledger
        .status
        .allocations
        .values()
        .filter(|allocations| {
            allocations
                .iter()
                .any(|a| a.state == AllocationState::Prepared)
        })
        .count();
    PREPARED_CLAIMS.set(prepared as i64);
}

#[tonic::async_trait]
impl<L> Node for NodeService<L>
where
    L: LedgerStore + 'static,
{
    async fn node_prepare_resources(
        &self,
        request: Request<proto::NodePrepareResourcesRequest>,
    ) -> Result<Response<proto::NodePrepareResourcesResponse>, Status> {
        let request = request.into_inner();
        let mut claims = HashMap::with_capacity(request.claims.len());

        for claim in &request.claims {
            let response = match self.prepare_claim(&claim.uid).await {
                Ok(cdi_devices) => proto::NodePrepareResourceResponse {
                    cdi_devices,
                    error: String::new(),
                },
                Err(e) => proto::NodePrepareResourceResponse {
                    cdi_devices: Vec::new(),
                    error: e.to_string(),
                },
            };
            claims.insert(claim.uid.clone(), response);
        }

        Ok(Response::new(proto::NodePrepareResourcesResponse { claims }))
    }

    async fn node_unprepare_resources(
        &self,
        request: Request<proto::NodeUnprepareResourcesRequest>,
    ) -> Result<Response<proto::NodeUnprepareResourcesResponse>, Status> {
        let request = request.into_inner();
        let mut claims = HashMap::with_capacity(request.claims.len());

        for claim in &request.claims {
            let response = match self.unprepare_claim(&claim.uid).await {
                Ok(()) => proto::NodeUnprepareResourceResponse {
                    error: String::new(),
                },
                Err(e) => proto::NodeUnprepareResourceResponse {
                    error: e.to_string(),
                },
            };
            claims.insert(claim.uid.clone(), response);
        }

        Ok(Response::new(proto::NodeUnprepareResourcesResponse { claims }))
    }

    type NodeListAndWatchResourcesStream =
        ReceiverStream<Result<proto::NodeListAndWatchResourcesResponse, Status>>;

    async fn node_list_and_watch_resources(
        &self,
        _request: Request<proto::NodeListAndWatchResourcesRequest>,
    ) -> Result<Response<Self::NodeListAndWatchResourcesStream>, Status> {
        let (tx, rx) = mpsc::channel(4);
        let mut inventory = self.inventory.clone();
        let cancellation_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            loop {
                let instances: Vec<proto::NamedResourceInstance> = inventory
                    .borrow_and_update()
                    .iter()
                    .map(|device| proto::NamedResourceInstance {
                        name: device.uuid.clone(),
                    })
                    .collect();

                if tx
                    .send(Ok(proto::NodeListAndWatchResourcesResponse { instances }))
                    .await
                    .is_err()
                {
                    // Receiver hung up.
                    break;
                }

                select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("inventory stream shutdown requested");
                        break;
                    }
                    changed = inventory.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use dra_api::Allocation;
    use dra_api::ClaimReference;
    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::ledger::mock::InMemoryLedgerStore;

    const NODE: &str = "node-0";

    fn device(uuid: &str) -> GpuDevice {
        GpuDevice {
            uuid: uuid.to_string(),
            product_name: "NVIDIA Tesla V100".to_string(),
            vendor: "nvidia.com".to_string(),
        }
    }

    fn allocation(claim_uid: &str, uuid: &str, state: AllocationState) -> Allocation {
        Allocation {
            claim_ref: ClaimReference {
                namespace: "k8s-dra".to_string(),
                name: format!("claim-{claim_uid}"),
                uid: claim_uid.to_string(),
            },
            device: device(uuid),
            state,
        }
    }

    async fn service_with_ledger(
        dir: &TempDir,
        allocations: Vec<(&str, Vec<Allocation>)>,
    ) -> (NodeService<InMemoryLedgerStore>, Arc<InMemoryLedgerStore>) {
        let store = Arc::new(InMemoryLedgerStore::default());
        let mut ledger = DeviceLedger::new("k8s-dra", NODE, vec![device("u1"), device("u2")]);
        for (claim_uid, entries) in allocations {
            ledger.status.allocations.insert(claim_uid.to_string(), entries);
        }
        store.create(&ledger).await.expect("should create ledger");

        let (_, inventory_rx) = watch::channel(vec![device("u1"), device("u2")]);
        let service = NodeService::new(
            store.clone(),
            Arc::new(CdiWriter::new(dir.path())),
            NODE.to_string(),
            inventory_rx,
            CancellationToken::new(),
        );
        (service, store)
    }

    #[tokio::test]
    async fn prepare_transitions_and_writes_the_spec_file() {
        let dir = TempDir::new().expect("should create temp dir");
        let (service, store) = service_with_ledger(
            &dir,
            vec![("c1", vec![allocation("c1", "u1", AllocationState::Allocated)])],
        )
        .await;

        let names = service.prepare_claim("c1").await.expect("should prepare");
        assert_eq!(names, vec!["resources.ihcsim/gpu=u1".to_string()]);

        let ledger = store.get(NODE).await.expect("should read ledger");
        assert_eq!(
            ledger.status.allocations["c1"][0].state,
            AllocationState::Prepared
        );
        assert!(service.cdi.exists("c1"), "prepared implies a spec file");
    }

    #[tokio::test]
    async fn prepare_twice_is_idempotent() {
        let dir = TempDir::new().expect("should create temp dir");
        let (service, store) = service_with_ledger(
            &dir,
            vec![("c1", vec![allocation("c1", "u1", AllocationState::Allocated)])],
        )
        .await;

        let first = service.prepare_claim("c1").await.expect("first prepare");
        let ledger_after_first = store.get(NODE).await.expect("should read ledger");
        let file_after_first = std::fs::read_to_string(
            dir.path().join("resources.ihcsim-gpu-c1.json"),
        )
        .expect("spec file should exist");

        let second = service.prepare_claim("c1").await.expect("second prepare");
        let ledger_after_second = store.get(NODE).await.expect("should read ledger");
        let file_after_second = std::fs::read_to_string(
            dir.path().join("resources.ihcsim-gpu-c1.json"),
        )
        .expect("spec file should exist");

        assert_eq!(first, second, "same qualified names on replay");
        assert_eq!(
            ledger_after_first.metadata.resource_version,
            ledger_after_second.metadata.resource_version,
            "replay should not write the ledger"
        );
        assert_eq!(file_after_first, file_after_second);
    }

    #[tokio::test]
    async fn prepare_of_uncommitted_claim_is_an_empty_response() {
        let dir = TempDir::new().expect("should create temp dir");
        let (service, _) = service_with_ledger(&dir, vec![]).await;

        let names = service.prepare_claim("c9").await.expect("should no-op");
        assert!(names.is_empty());
        assert!(!service.cdi.exists("c9"), "no file for uncommitted claims");
    }

    #[tokio::test]
    async fn prepare_skips_hold_entries() {
        let dir = TempDir::new().expect("should create temp dir");
        let (service, store) = service_with_ledger(
            &dir,
            vec![("c1", vec![allocation("c1", "u1", AllocationState::Hold)])],
        )
        .await;

        let names = service.prepare_claim("c1").await.expect("should no-op");
        assert!(names.is_empty());

        let ledger = store.get(NODE).await.expect("should read ledger");
        assert_eq!(ledger.status.allocations["c1"][0].state, AllocationState::Hold);
    }

    #[tokio::test]
    async fn unprepare_round_trip_restores_the_ledger() {
        let dir = TempDir::new().expect("should create temp dir");
        let (service, store) = service_with_ledger(
            &dir,
            vec![("c1", vec![allocation("c1", "u1", AllocationState::Allocated)])],
        )
        .await;

        service.prepare_claim("c1").await.expect("should prepare");
        service.unprepare_claim("c1").await.expect("should unprepare");

        let ledger = store.get(NODE).await.expect("should read ledger");
        assert!(
            !ledger.status.allocations.contains_key("c1"),
            "unprepare drops the claim entry"
        );
        assert!(!service.cdi.exists("c1"), "absent claim has no spec file");
    }

    #[tokio::test]
    async fn unprepare_of_unknown_claim_is_a_noop() {
        let dir = TempDir::new().expect("should create temp dir");
        let (service, store) = service_with_ledger(&dir, vec![]).await;
        let before = store.get(NODE).await.expect("should read ledger");

        service.unprepare_claim("c9").await.expect("should no-op");

        let after = store.get(NODE).await.expect("should read ledger");
        assert_eq!(before.metadata.resource_version, after.metadata.resource_version);
    }

    #[tokio::test]
    async fn prepare_survives_a_conflicting_writer() {
        let dir = TempDir::new().expect("should create temp dir");
        let (service, store) = service_with_ledger(
            &dir,
            vec![("c1", vec![allocation("c1", "u1", AllocationState::Allocated)])],
        )
        .await;
        store.inject_conflicts(1);

        let names = service
            .prepare_claim("c1")
            .await
            .expect("should prepare after retry");
        assert_eq!(names.len(), 1);

        let ledger = store.get(NODE).await.expect("should read ledger");
        assert_eq!(
            ledger.status.allocations["c1"][0].state,
            AllocationState::Prepared
        );
    }
}
