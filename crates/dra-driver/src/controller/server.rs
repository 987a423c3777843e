//! Framework-facing gRPC service of the controller.

pub mod proto {
    tonic::include_proto!("dra.v1alpha1");
}

use std::sync::Arc;

use proto::dra_controller_server::DraController;
use proto::dra_controller_server::DraControllerServer;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tracing::info;
use tracing::warn;

use crate::ledger::LedgerStore;
use crate::util::KeyedAsyncLock;

use super::driver::Driver;
use super::params::ParamsStore;
use super::types::ClaimAllocation;
use super::types::ClaimParams;
use super::types::ClassParams;
use super::types::ParametersRef;
use super::types::PodRef;
use super::types::ResourceClaim;
use super::types::ResourceClass;

/// Serves the five framework operations. Claim flows are bounded by a
/// worker semaphore; operations touching the same claim UID are
/// serialized by a keyed lock.
pub struct DraControllerService<L, P> {
    driver: Arc<Driver<L, P>>,
    claim_locks: KeyedAsyncLock<String>,
    workers: Arc<Semaphore>,
    cancellation_token: CancellationToken,
}

impl<L, P> DraControllerService<L, P>
where
    L: LedgerStore + 'static,
    P: ParamsStore + 'static,
{
    pub fn new(
        driver: Arc<Driver<L, P>>,
        workers: usize,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            driver,
            claim_locks: KeyedAsyncLock::new(),
            workers: Arc::new(Semaphore::new(workers.max(1))),
            cancellation_token,
        }
    }

    /// Serves until the cancellation token fires.
    pub async fn run(self, listen_addr: &str) -> anyhow::Result<()> {
        let addr = listen_addr.parse()?;
        let cancellation_token = self.cancellation_token.clone();

        info!("starting controller service on {listen_addr}");
        tonic::transport::Server::builder()
            .add_service(DraControllerServer::new(self))
            .serve_with_shutdown(addr, cancellation_token.cancelled_owned())
            .await?;
        Ok(())
    }

    /// Resolves both parameter objects for one framework claim entry.
    async fn resolve(
        &self,
        entry: &proto::ClaimAllocation,
    ) -> Result<ClaimAllocation, (String, String)> {
        let claim = entry
            .claim
            .as_ref()
            .map(decode_claim)
            .ok_or_else(|| (String::new(), "missing claim".to_string()))?;
        let class = entry
            .class
            .as_ref()
            .map(decode_class)
            .ok_or_else(|| (claim.uid.clone(), "missing class".to_string()))?;

        let class_params = self
            .driver
            .resolve_class(&class)
            .await
            .map_err(|e| (claim.uid.clone(), e.to_string()))?;
        let claim_params = self
            .driver
            .resolve_claim(&claim, &class)
            .await
            .map_err(|e| (claim.uid.clone(), e.to_string()))?;

        Ok(ClaimAllocation::new(claim, class_params, claim_params))
    }
}

fn decode_ref(reference: &proto::ParametersRef) -> ParametersRef {
    ParametersRef {
        api_group: reference.api_group.clone(),
        kind: reference.kind.clone(),
        name: reference.name.clone(),
    }
}

fn decode_class(class: &proto::ResourceClass) -> ResourceClass {
    ResourceClass {
        name: class.name.clone(),
        driver_name: class.driver_name.clone(),
        parameters_ref: class.parameters_ref.as_ref().map(decode_ref),
    }
}

fn decode_claim(claim: &proto::ResourceClaim) -> ResourceClaim {
    ResourceClaim {
        uid: claim.uid.clone(),
        name: claim.name.clone(),
        namespace: claim.namespace.clone(),
        parameters_ref: claim.parameters_ref.as_ref().map(decode_ref),
        allocated_node: match claim.allocated_node.is_empty() {
            true => None,
            false => Some(claim.allocated_node.clone()),
        },
    }
}

#[tonic::async_trait]
impl<L, P> DraController for DraControllerService<L, P>
where
    L: LedgerStore + 'static,
    P: ParamsStore + 'static,
{
    async fn get_class_parameters(
        &self,
        request: Request<proto::GetClassParametersRequest>,
    ) -> Result<Response<proto::GetClassParametersResponse>, Status> {
        let request = request.into_inner();
        let class = request
            .class
            .as_ref()
            .map(decode_class)
            .ok_or_else(|| Status::invalid_argument("missing class"))?;

        let params = self
            .driver
            .resolve_class(&class)
            .await
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let ClassParams::Gpu(spec) = params;
        let parameters = serde_json::to_vec(&spec)
            .map_err(|e| Status::internal(format!("failed to encode class parameters: {e}")))?;
        Ok(Response::new(proto::GetClassParametersResponse {
            parameters,
        }))
    }

    async fn get_claim_parameters(
        &self,
        request: Request<proto::GetClaimParametersRequest>,
    ) -> Result<Response<proto::GetClaimParametersResponse>, Status> {
        let request = request.into_inner();
        let claim = request
            .claim
            .as_ref()
            .map(decode_claim)
            .ok_or_else(|| Status::invalid_argument("missing claim"))?;
        let class = request
            .class
            .as_ref()
            .map(decode_class)
            .ok_or_else(|| Status::invalid_argument("missing class"))?;

        let params = self
            .driver
            .resolve_claim(&claim, &class)
            .await
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let ClaimParams::Gpu(spec) = params;
        let parameters = serde_json::to_vec(&spec)
            .map_err(|e| Status::internal(format!("failed to encode claim parameters: {e}")))?;
        Ok(Response::new(proto::GetClaimParametersResponse {
            parameters,
        }))
    }

    async fn allocate(
        &self,
        request: Request<proto::AllocateRequest>,
    ) -> Result<Response<proto::AllocateResponse>, Status> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| Status::unavailable("controller shutting down"))?;
        let request = request.into_inner();

        let mut results = Vec::with_capacity(request.claims.len());
        for entry in &request.claims {
            let mut claim_allocation = match self.resolve(entry).await {
                Ok(claim_allocation) => claim_allocation,
                Err((claim_uid, error)) => {
                    warn!(claim_uid, "allocate: parameter resolution failed: {error}");
                    results.push(proto::ClaimAllocationResult {
                        claim_uid,
                        allocation: None,
                        error,
                    });
                    continue;
                }
            };

            // One claim at a time, in input order, serialized per UID
            // against concurrent calls.
            let _guard = self.claim_locks.lock(&claim_allocation.claim.uid).await;
            self.driver
                .allocate(
                    std::slice::from_mut(&mut claim_allocation),
                    &request.selected_node,
                    &self.cancellation_token,
                )
                .await;

            results.push(proto::ClaimAllocationResult {
                claim_uid: claim_allocation.claim.uid.clone(),
                allocation: claim_allocation.allocation.map(|a| proto::AllocationResult {
                    available_on_node: a.available_on_node,
                    shareable: a.shareable,
                }),
                error: claim_allocation
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_default(),
            });
        }

        Ok(Response::new(proto::AllocateResponse { claims: results }))
    }

    async fn deallocate(
        &self,
        request: Request<proto::DeallocateRequest>,
    ) -> Result<Response<proto::DeallocateResponse>, Status> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| Status::unavailable("controller shutting down"))?;
        let request = request.into_inner();
        let claim = request
            .claim
            .as_ref()
            .map(decode_claim)
            .ok_or_else(|| Status::invalid_argument("missing claim"))?;

        let _guard = self.claim_locks.lock(&claim.uid).await;
        self.driver
            .deallocate(&claim, &self.cancellation_token)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        Ok(Response::new(proto::DeallocateResponse {}))
    }

    async fn unsuitable_nodes(
        &self,
        request: Request<proto::UnsuitableNodesRequest>,
    ) -> Result<Response<proto::UnsuitableNodesResponse>, Status> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| Status::unavailable("controller shutting down"))?;
        let request = request.into_inner();

        let pod = request
            .pod
            .as_ref()
            .map(|p| PodRef {
                name: p.name.clone(),
                namespace: p.namespace.clone(),
                uid: p.uid.clone(),
            })
            .ok_or_else(|| Status::invalid_argument("missing pod"))?;

        // A claim whose parameters fail to resolve gets every candidate
        // marked unsuitable: a safe negative decision instead of an
        // error.
        let mut rejected = Vec::new();
        let mut claims = Vec::new();
        for entry in &request.claims {
            match self.resolve(entry).await {
                Ok(claim_allocation) => claims.push(claim_allocation),
                Err((claim_uid, error)) => {
                    warn!(
                        claim_uid,
                        "unsuitable_nodes: parameter resolution failed: {error}"
                    );
                    rejected.push(claim_uid);
                }
            }
        }

        self.driver
            .unsuitable_nodes(
                &pod,
                &mut claims,
                &request.potential_nodes,
                &self.cancellation_token,
            )
            .await;

        let mut response = Vec::with_capacity(claims.len() + rejected.len());
        for claim_allocation in claims {
            response.push(proto::ClaimUnsuitableNodes {
                claim_uid: claim_allocation.claim.uid,
                unsuitable_nodes: claim_allocation.unsuitable_nodes,
            });
        }
        for claim_uid in rejected {
            response.push(proto::ClaimUnsuitableNodes {
                claim_uid,
                unsuitable_nodes: request.potential_nodes.clone(),
            });
        }

        Ok(Response::new(proto::UnsuitableNodesResponse {
            claims: response,
        }))
    }
}
