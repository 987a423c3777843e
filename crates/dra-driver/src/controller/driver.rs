use std::sync::Arc;

use dra_api::device::matches_selectors;
use dra_api::Allocation;
use dra_api::AllocationState;
use dra_api::ClaimReference;
use dra_api::DeviceLedger;
use dra_api::DeviceSelector;
use dra_api::GpuClaimParametersSpec;
use dra_api::GpuClassParametersSpec;
use dra_api::GpuDevice;
use dra_api::NodeSuitability;
use dra_api::API_GROUP;
use dra_api::DRIVER_NAME;
use error_stack::Report;
use error_stack::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::ledger::update_with_retry;
use crate::ledger::LedgerCache;
use crate::ledger::LedgerStore;
use crate::ledger::MutateOutcome;
use crate::ledger::RetrySettings;
use crate::metrics::ALLOCATIONS_TOTAL;
use crate::metrics::DEALLOCATIONS_TOTAL;
use crate::metrics::UNSUITABLE_VERDICTS_TOTAL;

use super::reservations::ReservationStore;
use super::types::AllocationResult;
use super::types::ClaimAllocation;
use super::types::ClaimParams;
use super::types::ClassParams;
use super::types::PodRef;
use super::types::ResourceClaim;
use super::types::ResourceClass;
use super::DriverError;

const CLAIM_PARAMETERS_KIND: &str = "GpuClaimParameters";

/// Orchestrator-facing allocation driver. Resolves parameters, computes
/// node suitability, and walks claims through bind and release against
/// the per-node device ledgers.
pub struct Driver<L, P> {
    ledgers: Arc<L>,
    params: Arc<P>,
    reservations: Arc<ReservationStore>,
    cache: Option<LedgerCache>,
    retry: RetrySettings,
}

impl<L, P> Driver<L, P>
where
    L: LedgerStore,
    P: super::params::ParamsStore,
{
    pub fn new(ledgers: Arc<L>, params: Arc<P>, reservations: Arc<ReservationStore>) -> Self {
        Self {
            ledgers,
            params,
            reservations,
            cache: None,
            retry: RetrySettings::default(),
        }
    }

    /// Attaches the informer cache serving the suitability read path.
    pub fn with_cache(mut self, cache: LedgerCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    /// Resolves the parameters of a resource class. A class with no
    /// parameter reference allows every device.
    pub async fn resolve_class(
        &self,
        class: &ResourceClass,
    ) -> Result<ClassParams, Report<DriverError>> {
        let Some(parameters_ref) = &class.parameters_ref else {
            return Ok(ClassParams::Gpu(GpuClassParametersSpec {
                device_selector: vec![DeviceSelector {
                    name: "*".to_string(),
                    vendor: "*".to_string(),
                }],
            }));
        };

        if class.driver_name != DRIVER_NAME {
            return Err(Report::new(DriverError::WrongDriver {
                actual: class.driver_name.clone(),
                expected: DRIVER_NAME.to_string(),
            }));
        }

        if parameters_ref.api_group != API_GROUP {
            return Err(Report::new(DriverError::WrongApiGroup {
                actual: parameters_ref.api_group.clone(),
                expected: API_GROUP.to_string(),
            }));
        }

        let params = self.params.class_params(&parameters_ref.name).await?;
        Ok(ClassParams::Gpu(params.spec))
    }

    /// Resolves the parameters of a resource claim. A claim with no
    /// parameter reference defaults to one device.
    pub async fn resolve_claim(
        &self,
        claim: &ResourceClaim,
        class: &ResourceClass,
    ) -> Result<ClaimParams, Report<DriverError>> {
        let Some(parameters_ref) = &claim.parameters_ref else {
            return Ok(ClaimParams::Gpu(GpuClaimParametersSpec { count: 1 }));
        };

        if class.driver_name != DRIVER_NAME {
            return Err(Report::new(DriverError::WrongDriver {
                actual: class.driver_name.clone(),
                expected: DRIVER_NAME.to_string(),
            }));
        }

        if parameters_ref.api_group != API_GROUP {
            return Err(Report::new(DriverError::WrongApiGroup {
                actual: parameters_ref.api_group.clone(),
                expected: API_GROUP.to_string(),
            }));
        }

        // Kind discrimination is case-insensitive.
        if !parameters_ref.kind.eq_ignore_ascii_case(CLAIM_PARAMETERS_KIND) {
            return Err(Report::new(DriverError::UnsupportedParametersKind {
                kind: parameters_ref.kind.clone(),
            }));
        }

        let params = self
            .params
            .claim_params(&claim.namespace, &parameters_ref.name)
            .await?;
        validate_claim_params(&params.spec)?;
        Ok(ClaimParams::Gpu(params.spec))
    }

    /// Computes, for every candidate node, whether it can satisfy each
    /// claim, records speculative reservations for the picks, and
    /// appends failing nodes to the claims' unsuitable lists.
    ///
    /// A missing or unreadable ledger is a scheduling signal, not an
    /// error: the node becomes unsuitable for every claim.
    #[tracing::instrument(skip_all, fields(pod = %pod.name, claims = claims.len(), nodes = potential_nodes.len()))]
    pub async fn unsuitable_nodes(
        &self,
        pod: &PodRef,
        claims: &mut [ClaimAllocation],
        potential_nodes: &[String],
        cancellation_token: &CancellationToken,
    ) {
        for node in potential_nodes {
            let ledger = match self.read_for_scheduling(node).await {
                Ok(ledger) => ledger,
                Err(e) => {
                    debug!(node, "ledger unreadable, marking node unsuitable: {e:?}");
                    for claim in claims.iter_mut() {
                        claim.unsuitable_nodes.push(node.clone());
                        UNSUITABLE_VERDICTS_TOTAL.inc();
                    }
                    continue;
                }
            };

            let verdicts = self.suitability_pass(&ledger, claims, node);

            // Advisory diagnostic metadata; a failed write never blocks
            // the verdicts already recorded on the claims.
            if let Err(e) = update_with_retry(
                self.ledgers.as_ref(),
                node,
                cancellation_token,
                &self.retry,
                |fresh| {
                    for (claim_uid, verdict) in &verdicts {
                        fresh
                            .status
                            .suitability
                            .insert(claim_uid.clone(), *verdict);
                    }
                    Ok(MutateOutcome::Changed)
                },
            )
            .await
            {
                warn!(node, "failed to record suitability verdicts: {e:?}");
            }
        }
    }

    /// One pass over the claims against a single ledger snapshot.
    /// Devices picked for one claim are consumed for the claims after
    /// it; partial picks still land in the reservation store.
    fn suitability_pass(
        &self,
        ledger: &DeviceLedger,
        claims: &mut [ClaimAllocation],
        node: &str,
    ) -> Vec<(String, NodeSuitability)> {
        let mut available: Vec<GpuDevice> = ledger
            .status
            .available(&ledger.spec.allocatable)
            .into_iter()
            .cloned()
            .collect();

        let mut verdicts = Vec::with_capacity(claims.len());
        for claim in claims.iter_mut() {
            let claim_uid = claim.claim.uid.clone();
            let requested = claim.claim_params.count();

            let reserved = match ledger.status.allocations.get(&claim_uid) {
                // Bind already committed devices for this claim; its
                // verdict rides on that count.
                Some(existing) => existing.len(),
                None => {
                    let picked =
                        pick_devices(&mut available, claim.class_params.selectors(), requested);
                    let picked_count = picked.len();
                    self.reservations.reserve(&claim_uid, node, picked);
                    picked_count
                }
            };

            let verdict = if reserved < requested {
                claim.unsuitable_nodes.push(node.to_string());
                UNSUITABLE_VERDICTS_TOTAL.inc();
                NodeSuitability::Unsuitable
            } else {
                NodeSuitability::Suitable
            };
            verdicts.push((claim_uid, verdict));
        }

        verdicts
    }

    /// Commits claims to the selected node. Claims are processed in
    /// input order; one claim's failure does not stop the others.
    #[tracing::instrument(skip_all, fields(node = selected_node, claims = claims.len()))]
    pub async fn allocate(
        &self,
        claims: &mut [ClaimAllocation],
        selected_node: &str,
        cancellation_token: &CancellationToken,
    ) {
        for claim in claims.iter_mut() {
            if selected_node.is_empty() {
                claim.error = Some(Report::new(DriverError::ImmediateAllocationUnsupported));
                continue;
            }

            match self
                .allocate_claim(claim, selected_node, cancellation_token)
                .await
            {
                Ok(result) => {
                    info!(claim_uid = %claim.claim.uid, node = selected_node, "claim allocated");
                    claim.allocation = Some(result);
                }
                Err(e) => claim.error = Some(e),
            }
        }
    }

    async fn allocate_claim(
        &self,
        claim: &ClaimAllocation,
        node: &str,
        cancellation_token: &CancellationToken,
    ) -> Result<AllocationResult, Report<DriverError>> {
        let claim_uid = claim.claim.uid.clone();
        let requested = claim.claim_params.count();
        let selectors = claim.class_params.selectors().to_vec();
        let reservation = self.reservations.lookup(&claim_uid, node);
        let claim_ref = ClaimReference {
            namespace: claim.claim.namespace.clone(),
            name: claim.claim.name.clone(),
            uid: claim_uid.clone(),
        };

        // Set when an attempt finds too few devices; re-evaluated on
        // every refreshed snapshot.
        let mut capacity_short: Option<usize> = None;

        update_with_retry(
            self.ledgers.as_ref(),
            node,
            cancellation_token,
            &self.retry,
            |ledger| {
                capacity_short = None;

                // An existing non-empty entry means a prior call already
                // bound this claim; replay idempotently.
                if ledger
                    .status
                    .allocations
                    .get(&claim_uid)
                    .is_some_and(|a| !a.is_empty())
                {
                    return Ok(MutateOutcome::Unchanged);
                }

                let mut available: Vec<GpuDevice> = ledger
                    .status
                    .available(&ledger.spec.allocatable)
                    .into_iter()
                    .cloned()
                    .collect();

                let devices = match &reservation {
                    Some(reserved)
                        if reserved.len() == requested
                            && reserved
                                .iter()
                                .all(|d| available.iter().any(|a| a.uuid == d.uuid)) =>
                    {
                        reserved.clone()
                    }
                    _ => pick_devices(&mut available, &selectors, requested),
                };

                if devices.len() < requested {
                    capacity_short = Some(devices.len());
                    return Ok(MutateOutcome::Unchanged);
                }

                let allocations = devices
                    .into_iter()
                    .map(|device| Allocation {
                        claim_ref: claim_ref.clone(),
                        device,
                        state: AllocationState::Allocated,
                    })
                    .collect();
                ledger.status.allocations.insert(claim_uid.clone(), allocations);
                Ok(MutateOutcome::Changed)
            },
        )
        .await
        .change_context(DriverError::Ledger)?;

        if let Some(available) = capacity_short {
            return Err(Report::new(DriverError::Capacity {
                node: node.to_string(),
                claim_uid,
                available,
                requested,
            }));
        }

        self.reservations.release(&claim_uid, node);
        ALLOCATIONS_TOTAL.inc();
        Ok(AllocationResult {
            available_on_node: node.to_string(),
            shareable: true,
        })
    }

    /// Removes a claim's allocations from its node's ledger. A claim
    /// with no recorded node, or no ledger entry, is a successful no-op.
    #[tracing::instrument(skip_all, fields(claim_uid = %claim.uid))]
    pub async fn deallocate(
        &self,
        claim: &ResourceClaim,
        cancellation_token: &CancellationToken,
    ) -> Result<(), Report<DriverError>> {
        let Some(node) = claim.allocated_node.as_deref().filter(|n| !n.is_empty()) else {
            return Ok(());
        };

        let claim_uid = claim.uid.clone();
        let mut removed = false;
        update_with_retry(
            self.ledgers.as_ref(),
            node,
            cancellation_token,
            &self.retry,
            |ledger| {
                removed = ledger.status.allocations.remove(&claim_uid).is_some();
                ledger.status.suitability.remove(&claim_uid);
                if removed {
                    Ok(MutateOutcome::Changed)
                } else {
                    Ok(MutateOutcome::Unchanged)
                }
            },
        )
        .await
        .change_context(DriverError::Ledger)?;

        self.reservations.release_claim(&claim_uid);
        if removed {
            DEALLOCATIONS_TOTAL.inc();
            info!(claim_uid = %claim.uid, node, "claim deallocated");
        }
        Ok(())
    }

    /// Reads a ledger for a scheduling decision: informer cache first,
    /// fresh read on miss. Mutations never rely on this snapshot.
    async fn read_for_scheduling(
        &self,
        node: &str,
    ) -> Result<DeviceLedger, Report<crate::ledger::LedgerError>> {
        if let Some(cache) = &self.cache {
            let cached = cache
                .read()
                .expect("ledger cache lock poisoned")
                .get(node)
                .cloned();
            if let Some(ledger) = cached {
                return Ok(ledger);
            }
        }
        self.ledgers.get(node).await
    }
}

fn validate_claim_params(spec: &GpuClaimParametersSpec) -> Result<(), Report<DriverError>> {
    if spec.count < 1 {
        return Err(Report::new(DriverError::InvalidParameters {
            reason: format!("invalid number of GPUs requested: {}", spec.count),
        }));
    }
    Ok(())
}

/// First-fit selection over the available devices, honoring the class
/// selectors. Picked devices are removed from `available`.
fn pick_devices(
    available: &mut Vec<GpuDevice>,
    selectors: &[DeviceSelector],
    count: usize,
) -> Vec<GpuDevice> {
    let mut picked = Vec::new();
    let mut i = 0;
    while i < available.len() && picked.len() < count {
        if matches_selectors(&available[i], selectors) {
            picked.push(available.remove(i));
        } else {
            i += 1;
        }
    }
    picked
}
