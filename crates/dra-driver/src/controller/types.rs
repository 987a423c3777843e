//! Role-level views of the framework objects the driver is handed. The
//! orchestrator owns the full objects; the driver only ever sees the
//! fields below.

use dra_api::DeviceSelector;
use dra_api::GpuClaimParametersSpec;
use dra_api::GpuClassParametersSpec;
use error_stack::Report;

use super::DriverError;

/// Reference from a class or claim to its parameter object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParametersRef {
    pub api_group: String,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ResourceClass {
    pub name: String,
    pub driver_name: String,
    pub parameters_ref: Option<ParametersRef>,
}

#[derive(Debug, Clone)]
pub struct ResourceClaim {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub parameters_ref: Option<ParametersRef>,
    /// Node the claim is currently allocated on, if any.
    pub allocated_node: Option<String>,
}

/// Resolved class parameters, tagged by parameter kind. Downstream code
/// matches on the tag instead of downcasting.
#[derive(Debug, Clone)]
pub enum ClassParams {
    Gpu(GpuClassParametersSpec),
}

impl ClassParams {
    pub fn selectors(&self) -> &[DeviceSelector] {
        match self {
            Self::Gpu(spec) => &spec.device_selector,
        }
    }
}

/// Resolved claim parameters, tagged by parameter kind.
#[derive(Debug, Clone)]
pub enum ClaimParams {
    Gpu(GpuClaimParametersSpec),
}

impl ClaimParams {
    pub fn count(&self) -> usize {
        match self {
            Self::Gpu(spec) => spec.count.max(0) as usize,
        }
    }
}

/// Result of a successful bind: pins the claim to the selected node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationResult {
    pub available_on_node: String,
    pub shareable: bool,
}

/// One claim flowing through `allocate` or `unsuitable_nodes`; the
/// driver fills `allocation`/`error`/`unsuitable_nodes` in place.
#[derive(Debug)]
pub struct ClaimAllocation {
    pub claim: ResourceClaim,
    pub class_params: ClassParams,
    pub claim_params: ClaimParams,
    pub allocation: Option<AllocationResult>,
    pub error: Option<Report<DriverError>>,
    pub unsuitable_nodes: Vec<String>,
}

impl ClaimAllocation {
    pub fn new(claim: ResourceClaim, class_params: ClassParams, claim_params: ClaimParams) -> Self {
        Self {
            claim,
            class_params,
            claim_params,
            allocation: None,
            error: None,
            unsuitable_nodes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
    pub uid: String,
}
