//! Controller-side components: parameter resolution, the speculative
//! reservation store, the allocation driver, and the framework-facing
//! gRPC service.

pub mod driver;
pub mod params;
pub mod reservations;
pub mod server;
pub mod types;

use core::error::Error;

use derive_more::Display;

pub use driver::Driver;
pub use params::KubeParamsStore;
pub use params::ParamsStore;
pub use params::StaticParamsStore;
pub use reservations::ReservationStore;
pub use server::DraControllerService;
pub use types::AllocationResult;
pub use types::ClaimAllocation;
pub use types::ClaimParams;
pub use types::ClassParams;
pub use types::ParametersRef;
pub use types::PodRef;
pub use types::ResourceClaim;
pub use types::ResourceClass;

/// Errors raised by the controller driver. `Capacity` only surfaces
/// from `allocate`; during the suitability pass a shortfall is a
/// verdict, not an error.
#[derive(Debug, Display)]
pub enum DriverError {
    #[display("incorrect driver name {actual} (vs. {expected})")]
    WrongDriver { actual: String, expected: String },
    #[display("incorrect API group {actual} (vs. {expected})")]
    WrongApiGroup { actual: String, expected: String },
    #[display("unsupported parameters kind: {kind}")]
    UnsupportedParametersKind { kind: String },
    #[display("{kind} {name} not found")]
    ParametersNotFound { kind: String, name: String },
    #[display("invalid parameters: {reason}")]
    InvalidParameters { reason: String },
    #[display("immediate allocation is not supported")]
    ImmediateAllocationUnsupported,
    #[display("insufficient devices on node {node} for claim {claim_uid}: {available} available, {requested} requested")]
    Capacity {
        node: String,
        claim_uid: String,
        available: usize,
        requested: usize,
    },
    #[display("ledger operation failed")]
    Ledger,
    #[display("API call failed: {message}")]
    Api { message: String },
}

impl Error for DriverError {}
