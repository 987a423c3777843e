//! Custom resource model shared by the DRA controller and the node plugin.

pub mod device;
pub mod ledger;
pub mod params;

/// API group of every custom resource owned by this driver.
pub const API_GROUP: &str = "resources.ihcsim";

/// API version of every custom resource owned by this driver.
pub const API_VERSION: &str = "v1alpha1";

/// Name the driver registers with the DRA framework.
pub const DRIVER_NAME: &str = "driver.resources.ihcsim";

pub use device::DeviceSelector;
pub use device::GpuDevice;
pub use ledger::Allocation;
pub use ledger::AllocationState;
pub use ledger::ClaimReference;
pub use ledger::DeviceLedger;
pub use ledger::DeviceLedgerSpec;
pub use ledger::DeviceLedgerStatus;
pub use ledger::NodeSuitability;
pub use params::GpuClaimParameters;
pub use params::GpuClaimParametersSpec;
pub use params::GpuClassParameters;
pub use params::GpuClassParametersSpec;
