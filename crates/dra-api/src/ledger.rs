use std::collections::BTreeMap;
use std::collections::HashSet;

use k8s_openapi::NamespaceResourceScope;
use kube::api::ObjectMeta;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::device::GpuDevice;
use crate::API_GROUP;
use crate::API_VERSION;

/// Per-node record of allocatable devices and their allocation state.
/// The object name is the node name; one ledger exists per node.
///
/// The node plugin creates the ledger on first start and owns
/// `spec.allocatable`; the controller and the plugin both mutate
/// `status` under optimistic concurrency.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLedger {
    #[serde(flatten)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DeviceLedgerSpec,
    #[serde(default)]
    pub status: DeviceLedgerStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLedgerSpec {
    /// Physical inventory of the node. Written once at plugin startup.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allocatable: Vec<GpuDevice>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLedgerStatus {
    /// Device allocations keyed by claim UID.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allocations: BTreeMap<String, Vec<Allocation>>,

    /// Last per-claim suitability verdict recorded for this node.
    /// Advisory diagnostic metadata, last-write-wins; never consulted by
    /// the allocation predicate.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub suitability: BTreeMap<String, NodeSuitability>,
}

/// One device bound (or being bound) to one claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub claim_ref: ClaimReference,
    pub device: GpuDevice,
    pub state: AllocationState,
}

/// Reference to the claim an allocation belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimReference {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

/// Allocation state of a single device within a claim.
///
/// `Hold` is a speculative reservation that lives in controller memory;
/// this implementation never persists it, but a persisted `hold` is
/// tolerated on read and consumes the device like any other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AllocationState {
    Hold,
    Allocated,
    Prepared,
}

/// Per-(claim, node) verdict reported to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NodeSuitability {
    Suitable,
    Unsuitable,
    Unknown,
}

impl DeviceLedger {
    pub fn new(namespace: &str, node_name: &str, allocatable: Vec<GpuDevice>) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(node_name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: DeviceLedgerSpec { allocatable },
            status: DeviceLedgerStatus::default(),
        }
    }

    pub fn node_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}

impl DeviceLedgerStatus {
    /// UUIDs referenced by any allocation, regardless of state. A `hold`
    /// entry, though never persisted by this driver, still consumes the
    /// device for the remainder of a reconcile pass.
    pub fn consumed_uuids(&self) -> HashSet<&str> {
        self.allocations
            .values()
            .flatten()
            .map(|a| a.device.uuid.as_str())
            .collect()
    }

    /// UUIDs bound in `allocated` or `prepared` state.
    pub fn bound_uuids(&self) -> HashSet<&str> {
        self.allocations
            .values()
            .flatten()
            .filter(|a| {
                matches!(
                    a.state,
                    AllocationState::Allocated | AllocationState::Prepared
                )
            })
            .map(|a| a.device.uuid.as_str())
            .collect()
    }

    /// Devices from `allocatable` not referenced by any allocation, in
    /// inventory order.
    pub fn available<'a>(&self, allocatable: &'a [GpuDevice]) -> Vec<&'a GpuDevice> {
        let consumed = self.consumed_uuids();
        allocatable
            .iter()
            .filter(|d| !consumed.contains(d.uuid.as_str()))
            .collect()
    }

    /// Number of devices held by a claim in `allocated` state.
    pub fn allocated_count(&self, claim_uid: &str) -> usize {
        self.allocations
            .get(claim_uid)
            .map(|allocations| {
                allocations
                    .iter()
                    .filter(|a| a.state == AllocationState::Allocated)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Verifies that no device uuid is bound (`allocated` or `prepared`)
    /// by more than one allocation entry. Returns the offending uuid on
    /// violation.
    pub fn check_exclusive(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for allocation in self.allocations.values().flatten() {
            if !matches!(
                allocation.state,
                AllocationState::Allocated | AllocationState::Prepared
            ) {
                continue;
            }
            if !seen.insert(allocation.device.uuid.as_str()) {
                return Err(allocation.device.uuid.clone());
            }
        }
        Ok(())
    }
}

impl kube::Resource for DeviceLedger {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn group(_dt: &()) -> std::borrow::Cow<'_, str> {
        API_GROUP.into()
    }

    fn version(_dt: &()) -> std::borrow::Cow<'_, str> {
        API_VERSION.into()
    }

    fn kind(_dt: &()) -> std::borrow::Cow<'_, str> {
        "DeviceLedger".into()
    }

    fn plural(_dt: &()) -> std::borrow::Cow<'_, str> {
        "deviceledgers".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

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

    #[test]
    fn available_excludes_every_referenced_device() {
        let allocatable = vec![device("u1"), device("u2"), device("u3")];
        let mut status = DeviceLedgerStatus::default();
        status
            .allocations
            .insert("c1".to_string(), vec![allocation("c1", "u1", AllocationState::Allocated)]);
        status
            .allocations
            .insert("c2".to_string(), vec![allocation("c2", "u2", AllocationState::Hold)]);

        let available = status.available(&allocatable);
        assert_eq!(available.len(), 1, "hold and allocated both consume");
        assert_eq!(available[0].uuid, "u3");
    }

    #[test]
    fn bound_uuids_ignores_hold_entries() {
        let mut status = DeviceLedgerStatus::default();
        status.allocations.insert(
            "c1".to_string(),
            vec![
                allocation("c1", "u1", AllocationState::Prepared),
                allocation("c1", "u2", AllocationState::Hold),
            ],
        );

        let bound = status.bound_uuids();
        assert!(bound.contains("u1"));
        assert!(!bound.contains("u2"));
    }

    #[test]
    fn exclusivity_violation_names_the_device() {
        let mut status = DeviceLedgerStatus::default();
        status
            .allocations
            .insert("c1".to_string(), vec![allocation("c1", "u1", AllocationState::Allocated)]);
        status
            .allocations
            .insert("c2".to_string(), vec![allocation("c2", "u1", AllocationState::Prepared)]);

        assert_eq!(status.check_exclusive(), Err("u1".to_string()));
    }

    #[test]
    fn duplicate_hold_entries_do_not_violate_exclusivity() {
        let mut status = DeviceLedgerStatus::default();
        status
            .allocations
            .insert("c1".to_string(), vec![allocation("c1", "u1", AllocationState::Hold)]);
        status
            .allocations
            .insert("c2".to_string(), vec![allocation("c2", "u1", AllocationState::Allocated)]);

        assert_eq!(status.check_exclusive(), Ok(()));
    }

    #[test]
    fn allocated_count_ignores_other_states() {
        let mut status = DeviceLedgerStatus::default();
        status.allocations.insert(
            "c1".to_string(),
            vec![
                allocation("c1", "u1", AllocationState::Allocated),
                allocation("c1", "u2", AllocationState::Prepared),
            ],
        );

        assert_eq!(status.allocated_count("c1"), 1);
        assert_eq!(status.allocated_count("c9"), 0);
    }

    #[test]
    fn allocation_state_serializes_lowercase() {
        let a = allocation("c1", "u1", AllocationState::Prepared);
        let json = serde_json::to_value(&a).expect("should serialize allocation");
        assert_eq!(json["state"], "prepared");

        let back: Allocation = serde_json::from_value(json).expect("should deserialize allocation");
        assert_eq!(back.state, AllocationState::Prepared);
    }

    #[test]
    fn ledger_object_name_is_the_node_name() {
        let ledger = DeviceLedger::new("k8s-dra", "node-0", vec![device("u1")]);
        assert_eq!(ledger.node_name(), "node-0");
        assert_eq!(ledger.metadata.namespace.as_deref(), Some("k8s-dra"));
    }
}
