use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// Wildcard accepted by either selector field.
pub const SELECTOR_WILDCARD: &str = "*";

/// An allocatable GPU device on a node. Immutable once recorded in a
/// ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GpuDevice {
    pub uuid: String,
    pub product_name: String,
    pub vendor: String,
}

/// Matches a device by product name and vendor as part of a device class.
///
/// `*` is a wildcard for either field; comparison is otherwise
/// byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSelector {
    pub name: String,
    pub vendor: String,
}

impl DeviceSelector {
    pub fn matches(&self, device: &GpuDevice) -> bool {
        let name_ok = self.name == SELECTOR_WILDCARD || self.name == device.product_name;
        let vendor_ok = self.vendor == SELECTOR_WILDCARD || self.vendor == device.vendor;
        name_ok && vendor_ok
    }
}

/// Returns true iff the selector list is empty (a class with no selectors
/// matches everything) or at least one selector matches the device.
pub fn matches_selectors(device: &GpuDevice, selectors: &[DeviceSelector]) -> bool {
    selectors.is_empty() || selectors.iter().any(|s| s.matches(device))
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn device(product: &str, vendor: &str) -> GpuDevice {
        GpuDevice {
            uuid: "GPU-7d8429d5-531d-d6a6-6510-3b662081a75a".to_string(),
            product_name: product.to_string(),
            vendor: vendor.to_string(),
        }
    }

    fn selector(name: &str, vendor: &str) -> DeviceSelector {
        DeviceSelector {
            name: name.to_string(),
            vendor: vendor.to_string(),
        }
    }

    #[test]
    fn empty_selector_list_matches_everything() {
        let d = device("NVIDIA Tesla V100", "nvidia.com");
        assert!(matches_selectors(&d, &[]), "empty list should match");
    }

    #[test]
    fn wildcard_selector_matches_every_device() {
        let d = device("NVIDIA Tesla V100", "nvidia.com");
        assert!(
            matches_selectors(&d, &[selector("*", "*")]),
            "double wildcard should match"
        );
    }

    #[test]
    fn exact_match_is_byte_for_byte() {
        let d = device("NVIDIA Tesla V100", "nvidia.com");
        assert!(matches_selectors(
            &d,
            &[selector("NVIDIA Tesla V100", "nvidia.com")]
        ));
        assert!(
            !matches_selectors(&d, &[selector("nvidia tesla v100", "nvidia.com")]),
            "name comparison should be case-sensitive"
        );
    }

    #[test]
    fn partial_wildcard_still_checks_the_other_field() {
        let d = device("NVIDIA Tesla V100", "nvidia.com");
        assert!(matches_selectors(&d, &[selector("*", "nvidia.com")]));
        assert!(!matches_selectors(&d, &[selector("*", "amd.com")]));
        assert!(matches_selectors(&d, &[selector("NVIDIA Tesla V100", "*")]));
        assert!(!matches_selectors(&d, &[selector("NVIDIA A100", "*")]));
    }

    #[test]
    fn any_selector_in_the_list_is_enough() {
        let d = device("NVIDIA Tesla V100", "nvidia.com");
        let selectors = [
            selector("NVIDIA A100", "nvidia.com"),
            selector("NVIDIA Tesla V100", "*"),
        ];
        assert!(matches_selectors(&d, &selectors));
    }

    #[test]
    fn device_serializes_camel_case() {
        let d = device("NVIDIA Tesla V100", "nvidia.com");
        let json = serde_json::to_value(&d).expect("should serialize device");
        assert_eq!(json["productName"], "NVIDIA Tesla V100");
        assert_eq!(json["vendor"], "nvidia.com");
    }
}
