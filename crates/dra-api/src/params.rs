use k8s_openapi::ClusterResourceScope;
use k8s_openapi::NamespaceResourceScope;
use kube::api::ObjectMeta;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::device::DeviceSelector;
use crate::API_GROUP;
use crate::API_VERSION;

/// Parameter object referenced by a resource class. Cluster-scoped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuClassParameters {
    #[serde(flatten)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: GpuClassParametersSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GpuClassParametersSpec {
    /// A device matches the class if any selector matches it. An empty
    /// list matches every device.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_selector: Vec<DeviceSelector>,
}

impl kube::Resource for GpuClassParameters {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

    fn group(_dt: &()) -> std::borrow::Cow<'_, str> {
        API_GROUP.into()
    }

    fn version(_dt: &()) -> std::borrow::Cow<'_, str> {
        API_VERSION.into()
    }

    fn kind(_dt: &()) -> std::borrow::Cow<'_, str> {
        "GpuClassParameters".into()
    }

    fn plural(_dt: &()) -> std::borrow::Cow<'_, str> {
        "gpuclassparameters".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Parameter object referenced by a resource claim. Namespaced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuClaimParameters {
    #[serde(flatten)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: GpuClaimParametersSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GpuClaimParametersSpec {
    /// Number of devices the claim requires. Must be at least 1.
    pub count: i32,
}

impl Default for GpuClaimParametersSpec {
    fn default() -> Self {
        Self { count: 1 }
    }
}

impl kube::Resource for GpuClaimParameters {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn group(_dt: &()) -> std::borrow::Cow<'_, str> {
        API_GROUP.into()
    }

    fn version(_dt: &()) -> std::borrow::Cow<'_, str> {
        API_VERSION.into()
    }

    fn kind(_dt: &()) -> std::borrow::Cow<'_, str> {
        "GpuClaimParameters".into()
    }

    fn plural(_dt: &()) -> std::borrow::Cow<'_, str> {
        "gpuclaimparameters".into()
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

    #[test]
    fn claim_parameters_default_to_one_device() {
        assert_eq!(GpuClaimParametersSpec::default().count, 1);
    }

    #[test]
    fn class_parameters_round_trip() {
        let params = GpuClassParameters {
            metadata: ObjectMeta {
                name: Some("all-v100".to_string()),
                ..Default::default()
            },
            spec: GpuClassParametersSpec {
                device_selector: vec![DeviceSelector {
                    name: "NVIDIA Tesla V100".to_string(),
                    vendor: "*".to_string(),
                }],
            },
        };

        let json = serde_json::to_value(&params).expect("should serialize class parameters");
        assert_eq!(json["spec"]["deviceSelector"][0]["vendor"], "*");

        let back: GpuClassParameters =
            serde_json::from_value(json).expect("should deserialize class parameters");
        assert_eq!(back.spec, params.spec);
    }
}
