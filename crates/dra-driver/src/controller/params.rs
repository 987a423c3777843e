use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use dra_api::GpuClaimParameters;
use dra_api::GpuClassParameters;
use error_stack::Report;
use kube::Api;
use kube::Client;

use super::DriverError;

/// Fetches the parameter objects referenced by classes and claims.
#[async_trait]
pub trait ParamsStore: Send + Sync {
    async fn class_params(&self, name: &str) -> Result<GpuClassParameters, Report<DriverError>>;

    async fn claim_params(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<GpuClaimParameters, Report<DriverError>>;
}

/// [`ParamsStore`] backed by the orchestrator's object store.
pub struct KubeParamsStore {
    client: Client,
}

impl KubeParamsStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn map_get_error(kind: &str, name: &str, err: kube::Error) -> Report<DriverError> {
    match &err {
        kube::Error::Api(response) if response.code == 404 => {
            Report::new(DriverError::ParametersNotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            })
        }
        _ => Report::new(DriverError::Api {
            message: format!("error getting {kind} {name}: {err}"),
        }),
    }
}

#[async_trait]
impl ParamsStore for KubeParamsStore {
    async fn class_params(&self, name: &str) -> Result<GpuClassParameters, Report<DriverError>> {
        let api: Api<GpuClassParameters> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| map_get_error("GpuClassParameters", name, e))
    }

    async fn claim_params(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<GpuClaimParameters, Report<DriverError>> {
        let api: Api<GpuClaimParameters> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| map_get_error("GpuClaimParameters", name, e))
    }
}

/// [`ParamsStore`] over fixed in-memory objects; backs the tests.
#[derive(Default)]
pub struct StaticParamsStore {
    classes: RwLock<HashMap<String, GpuClassParameters>>,
    claims: RwLock<HashMap<(String, String), GpuClaimParameters>>,
}

impl StaticParamsStore {
    pub fn insert_class(&self, name: &str, params: GpuClassParameters) {
        self.classes
            .write()
            .expect("params lock poisoned")
            .insert(name.to_string(), params);
    }

    pub fn insert_claim(&self, namespace: &str, name: &str, params: GpuClaimParameters) {
        self.claims
            .write()
            .expect("params lock poisoned")
            .insert((namespace.to_string(), name.to_string()), params);
    }
}

#[async_trait]
impl ParamsStore for StaticParamsStore {
    async fn class_params(&self, name: &str) -> Result<GpuClassParameters, Report<DriverError>> {
        self.classes
            .read()
            .expect("params lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| {
                Report::new(DriverError::ParametersNotFound {
                    kind: "GpuClassParameters".to_string(),
                    name: name.to_string(),
                })
            })
    }

    async fn claim_params(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<GpuClaimParameters, Report<DriverError>> {
        self.claims
            .read()
            .expect("params lock poisoned")
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| {
                Report::new(DriverError::ParametersNotFound {
                    kind: "GpuClaimParameters".to_string(),
                    name: name.to_string(),
                })
            })
    }
}
