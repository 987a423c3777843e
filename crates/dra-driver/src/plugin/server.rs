//! UNIX-domain-socket servers of the node plugin and the ledger
//! bootstrap that precedes them.

pub mod proto {
    tonic::include_proto!("pluginregistration");
}

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use dra_api::DeviceLedger;
use dra_api::GpuDevice;
use dra_api::DRIVER_NAME;
use error_stack::Report;
use error_stack::ResultExt;
use proto::registration_server::Registration;
use proto::registration_server::RegistrationServer;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tracing::info;
use tracing::warn;

use crate::ledger::LedgerStore;
use crate::plugin::node_server::proto::node_server::NodeServer;
use crate::plugin::node_server::NodeService;

use super::PluginError;

const PLUGIN_TYPE: &str = "DRAPlugin";
const SUPPORTED_VERSIONS: &[&str] = &["v1alpha3"];

/// Creates the node's ledger on first start; an existing ledger is left
/// untouched, so a plugin restart never clobbers live allocations.
pub async fn bootstrap_ledger<L>(
    store: &L,
    namespace: &str,
    node_name: &str,
    allocatable: Vec<GpuDevice>,
) -> Result<DeviceLedger, Report<PluginError>>
where
    L: LedgerStore,
{
    match store.get(node_name).await {
        Ok(existing) => {
            info!(
                node_name,
                devices = existing.spec.allocatable.len(),
                "ledger already registered"
            );
            Ok(existing)
        }
        Err(e) if e.current_context().is_not_found() => {
            info!(node_name, devices = allocatable.len(), "registering node ledger");
            store
                .create(&DeviceLedger::new(namespace, node_name, allocatable))
                .await
                .change_context(PluginError::Bootstrap {
                    message: format!("failed to create ledger for node {node_name}"),
                })
        }
        Err(e) => Err(e.change_context(PluginError::Bootstrap {
            message: format!("failed to read ledger for node {node_name}"),
        })),
    }
}

/// Answers the kubelet plugin-watcher's discovery calls.
pub struct RegistrationService {
    endpoint: String,
}

impl RegistrationService {
    pub fn new(endpoint: String) -> Self {
        Self { endpoint }
    }
}

#[tonic::async_trait]
impl Registration for RegistrationService {
    async fn get_info(
        &self,
        _request: Request<proto::InfoRequest>,
    ) -> Result<Response<proto::PluginInfo>, Status> {
        Ok(Response::new(proto::PluginInfo {
            r#type: PLUGIN_TYPE.to_string(),
            name: DRIVER_NAME.to_string(),
            endpoint: self.endpoint.clone(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }))
    }

    async fn notify_registration_status(
        &self,
        request: Request<proto::RegistrationStatus>,
    ) -> Result<Response<proto::RegistrationStatusResponse>, Status> {
        let status = request.into_inner();
        if status.plugin_registered {
            info!("kubelet registered the plugin");
        } else {
            warn!(error = %status.error, "kubelet rejected the plugin registration");
        }
        Ok(Response::new(proto::RegistrationStatusResponse {}))
    }
}

/// Socket layout of the plugin. Registration lives directly in the
/// kubelet registry directory; the service endpoint lives in the
/// driver's own plugin directory.
pub struct SocketPaths {
    pub registration: PathBuf,
    pub plugin: PathBuf,
}

impl SocketPaths {
    pub fn new(registry_dir: &Path, plugins_dir: &Path) -> Self {
        Self {
            registration: registry_dir.join(format!("{DRIVER_NAME}.sock")),
            plugin: plugins_dir.join(DRIVER_NAME).join("plugin.sock"),
        }
    }
}

/// Runs the two gRPC servers of the node plugin until cancelled.
pub struct NodePlugin<L> {
    node_service: NodeService<L>,
    paths: SocketPaths,
}

impl<L> NodePlugin<L>
where
    L: LedgerStore + 'static,
{
    pub fn new(node_service: NodeService<L>, paths: SocketPaths) -> Self {
        Self {
            node_service,
            paths,
        }
    }

    pub async fn run(
        self,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<PluginError>> {
        let plugin_listener = bind_socket(&self.paths.plugin)?;
        let registration_listener = bind_socket(&self.paths.registration)?;

        info!(
            plugin = %self.paths.plugin.display(),
            registration = %self.paths.registration.display(),
            "starting node plugin servers"
        );

        let registration_service =
            RegistrationService::new(self.paths.plugin.display().to_string());

        let plugin_server = tonic::transport::Server::builder()
            .add_service(NodeServer::new(self.node_service))
            .serve_with_incoming_shutdown(
                UnixListenerStream::new(plugin_listener),
                cancellation_token.clone().cancelled_owned(),
            );

        let registration_server = tonic::transport::Server::builder()
            .add_service(RegistrationServer::new(registration_service))
            .serve_with_incoming_shutdown(
                UnixListenerStream::new(registration_listener),
                cancellation_token.clone().cancelled_owned(),
            );

        let (plugin_result, registration_result) =
            tokio::join!(plugin_server, registration_server);
        plugin_result.change_context(PluginError::Socket {
            message: format!("plugin server on {} failed", self.paths.plugin.display()),
        })?;
        registration_result.change_context(PluginError::Socket {
            message: format!(
                "registration server on {} failed",
                self.paths.registration.display()
            ),
        })?;

        info!("node plugin servers stopped");
        Ok(())
    }
}

/// Binds a UDS listener, clearing any stale socket file first.
fn bind_socket(path: &Path) -> Result<UnixListener, Report<PluginError>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).change_context(PluginError::Socket {
            message: format!("failed to create socket directory {}", parent.display()),
        })?;
    }

    // clean up old socket file if it exists
    if path.exists() {
        std::fs::remove_file(path).change_context(PluginError::Socket {
            message: format!("failed to remove stale socket {}", path.display()),
        })?;
    }

    UnixListener::bind(path).change_context(PluginError::Socket {
        message: format!("failed to bind {}", path.display()),
    })
}
