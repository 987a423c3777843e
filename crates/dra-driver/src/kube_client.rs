use std::path::PathBuf;

use core::error::Error;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;

/// Errors raised while building the Kubernetes client.
#[derive(Debug, Display)]
pub enum ClientError {
    #[display("failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
}

impl Error for ClientError {}

pub async fn init_kube_client(
    kubeconfig: Option<PathBuf>,
) -> Result<Client, Report<ClientError>> {
    let client = match kubeconfig {
        Some(kubeconfig_path) => {
            // Load kubeconfig from the specified file
            let kubeconfig = Kubeconfig::read_from(&kubeconfig_path).change_context(
                ClientError::ConnectionFailed {
                    message: format!(
                        "failed to read kubeconfig file: {}",
                        kubeconfig_path.display()
                    ),
                },
            )?;

            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .change_context(ClientError::ConnectionFailed {
                    message: format!(
                        "failed to create config from kubeconfig: {}",
                        kubeconfig_path.display()
                    ),
                })?;

            Client::try_from(config).change_context(ClientError::ConnectionFailed {
                message: "failed to create Kubernetes client from custom kubeconfig".to_string(),
            })?
        }
        None => {
            // Use default configuration (in-cluster or ~/.kube/config)
            Client::try_default()
                .await
                .change_context(ClientError::ConnectionFailed {
                    message: "failed to create Kubernetes client".to_string(),
                })?
        }
    };
    Ok(client)
}
