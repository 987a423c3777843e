use std::path::PathBuf;

use clap::Args;

#[derive(Args, Debug, Clone)]
pub struct PluginArgs {
    /// Path to the kubeconfig file; in-cluster config when omitted
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace holding the DeviceLedger objects
    #[arg(long, default_value = "k8s-dra")]
    pub namespace: String,

    /// Directory the per-claim CDI specification files are written to
    #[arg(long)]
    pub cdi_root: PathBuf,

    /// Number of devices to fabricate when no CDI specs exist on disk
    #[arg(long, default_value_t = 4)]
    pub max_available_gpu: usize,

    /// Name of the node this plugin manages
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Kubelet plugin-registration directory
    #[arg(long, default_value = "/var/lib/kubelet/plugins_registry")]
    pub kubelet_plugins_registry: PathBuf,

    /// Kubelet plugins directory
    #[arg(long, default_value = "/var/lib/kubelet/plugins")]
    pub kubelet_plugins_dir: PathBuf,

    /// HTTP port to expose metrics
    #[arg(long, default_value_t = 9003)]
    pub metrics_port: u16,

    /// HTTP path to expose metrics
    #[arg(long, default_value = "metrics")]
    pub metrics_path: String,
}
