use std::path::PathBuf;

use clap::Args;

#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Path to the kubeconfig file; in-cluster config when omitted
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace holding the DeviceLedger objects
    #[arg(long, default_value = "k8s-dra")]
    pub namespace: String,

    /// Number of parallel claim flows
    #[arg(long, default_value_t = 3)]
    pub workers: usize,

    /// QPS to the Kubernetes API server
    #[arg(long, default_value_t = 5.0)]
    pub api_qps: f64,

    /// Burst to the Kubernetes API server
    #[arg(long, default_value_t = 10.0)]
    pub api_burst: f64,

    /// Listen address of the framework-facing gRPC service
    #[arg(long, default_value = "0.0.0.0:50051")]
    pub listen_addr: String,

    /// HTTP port to expose metrics
    #[arg(long, default_value_t = 9001)]
    pub metrics_port: u16,

    /// HTTP path to expose metrics
    #[arg(long, default_value = "metrics")]
    pub metrics_path: String,

    /// HTTP port to expose debug endpoints
    #[arg(long, default_value_t = 9002)]
    pub pprof_port: u16,
}
