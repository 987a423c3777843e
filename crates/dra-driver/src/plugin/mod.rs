//! Per-node kubelet plugin: device discovery, the CDI writer, and the
//! kubelet-facing gRPC services.

pub mod cdi;
pub mod discovery;
pub mod node_server;
pub mod server;

use core::error::Error;

use derive_more::Display;

pub use cdi::CdiError;
pub use cdi::CdiWriter;
pub use node_server::NodeService;
pub use server::bootstrap_ledger;
pub use server::NodePlugin;
pub use server::RegistrationService;

#[derive(Debug, Display)]
pub enum PluginError {
    #[display("failed to bootstrap node ledger: {message}")]
    Bootstrap { message: String },
    #[display("plugin socket error: {message}")]
    Socket { message: String },
    #[display("ledger operation failed")]
    Ledger,
    #[display("CDI specification error")]
    Cdi,
}

impl Error for PluginError {}
