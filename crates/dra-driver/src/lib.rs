// Command layer - entry points
pub mod cmd;

// Configuration layer
pub mod config;

// Controller-side components: driver, reservations, framework service
pub mod controller;

// Device ledger access: store trait, kube impl, mock, informer cache
pub mod ledger;

// Node-plugin-side components: CDI writer, discovery, kubelet services
pub mod plugin;

// Shared infrastructure
pub mod kube_client;
pub mod logging;
pub mod metrics;
pub mod util;

pub use config::Cli;
pub use config::Commands;
pub use config::ControllerArgs;
pub use config::PluginArgs;
