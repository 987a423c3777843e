mod controller;
mod plugin;

use clap::Parser;
use clap::Subcommand;

pub use controller::ControllerArgs;
pub use plugin::PluginArgs;

#[derive(Parser)]
#[command(about, long_about = None, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the cluster-wide allocation controller
    Controller(Box<ControllerArgs>),
    /// Run the per-node kubelet plugin
    Plugin(Box<PluginArgs>),
}
