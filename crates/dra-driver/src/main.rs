use anyhow::Result;
use clap::Parser;

use dra_driver::cmd;
use dra_driver::Cli;
use dra_driver::Commands;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Controller(args) => cmd::run_controller(*args).await,
        Commands::Plugin(args) => cmd::run_plugin(*args).await,
    }
}
