//! provides logging helpers

use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::EnvFilter;

const LOG_LEVEL_ENV_VAR: &str = "DRA_LOG_LEVEL";

/// initiate the global tracing subscriber
pub fn init() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(LOG_LEVEL_ENV_VAR)
        .from_env_lossy();

    let fmt_layer = layer().with_writer(std::io::stdout).with_target(true);

    registry().with(fmt_layer.with_filter(filter)).init();
}
