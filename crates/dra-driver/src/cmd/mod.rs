mod controller;
mod plugin;

pub use controller::run_controller;
pub use plugin::run_plugin;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancels the token on the first interrupt signal.
pub(crate) fn spawn_signal_handler(cancellation_token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
        cancellation_token.cancel();
    });
}
