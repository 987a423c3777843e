//! Prometheus metrics and the HTTP servers that expose them.

use core::error::Error;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use lazy_static::lazy_static;
use poem::get;
use poem::handler;
use poem::listener::TcpListener;
use poem::Route;
use poem::Server;
use prometheus::Encoder;
use prometheus::IntCounter;
use prometheus::IntGauge;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::info;

lazy_static! {
    /// Registry holding every driver metric.
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref ALLOCATIONS_TOTAL: IntCounter = IntCounter::new(
        "dra_allocations_total",
        "Claims committed to a node ledger"
    )
    .unwrap();

    pub static ref DEALLOCATIONS_TOTAL: IntCounter = IntCounter::new(
        "dra_deallocations_total",
        "Claims removed from a node ledger"
    )
    .unwrap();

    pub static ref LEDGER_CONFLICT_RETRIES_TOTAL: IntCounter = IntCounter::new(
        "dra_ledger_conflict_retries_total",
        "Optimistic-concurrency conflicts retried during ledger writes"
    )
    .unwrap();

    pub static ref UNSUITABLE_VERDICTS_TOTAL: IntCounter = IntCounter::new(
        "dra_unsuitable_verdicts_total",
        "Per-(claim, node) unsuitable verdicts reported to the scheduler"
    )
    .unwrap();

    pub static ref PENDING_RESERVATIONS: IntGauge = IntGauge::new(
        "dra_pending_reservations",
        "Live speculative reservations held in controller memory"
    )
    .unwrap();

    pub static ref PREPARED_CLAIMS: IntGauge = IntGauge::new(
        "dra_prepared_claims",
        "Claims with at least one prepared device on this node"
    )
    .unwrap();

    pub static ref CDI_SPEC_WRITES_TOTAL: IntCounter = IntCounter::new(
        "dra_cdi_spec_writes_total",
        "CDI specification files written"
    )
    .unwrap();
}

/// Registers every metric with the registry. Idempotent per process;
/// call once at startup.
pub fn register_metrics() {
    REGISTRY
        .register(Box::new(ALLOCATIONS_TOTAL.clone()))
        .expect("allocations counter registers once");
    REGISTRY
        .register(Box::new(DEALLOCATIONS_TOTAL.clone()))
        .expect("deallocations counter registers once");
    REGISTRY
        .register(Box::new(LEDGER_CONFLICT_RETRIES_TOTAL.clone()))
        .expect("conflict counter registers once");
    REGISTRY
        .register(Box::new(UNSUITABLE_VERDICTS_TOTAL.clone()))
        .expect("unsuitable counter registers once");
    REGISTRY
        .register(Box::new(PENDING_RESERVATIONS.clone()))
        .expect("reservations gauge registers once");
    REGISTRY
        .register(Box::new(PREPARED_CLAIMS.clone()))
        .expect("prepared gauge registers once");
    REGISTRY
        .register(Box::new(CDI_SPEC_WRITES_TOTAL.clone()))
        .expect("cdi counter registers once");
}

#[derive(Debug, Display)]
pub enum MetricsError {
    #[display("metrics server failed: {message}")]
    ServerError { message: String },
}

impl Error for MetricsError {}

#[handler]
fn serve_metrics() -> poem::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let mut buf = String::new();
    encoder
        .encode_utf8(&REGISTRY.gather(), &mut buf)
        .map_err(|e| {
            poem::Error::from_string(e.to_string(), poem::http::StatusCode::INTERNAL_SERVER_ERROR)
        })?;
    Ok(buf)
}

#[handler]
fn healthz() -> &'static str {
    "ok"
}

#[handler]
fn debug_vars() -> poem::web::Json<serde_json::Value> {
    poem::web::Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Serves the Prometheus exposition endpoint until cancelled.
pub async fn run_metrics_server(
    port: u16,
    path: String,
    cancellation_token: CancellationToken,
) -> Result<(), Report<MetricsError>> {
    let listen_addr = format!("0.0.0.0:{port}");
    info!("starting metrics server on {listen_addr}");

    let app = Route::new().at(format!("/{}", path.trim_start_matches('/')), get(serve_metrics));

    Server::new(TcpListener::bind(listen_addr))
        .run_with_graceful_shutdown(app, cancellation_token.cancelled_owned(), None)
        .await
        .change_context(MetricsError::ServerError {
            message: "metrics server exited with error".to_string(),
        })
}

/// Serves the debug endpoints (`/healthz`, `/debug/vars`) until cancelled.
pub async fn run_debug_server(
    port: u16,
    cancellation_token: CancellationToken,
) -> Result<(), Report<MetricsError>> {
    let listen_addr = format!("0.0.0.0:{port}");
    info!("starting debug server on {listen_addr}");

    let app = Route::new()
        .at("/healthz", get(healthz))
        .at("/debug/vars", get(debug_vars));

    Server::new(TcpListener::bind(listen_addr))
        .run_with_graceful_shutdown(app, cancellation_token.cancelled_owned(), None)
        .await
        .change_context(MetricsError::ServerError {
            message: "debug server exited with error".to_string(),
        })
}
