use std::time::Duration;

use async_trait::async_trait;
use dra_api::DeviceLedger;
use error_stack::Report;
use kube::api::ListParams;
use kube::api::PostParams;
use kube::Api;
use kube::Client;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::metrics::LEDGER_CONFLICT_RETRIES_TOTAL;

use super::LedgerError;

/// Storage operations on per-node device ledgers.
///
/// `update` is a conditional replace: it fails with
/// [`LedgerError::Conflict`] when the object's revision token is stale.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get(&self, node: &str) -> Result<DeviceLedger, Report<LedgerError>>;

    async fn create(&self, ledger: &DeviceLedger) -> Result<DeviceLedger, Report<LedgerError>>;

    async fn update(&self, ledger: &DeviceLedger) -> Result<DeviceLedger, Report<LedgerError>>;

    async fn list(&self) -> Result<Vec<DeviceLedger>, Report<LedgerError>>;
}

/// Outcome of a mutation closure passed to [`update_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutateOutcome {
    /// The ledger changed and must be written back.
    Changed,
    /// Nothing to write; the fresh snapshot is returned as-is.
    Unchanged,
}

/// Bounded exponential backoff for conflict retries.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub factor: u32,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(10),
            factor: 2,
            jitter: 0.2,
        }
    }
}

fn duration_with_jitter(base: Duration, jitter_percent: f64) -> Duration {
    let jitter_range = base.as_secs_f64() * jitter_percent;
    if jitter_range <= 0.0 {
        return base;
    }
    let offset = rand::rng().random_range(-jitter_range..=jitter_range);
    Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
}

/// Reads a fresh ledger snapshot, applies `mutate`, and writes it back;
/// on a revision conflict the whole read-mutate-write cycle repeats on a
/// refreshed snapshot, up to the attempt budget. The cancellation token
/// is checked between attempts.
///
/// The mutation closure runs once per attempt and must be idempotent
/// with respect to external side effects.
pub async fn update_with_retry<S, F>(
    store: &S,
    node: &str,
    cancellation_token: &CancellationToken,
    settings: &RetrySettings,
    mut mutate: F,
) -> Result<DeviceLedger, Report<LedgerError>>
where
    S: LedgerStore + ?Sized,
    F: FnMut(&mut DeviceLedger) -> Result<MutateOutcome, Report<LedgerError>>,
{
    let mut backoff = settings.initial_backoff;
    let mut attempt = 0;
    loop {
        if cancellation_token.is_cancelled() {
            return Err(Report::new(LedgerError::Cancelled));
        }

        let mut ledger = store.get(node).await?;
        if mutate(&mut ledger)? == MutateOutcome::Unchanged {
            return Ok(ledger);
        }

        match store.update(&ledger).await {
            Ok(updated) => return Ok(updated),
            Err(report) if report.current_context().is_conflict() => {
                attempt += 1;
                if attempt >= settings.attempts {
                    warn!(node, attempt, "ledger update exhausted conflict retries");
                    return Err(report);
                }
                LEDGER_CONFLICT_RETRIES_TOTAL.inc();
                debug!(node, attempt, backoff_ms = backoff.as_millis() as u64, "ledger update conflicted, retrying");
                tokio::time::sleep(duration_with_jitter(backoff, settings.jitter)).await;
                backoff *= settings.factor;
            }
            Err(report) => return Err(report),
        }
    }
}

/// [`LedgerStore`] backed by the orchestrator's object store.
pub struct KubeLedgerStore {
    api: Api<DeviceLedger>,
}

impl KubeLedgerStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

fn map_kube_error(node: &str, err: kube::Error) -> Report<LedgerError> {
    match &err {
        kube::Error::Api(response) if response.code == 404 => {
            Report::new(LedgerError::NotFound {
                node: node.to_string(),
            })
        }
        kube::Error::Api(response) if response.code == 409 => {
            Report::new(LedgerError::Conflict {
                node: node.to_string(),
            })
        }
        _ => Report::new(LedgerError::Api {
            message: err.to_string(),
        }),
    }
}

#[async_trait]
impl LedgerStore for KubeLedgerStore {
    async fn get(&self, node: &str) -> Result<DeviceLedger, Report<LedgerError>> {
        self.api.get(node).await.map_err(|e| map_kube_error(node, e))
    }

    async fn create(&self, ledger: &DeviceLedger) -> Result<DeviceLedger, Report<LedgerError>> {
        let node = ledger.node_name().to_string();
        self.api
            .create(&PostParams::default(), ledger)
            .await
            .map_err(|e| {
                if let kube::Error::Api(response) = &e {
                    if response.code == 409 {
                        return Report::new(LedgerError::AlreadyExists { node: node.clone() });
                    }
                }
                map_kube_error(&node, e)
            })
    }

    async fn update(&self, ledger: &DeviceLedger) -> Result<DeviceLedger, Report<LedgerError>> {
        let node = ledger.node_name().to_string();
        self.api
            .replace(&node, &PostParams::default(), ledger)
            .await
            .map_err(|e| map_kube_error(&node, e))
    }

    async fn list(&self) -> Result<Vec<DeviceLedger>, Report<LedgerError>> {
        let ledgers = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(|e| {
                Report::new(LedgerError::Api {
                    message: e.to_string(),
                })
            })?;
        Ok(ledgers.items)
    }
}
