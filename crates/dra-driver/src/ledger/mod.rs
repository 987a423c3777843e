//! Access to the per-node device ledger objects.
//!
//! Every write is a conditional replace keyed on the object's revision
//! token; a stale token surfaces as [`LedgerError::Conflict`] and is
//! retried on a refreshed snapshot by [`store::update_with_retry`].

pub mod mock;
pub mod store;
pub mod watcher;

use core::error::Error;

use derive_more::Display;

pub use store::update_with_retry;
pub use store::KubeLedgerStore;
pub use store::LedgerStore;
pub use store::MutateOutcome;
pub use store::RetrySettings;
pub use watcher::LedgerCache;
pub use watcher::LedgerWatcher;

/// Errors raised by ledger operations.
///
/// `NotFound` means the node has not registered yet; `Conflict` means the
/// revision token went stale between read and write.
#[derive(Debug, Display)]
pub enum LedgerError {
    #[display("device ledger for node {node} not found")]
    NotFound { node: String },
    #[display("conflicting write to device ledger for node {node}")]
    Conflict { node: String },
    #[display("device ledger for node {node} already exists")]
    AlreadyExists { node: String },
    #[display("device ledger API call failed: {message}")]
    Api { message: String },
    #[display("ledger operation cancelled")]
    Cancelled,
}

impl Error for LedgerError {}

impl LedgerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
