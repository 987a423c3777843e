//! In-memory [`LedgerStore`] with real revision tokens and injectable
//! write conflicts. Backs the unit and scenario tests; no cluster
//! required.

use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::RwLock;

use async_trait::async_trait;
use dra_api::DeviceLedger;
use error_stack::Report;

use super::store::LedgerStore;
use super::LedgerError;

#[derive(Default)]
pub struct InMemoryLedgerStore {
    ledgers: RwLock<HashMap<String, DeviceLedger>>,
    revision: AtomicU64,
    conflicts_to_inject: AtomicU32,
    update_calls: AtomicU64,
}

impl InMemoryLedgerStore {
    /// Makes the next `n` update calls fail with a conflict, simulating
    /// a concurrent writer.
    pub fn inject_conflicts(&self, n: u32) {
        self.conflicts_to_inject.store(n, Ordering::SeqCst);
    }

    pub fn update_calls(&self) -> u64 {
        self.update_calls.load(Ordering::SeqCst)
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn take_injected_conflict(&self) -> bool {
        self.conflicts_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get(&self, node: &str) -> Result<DeviceLedger, Report<LedgerError>> {
        let ledgers = self.ledgers.read().expect("ledger lock poisoned");
        ledgers.get(node).cloned().ok_or_else(|| {
            Report::new(LedgerError::NotFound {
                node: node.to_string(),
            })
        })
    }

    async fn create(&self, ledger: &DeviceLedger) -> Result<DeviceLedger, Report<LedgerError>> {
        let node = ledger.node_name().to_string();
        let mut ledgers = self.ledgers.write().expect("ledger lock poisoned");
        if ledgers.contains_key(&node) {
            return Err(Report::new(LedgerError::AlreadyExists { node }));
        }

        let mut stored = ledger.clone();
        stored.metadata.resource_version = Some(self.next_revision());
        ledgers.insert(node, stored.clone());
        Ok(stored)
    }

    async fn update(&self, ledger: &DeviceLedger) -> Result<DeviceLedger, Report<LedgerError>> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let node = ledger.node_name().to_string();

        if self.take_injected_conflict() {
            return Err(Report::new(LedgerError::Conflict { node }));
        }

        let mut ledgers = self.ledgers.write().expect("ledger lock poisoned");
        let stored = ledgers
            .get(&node)
            .ok_or_else(|| Report::new(LedgerError::NotFound { node: node.clone() }))?;

        if stored.metadata.resource_version != ledger.metadata.resource_version {
            return Err(Report::new(LedgerError::Conflict { node }));
        }

        let mut updated = ledger.clone();
        updated.metadata.resource_version = Some(self.next_revision());
        ledgers.insert(node, updated.clone());
        Ok(updated)
    }

    async fn list(&self) -> Result<Vec<DeviceLedger>, Report<LedgerError>> {
        let ledgers = self.ledgers.read().expect("ledger lock poisoned");
        Ok(ledgers.values().cloned().collect())
    }
}
