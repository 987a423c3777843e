use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

use dra_api::GpuDevice;

use crate::metrics::PENDING_RESERVATIONS;

/// Default lifetime of a speculative reservation. Entries older than
/// this are dropped on the next `reserve`, so a controller crash cannot
/// leave holds pinned forever.
pub const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(5 * 60);

struct Reservation {
    devices: Vec<GpuDevice>,
    reserved_at: Instant,
}

/// Process-local speculative reservations keyed by (claim UID, node).
///
/// Authoritative only between a suitability pass and the bind that
/// follows it; the store starts empty on every controller restart,
/// forcing a fresh suitability computation.
pub struct ReservationStore {
    inner: RwLock<HashMap<(String, String), Reservation>>,
    ttl: Duration,
}

impl Default for ReservationStore {
    fn default() -> Self {
        Self::new(DEFAULT_RESERVATION_TTL)
    }
}

impl ReservationStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Records a speculative hold, replacing any prior entry for the
    /// same (claim, node) pair. Expired entries are purged first.
    pub fn reserve(&self, claim_uid: &str, node: &str, devices: Vec<GpuDevice>) {
        let mut inner = self.inner.write().expect("reservation lock poisoned");
        let now = Instant::now();
        inner.retain(|_, r| now.duration_since(r.reserved_at) < self.ttl);
        inner.insert(
            (claim_uid.to_string(), node.to_string()),
            Reservation {
                devices,
                reserved_at: now,
            },
        );
        PENDING_RESERVATIONS.set(inner.len() as i64);
    }

    pub fn lookup(&self, claim_uid: &str, node: &str) -> Option<Vec<GpuDevice>> {
        let inner = self.inner.read().expect("reservation lock poisoned");
        inner
            .get(&(claim_uid.to_string(), node.to_string()))
            .filter(|r| r.reserved_at.elapsed() < self.ttl)
            .map(|r| r.devices.clone())
    }

    pub fn release(&self, claim_uid: &str, node: &str) {
        let mut inner = self.inner.write().expect("reservation lock poisoned");
        inner.remove(&(claim_uid.to_string(), node.to_string()));
        PENDING_RESERVATIONS.set(inner.len() as i64);
    }

    /// Drops every reservation held for a claim, on any node. Used by
    /// deallocate, where the losing nodes' holds are stale by
    /// definition.
    pub fn release_claim(&self, claim_uid: &str) {
        let mut inner = self.inner.write().expect("reservation lock poisoned");
        inner.retain(|(uid, _), _| uid != claim_uid);
        PENDING_RESERVATIONS.set(inner.len() as i64);
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("reservation lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn device(uuid: &str) -> GpuDevice {
        GpuDevice {
            uuid: uuid.to_string(),
            product_name: "NVIDIA Tesla V100".to_string(),
            vendor: "nvidia.com".to_string(),
        }
    }

    #[test]
    fn reserve_replaces_the_prior_entry() {
        let store = ReservationStore::default();
        store.reserve("c1", "node-0", vec![device("u1")]);
        store.reserve("c1", "node-0", vec![device("u2")]);

        let devices = store.lookup("c1", "node-0").expect("should find reservation");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].uuid, "u2");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn release_is_scoped_to_the_node() {
        let store = ReservationStore::default();
        store.reserve("c1", "node-0", vec![device("u1")]);
        store.reserve("c1", "node-1", vec![device("u2")]);

        store.release("c1", "node-0");
        assert!(store.lookup("c1", "node-0").is_none());
        assert!(store.lookup("c1", "node-1").is_some());
    }

    #[test]
    fn release_claim_drops_every_node() {
        let store = ReservationStore::default();
        store.reserve("c1", "node-0", vec![device("u1")]);
        store.reserve("c1", "node-1", vec![device("u2")]);
        store.reserve("c2", "node-0", vec![device("u3")]);

        store.release_claim("c1");
        assert!(store.lookup("c1", "node-0").is_none());
        assert!(store.lookup("c1", "node-1").is_none());
        assert!(store.lookup("c2", "node-0").is_some());
    }

    #[test]
    fn expired_entries_are_invisible_and_purged() {
        let store = ReservationStore::new(Duration::ZERO);
        store.reserve("c1", "node-0", vec![device("u1")]);
        assert!(
            store.lookup("c1", "node-0").is_none(),
            "zero TTL should expire immediately"
        );

        store.reserve("c2", "node-0", vec![device("u2")]);
        assert_eq!(store.len(), 1, "expired entry should be purged on reserve");
    }
}
