use ember_types::{ServiceTransaction, H256};
use lru::LruCache;
use parking_lot::Mutex;

const PENDING_STX_SIZE: usize = 512;

/// Service transactions whose validation failed while their payment
/// reference was present; parked for a later retry. Bounded, oldest
/// insertion evicted first.
pub struct PendingStxPool {
    inner: Mutex<LruCache<H256, PendingEntry>>,
}

struct PendingEntry {
    stx: ServiceTransaction,
    since: u64,
}

impl PendingStxPool {
    pub fn new() -> PendingStxPool {
        PendingStxPool {
            inner: Mutex::new(LruCache::new(PENDING_STX_SIZE)),
        }
    }

    /// Park an entry; the first arrival time wins for an already-parked hash.
    pub fn insert(&self, stx: ServiceTransaction, now: u64) {
        let mut guard = self.inner.lock();
        let hash = stx.hash();
        if guard.contains(&hash) {
            return;
        }
        guard.put(hash, PendingEntry { stx, since: now });
    }

    pub fn contains(&self, hash: &H256) -> bool {
        self.inner.lock().contains(hash)
    }

    pub fn remove(&self, hash: &H256) -> Option<ServiceTransaction> {
        self.inner.lock().pop(hash).map(|entry| entry.stx)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Oldest parked timestamp, for diagnostics.
    pub fn oldest_since(&self) -> Option<u64> {
        self.inner
            .lock()
            .iter()
            .map(|(_, entry)| entry.since)
            .min()
    }
}

impl Default for PendingStxPool {
    fn default() -> Self {
        PendingStxPool::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stx(seed: u16) -> ServiceTransaction {
        ServiceTransaction {
            version: 1,
            payment_reference: H256::default(),
            op_code: seed,
            payload: seed.to_le_bytes().to_vec(),
        }
    }

    #[test]
    fn bounded_by_insertion_order() {
        let pool = PendingStxPool::new();
        for seed in 0..=PENDING_STX_SIZE {
            pool.insert(stx(seed as u16), seed as u64);
        }
        assert_eq!(pool.len(), PENDING_STX_SIZE);
    }

    #[test]
    fn first_arrival_wins() {
        let pool = PendingStxPool::new();
        let entry = stx(7);
        pool.insert(entry.clone(), 5);
        pool.insert(entry.clone(), 9);
        assert_eq!(pool.oldest_since(), Some(5));
        assert_eq!(pool.remove(&entry.hash()), Some(entry));
        assert!(pool.is_empty());
    }
}
